use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::interlock::InterlockLimits;

/// RF output power as a linear function of frequency, rounded to the
/// generator's 0.5 dBm step. Tuned so the detector diode voltage stays
/// roughly constant across the band while maxing out at the top frequency.
#[derive(Deserialize, Clone, Copy, Serialize)]
pub struct RfPowerConfig {
    #[serde(rename = "MinDbm")]
    pub min_dbm: f64,

    #[serde(rename = "MaxDbm")]
    pub max_dbm: f64,

    #[serde(rename = "MinFrequencyHz")]
    pub min_frequency_hz: f64,

    #[serde(rename = "MaxFrequencyHz")]
    pub max_frequency_hz: f64,
}

impl RfPowerConfig {
    pub fn power_for(&self, frequency_hz: f64) -> f64 {
        let span = self.max_frequency_hz - self.min_frequency_hz;
        let p = self.min_dbm
            + (self.max_dbm - self.min_dbm) * (frequency_hz - self.min_frequency_hz) / span;
        (p * 2.0).round() / 2.0
    }
}

#[derive(Deserialize, Clone, Copy, Serialize)]
pub struct SignalScaleConfig {
    #[serde(rename = "ScaleFactor")]
    pub scale_factor: f64,

    #[serde(rename = "DetectorGain")]
    pub detector_gain: f64,

    #[serde(rename = "LinearRangeV")]
    pub linear_range_v: f64,
}

#[derive(Deserialize, Clone, Serialize)]
pub struct Config {
    #[serde(rename = "RfSourcePort")]
    pub rf_source_port: String,

    #[serde(rename = "FieldSupplyAddress")]
    pub field_supply_address: String,

    #[serde(rename = "LockinAddress")]
    pub lockin_address: String,

    #[serde(rename = "TeslameterPort")]
    pub teslameter_port: String,

    #[serde(rename = "PortTimeoutMs")]
    pub port_timeout_ms: u64,

    #[serde(rename = "CalibrationDir")]
    pub calibration_dir: Option<PathBuf>,

    #[serde(rename = "InPlaneCurve")]
    pub in_plane_curve: String,

    #[serde(rename = "OutOfPlaneCurve")]
    pub out_of_plane_curve: String,

    #[serde(rename = "ModulationFrequencyHz")]
    pub modulation_frequency_hz: f64,

    #[serde(rename = "ModulationVoltsPerTesla")]
    pub modulation_volts_per_tesla: f64,

    #[serde(rename = "TimeConstantMultiplier")]
    pub time_constant_multiplier: f64,

    #[serde(rename = "RestSlewAPerS")]
    pub rest_slew_a_per_s: f64,

    #[serde(rename = "InitialSettleMs")]
    pub initial_settle_ms: u64,

    #[serde(rename = "IdleFrequencyHz")]
    pub idle_frequency_hz: f64,

    #[serde(rename = "RfPower")]
    pub rf_power: RfPowerConfig,

    #[serde(rename = "SignalScale")]
    pub signal_scale: SignalScaleConfig,

    #[serde(rename = "InterlockLimits")]
    pub interlock_limits: InterlockLimits,
}

impl Config {
    pub fn load() -> crate::Result<(Self, PathBuf)> {
        use std::path;

        let base_dirs = directories::BaseDirs::new()
            .ok_or_else(|| crate::Error::Config("failed to resolve config directory".into()))?;

        let path = base_dirs
            .config_dir()
            .join(path::Path::new("fmr-acquire"))
            .join(path::Path::new("config.json"));

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            crate::Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = serde_json::from_str::<Config>(&contents)
            .map_err(|e| crate::Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;

        Ok((config, path))
    }

    /// Rejects settings that would let the startup/rest sequence itself
    /// violate the interlock.
    pub fn validate(&self) -> crate::Result<()> {
        if self.port_timeout_ms == 0 {
            return Err(crate::Error::Config("PortTimeoutMs must be positive".into()));
        }
        if !(self.rest_slew_a_per_s > 0.0) {
            return Err(crate::Error::Config("RestSlewAPerS must be positive".into()));
        }
        if self.rest_slew_a_per_s > self.interlock_limits.max_slew_a_per_s {
            return Err(crate::Error::Config(format!(
                "RestSlewAPerS {} exceeds MaxSlewAPerS {}",
                self.rest_slew_a_per_s, self.interlock_limits.max_slew_a_per_s
            )));
        }
        if !(self.modulation_volts_per_tesla > 0.0) {
            return Err(crate::Error::Config(
                "ModulationVoltsPerTesla must be positive".into(),
            ));
        }
        if !(self.time_constant_multiplier >= 1.0) {
            return Err(crate::Error::Config(
                "TimeConstantMultiplier must be at least 1".into(),
            ));
        }
        if self.rf_power.max_frequency_hz <= self.rf_power.min_frequency_hz {
            return Err(crate::Error::Config(
                "RfPower frequency range is empty".into(),
            ));
        }
        self.interlock_limits.validate()?;
        Ok(())
    }

    pub fn curve_file(&self, geometry: crate::CoilGeometry) -> &str {
        match geometry {
            crate::CoilGeometry::InPlane => &self.in_plane_curve,
            crate::CoilGeometry::OutOfPlane => &self.out_of_plane_curve,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rf_source_port: "COM8".to_owned(),
            field_supply_address: "192.168.0.11:10001".to_owned(),
            lockin_address: "192.168.0.16".to_owned(),
            teslameter_port: "COM9".to_owned(),
            port_timeout_ms: 1000,
            calibration_dir: None,
            in_plane_curve: "DXWD-80_20mm.xy".to_owned(),
            out_of_plane_curve: "DXWD-80_5mm.xy".to_owned(),
            modulation_frequency_hz: 423.0,
            modulation_volts_per_tesla: 100.0,
            time_constant_multiplier: 15.0,
            rest_slew_a_per_s: 0.5,
            initial_settle_ms: 2000,
            idle_frequency_hz: 10e9,
            rf_power: RfPowerConfig {
                min_dbm: 0.5,
                max_dbm: 15.0,
                min_frequency_hz: 1e9,
                max_frequency_hz: 30e9,
            },
            signal_scale: SignalScaleConfig {
                scale_factor: 1.0,
                detector_gain: 1.0,
                linear_range_v: 1.0,
            },
            interlock_limits: InterlockLimits {
                max_current_a: 30.0,
                max_field_t: 1.2,
                max_frequency_hz: 30e9,
                max_power_dbm: 15.0,
                max_slew_a_per_s: 2.0,
                max_modulation_vrms: 1.0,
            },
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "RfSourcePort: {}", self.rf_source_port)?;
        writeln!(f, "FieldSupplyAddress: {}", self.field_supply_address)?;
        writeln!(f, "LockinAddress: {}", self.lockin_address)?;
        writeln!(f, "TeslameterPort: {}", self.teslameter_port)?;
        writeln!(f, "PortTimeoutMs: {}", self.port_timeout_ms)?;
        writeln!(f, "CalibrationDir: {:?}", self.calibration_dir)?;
        writeln!(f, "InPlaneCurve: {}", self.in_plane_curve)?;
        writeln!(f, "OutOfPlaneCurve: {}", self.out_of_plane_curve)?;
        writeln!(f, "ModulationFrequencyHz: {}", self.modulation_frequency_hz)?;
        writeln!(
            f,
            "ModulationVoltsPerTesla: {}",
            self.modulation_volts_per_tesla
        )?;
        writeln!(f, "TimeConstantMultiplier: {}", self.time_constant_multiplier)?;
        writeln!(f, "RestSlewAPerS: {}", self.rest_slew_a_per_s)?;
        writeln!(f, "InitialSettleMs: {}", self.initial_settle_ms)?;
        writeln!(f, "IdleFrequencyHz: {}", self.idle_frequency_hz)?;

        writeln!(f, "RfPower:")?;
        writeln!(f, "  MinDbm: {}", self.rf_power.min_dbm)?;
        writeln!(f, "  MaxDbm: {}", self.rf_power.max_dbm)?;
        writeln!(f, "  MinFrequencyHz: {}", self.rf_power.min_frequency_hz)?;
        writeln!(f, "  MaxFrequencyHz: {}", self.rf_power.max_frequency_hz)?;

        writeln!(f, "SignalScale:")?;
        writeln!(f, "  ScaleFactor: {}", self.signal_scale.scale_factor)?;
        writeln!(f, "  DetectorGain: {}", self.signal_scale.detector_gain)?;
        writeln!(f, "  LinearRangeV: {}", self.signal_scale.linear_range_v)?;

        writeln!(f, "InterlockLimits:")?;
        writeln!(f, "  MaxCurrentA: {}", self.interlock_limits.max_current_a)?;
        writeln!(f, "  MaxFieldT: {}", self.interlock_limits.max_field_t)?;
        writeln!(f, "  MaxFrequencyHz: {}", self.interlock_limits.max_frequency_hz)?;
        writeln!(f, "  MaxPowerDbm: {}", self.interlock_limits.max_power_dbm)?;
        writeln!(f, "  MaxSlewAPerS: {}", self.interlock_limits.max_slew_a_per_s)?;
        writeln!(
            f,
            "  MaxModulationVrms: {}",
            self.interlock_limits.max_modulation_vrms
        )?;
        Ok(())
    }
}
