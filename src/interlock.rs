use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hard instrument bounds. Loaded once at startup, never mutated while a
/// scan is running.
#[derive(Deserialize, Clone, Copy, Serialize)]
pub struct InterlockLimits {
    #[serde(rename = "MaxCurrentA")]
    pub max_current_a: f64,

    #[serde(rename = "MaxFieldT")]
    pub max_field_t: f64,

    #[serde(rename = "MaxFrequencyHz")]
    pub max_frequency_hz: f64,

    #[serde(rename = "MaxPowerDbm")]
    pub max_power_dbm: f64,

    #[serde(rename = "MaxSlewAPerS")]
    pub max_slew_a_per_s: f64,

    #[serde(rename = "MaxModulationVrms")]
    pub max_modulation_vrms: f64,
}

impl InterlockLimits {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("MaxCurrentA", self.max_current_a),
            ("MaxFieldT", self.max_field_t),
            ("MaxFrequencyHz", self.max_frequency_hz),
            ("MaxSlewAPerS", self.max_slew_a_per_s),
            ("MaxModulationVrms", self.max_modulation_vrms),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(Error::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if !self.max_power_dbm.is_finite() {
            return Err(Error::Config("MaxPowerDbm must be finite".into()));
        }
        Ok(())
    }
}

/// Gates every setpoint before it reaches a device. The ramp check is
/// stateful: it compares the requested current against the previous
/// commanded one, seeded from the 0 A resting state, so a destructive
/// step cannot slip through on an otherwise in-bounds target.
pub struct Interlock {
    limits: InterlockLimits,
    last_current_a: f64,
}

impl Interlock {
    pub fn new(limits: InterlockLimits) -> Self {
        Self {
            limits,
            last_current_a: 0.0,
        }
    }

    pub fn limits(&self) -> &InterlockLimits {
        &self.limits
    }

    pub fn last_current(&self) -> f64 {
        self.last_current_a
    }

    pub fn check_frequency(&self, frequency_hz: f64) -> Result<()> {
        if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
            return Err(Error::InterlockViolation(format!(
                "frequency {frequency_hz} Hz is not a positive finite value"
            )));
        }
        if frequency_hz > self.limits.max_frequency_hz {
            return Err(Error::InterlockViolation(format!(
                "frequency {frequency_hz} Hz exceeds limit {} Hz",
                self.limits.max_frequency_hz
            )));
        }
        Ok(())
    }

    pub fn check_field(&self, field_t: f64) -> Result<()> {
        if !field_t.is_finite() || field_t.abs() > self.limits.max_field_t {
            return Err(Error::InterlockViolation(format!(
                "field {field_t} T outside ±{} T",
                self.limits.max_field_t
            )));
        }
        Ok(())
    }

    pub fn check_power(&self, power_dbm: f64) -> Result<()> {
        if !power_dbm.is_finite() || power_dbm > self.limits.max_power_dbm {
            return Err(Error::InterlockViolation(format!(
                "RF power {power_dbm} dBm exceeds limit {} dBm",
                self.limits.max_power_dbm
            )));
        }
        Ok(())
    }

    pub fn check_modulation(&self, volts_rms: f64) -> Result<()> {
        if !volts_rms.is_finite() || volts_rms < 0.0 || volts_rms > self.limits.max_modulation_vrms
        {
            return Err(Error::InterlockViolation(format!(
                "modulation amplitude {volts_rms} Vrms outside 0..{} Vrms",
                self.limits.max_modulation_vrms
            )));
        }
        Ok(())
    }

    /// Validates a ramp command and, on success, records the target as the
    /// new previous current. Must be called for every ramp, including the
    /// first of a scan and the final ramp to rest.
    pub fn check_ramp(&mut self, target_a: f64, slew_a_per_s: f64) -> Result<()> {
        if !target_a.is_finite() || target_a.abs() > self.limits.max_current_a {
            return Err(Error::InterlockViolation(format!(
                "current {target_a} A outside ±{} A",
                self.limits.max_current_a
            )));
        }
        if target_a != self.last_current_a && !(slew_a_per_s > 0.0 && slew_a_per_s.is_finite()) {
            return Err(Error::InterlockViolation(format!(
                "slew rate {slew_a_per_s} A/s is not a positive finite value"
            )));
        }
        if slew_a_per_s > self.limits.max_slew_a_per_s {
            return Err(Error::InterlockViolation(format!(
                "slew rate {slew_a_per_s} A/s from {} A to {target_a} A exceeds limit {} A/s",
                self.last_current_a, self.limits.max_slew_a_per_s
            )));
        }
        self.last_current_a = target_a;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> InterlockLimits {
        crate::Config::default().interlock_limits
    }

    #[test]
    fn ramp_within_limits_passes_and_records() {
        let mut interlock = Interlock::new(limits());
        interlock.check_ramp(5.0, 1.0).unwrap();
        assert_eq!(interlock.last_current(), 5.0);
        interlock.check_ramp(-5.0, 1.9).unwrap();
        assert_eq!(interlock.last_current(), -5.0);
    }

    #[test]
    fn slew_above_limit_always_violates() {
        let mut interlock = Interlock::new(limits());
        let max = interlock.limits().max_slew_a_per_s;
        for extra in [0.001, 0.5, 10.0] {
            let err = interlock.check_ramp(1.0, max + extra).unwrap_err();
            assert!(matches!(err, Error::InterlockViolation(_)));
            // a rejected ramp must not move the previous-current seed
            assert_eq!(interlock.last_current(), 0.0);
        }
        interlock.check_ramp(1.0, max).unwrap();
    }

    #[test]
    fn current_beyond_absolute_bound_violates() {
        let mut interlock = Interlock::new(limits());
        assert!(interlock.check_ramp(31.0, 0.5).is_err());
        assert!(interlock.check_ramp(f64::NAN, 0.5).is_err());
    }

    #[test]
    fn zero_step_needs_no_slew() {
        let mut interlock = Interlock::new(limits());
        interlock.check_ramp(0.0, 0.0).unwrap();
    }

    #[test]
    fn absolute_gates() {
        let interlock = Interlock::new(limits());
        interlock.check_frequency(30e9).unwrap();
        assert!(interlock.check_frequency(31e9).is_err());
        assert!(interlock.check_frequency(-1.0).is_err());
        interlock.check_field(-1.2).unwrap();
        assert!(interlock.check_field(1.3).is_err());
        interlock.check_modulation(0.1).unwrap();
        assert!(interlock.check_modulation(1.5).is_err());
        assert!(interlock.check_power(16.0).is_err());
    }
}
