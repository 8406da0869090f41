//! Simulated spectrometer bench. The lock-in synthesizes the derivative
//! of a Lorentzian absorption line centered on the in-plane Kittel
//! resonance field, so end-to-end scans produce plausible spectra without
//! hardware attached.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::{
    DeviceSet, FieldSource, LockinDetector, LockinSettings, ModulationDriver, RawSample, RfSource,
    Teslameter,
};
use crate::error::{Error, Result};

const MU0: f64 = 1.2566e-6;
const E_CHARGE: f64 = 1.602e-19;
const M_ELECTRON: f64 = 9.11e-31;

#[derive(Debug, Clone, Copy)]
pub struct SimOptions {
    /// Linear coil constant of the simulated magnet, tesla per ampere.
    pub coil_t_per_a: f64,
    /// Effective magnetization of the simulated film, A/m.
    pub magnetization_a_per_m: f64,
    pub g_factor: f64,
    pub damping: f64,
    pub inhomogeneous_broadening_t: f64,
    pub signal_amplitude_v: f64,
    pub noise_v: f64,
    /// Fractional loss of coil constant per ampere, models pole-piece
    /// saturation. 0 keeps the magnet perfectly linear.
    pub saturation_per_a: f64,
    pub teslameter_noise_t: f64,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            coil_t_per_a: 0.02,
            magnetization_a_per_m: 1000e3,
            g_factor: 2.1,
            damping: 0.006,
            inhomogeneous_broadening_t: 1e-3,
            signal_amplitude_v: 10e-3,
            noise_v: 20e-6,
            saturation_per_a: 0.0,
            teslameter_noise_t: 10e-6,
        }
    }
}

struct SimState {
    options: SimOptions,

    current_a: f64,
    field_on: bool,

    frequency_hz: f64,
    power_dbm: f64,
    rf_on: bool,

    modulation_vrms: f64,
    modulation_on: bool,

    lockin: Option<LockinSettings>,

    fail_reads: u32,
    hang_reads: bool,
    sample_offsets: VecDeque<f64>,
}

/// Readback of the whole simulated bench, for assertions.
#[derive(Debug, Clone, Copy)]
pub struct SimSnapshot {
    pub current_a: f64,
    pub field_on: bool,
    pub frequency_hz: f64,
    pub power_dbm: f64,
    pub rf_on: bool,
    pub modulation_vrms: f64,
    pub modulation_on: bool,
    pub lockin_configured: bool,
}

#[derive(Clone)]
pub struct SimBench {
    state: Arc<Mutex<SimState>>,
}

impl SimBench {
    pub fn new(options: SimOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                options,
                current_a: 0.0,
                field_on: false,
                frequency_hz: 0.0,
                power_dbm: 0.0,
                rf_on: false,
                modulation_vrms: 0.0,
                modulation_on: false,
                lockin: None,
                fail_reads: 0,
                hang_reads: false,
                sample_offsets: VecDeque::new(),
            })),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SimOptions::default())
    }

    pub fn devices(&self) -> DeviceSet {
        DeviceSet {
            rf: Box::new(SimRfSource { state: self.state.clone() }),
            field: Box::new(SimFieldSource { state: self.state.clone() }),
            lockin: Box::new(SimLockin { state: self.state.clone() }),
            modulation: Box::new(SimModulation { state: self.state.clone() }),
        }
    }

    pub fn snapshot(&self) -> SimSnapshot {
        let s = lock(&self.state);
        SimSnapshot {
            current_a: s.current_a,
            field_on: s.field_on,
            frequency_hz: s.frequency_hz,
            power_dbm: s.power_dbm,
            rf_on: s.rf_on,
            modulation_vrms: s.modulation_vrms,
            modulation_on: s.modulation_on,
            lockin_configured: s.lockin.is_some(),
        }
    }

    /// The next `count` detector reads fail with a comm error.
    pub fn fail_next_reads(&self, count: u32) {
        lock(&self.state).fail_reads = count;
    }

    /// Detector reads stop returning until cleared; exercises the
    /// per-read timeout path.
    pub fn hang_reads(&self, on: bool) {
        lock(&self.state).hang_reads = on;
    }

    /// Adds `volts` to one upcoming sample, queued in call order.
    pub fn offset_next_sample(&self, volts: f64) {
        lock(&self.state).sample_offsets.push_back(volts);
    }

    /// The Hall probe is not part of the scan topology; only the magnet
    /// calibration routine holds one.
    pub fn teslameter(&self) -> Box<dyn Teslameter> {
        Box::new(SimTeslameter {
            state: self.state.clone(),
            range_t: 3.0,
        })
    }
}

fn lock(state: &Arc<Mutex<SimState>>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimState {
    fn field_t(&self) -> f64 {
        if !self.field_on {
            return 0.0;
        }
        let linear = self.current_a * self.options.coil_t_per_a;
        linear * (1.0 - self.options.saturation_per_a * self.current_a.abs())
    }

    fn kittel_resonance_field(&self) -> f64 {
        let gamma_prime =
            self.options.g_factor * E_CHARGE / (2.0 * M_ELECTRON) / (2.0 * std::f64::consts::PI);
        let m = MU0 * self.options.magnetization_a_per_m;
        -m / 2.0 + (m * m / 4.0 + (self.frequency_hz / gamma_prime).powi(2)).sqrt()
    }

    fn linewidth(&self) -> f64 {
        let gamma_prime =
            self.options.g_factor * E_CHARGE / (2.0 * M_ELECTRON) / (2.0 * std::f64::consts::PI);
        self.options.damping * self.frequency_hz / gamma_prime
            + self.options.inhomogeneous_broadening_t
    }

    fn demod_sample(&mut self) -> RawSample {
        let mut rng = rand::thread_rng();
        let noise = self.options.noise_v;

        let mut x = rng.gen_range(-noise..=noise);
        let y = rng.gen_range(-noise..=noise);

        if self.rf_on && self.modulation_on && self.field_on {
            let delta = self.field_t() - self.kittel_resonance_field();
            let width = self.linewidth();
            let u = delta / width;
            // derivative-of-Lorentzian line shape, peak magnitude ~0.65 A
            x += -self.options.signal_amplitude_v * 2.0 * u / (1.0 + u * u).powi(2);
        }

        if let Some(offset) = self.sample_offsets.pop_front() {
            x += offset;
        }

        RawSample { x, y }
    }
}

struct SimRfSource {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl RfSource for SimRfSource {
    async fn set_frequency(&mut self, hz: f64) -> Result<()> {
        lock(&self.state).frequency_hz = hz;
        Ok(())
    }

    async fn set_power(&mut self, dbm: f64) -> Result<()> {
        lock(&self.state).power_dbm = dbm;
        Ok(())
    }

    async fn set_output(&mut self, on: bool) -> Result<()> {
        lock(&self.state).rf_on = on;
        Ok(())
    }
}

struct SimFieldSource {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl FieldSource for SimFieldSource {
    async fn ramp_to_current(&mut self, amps: f64, slew_a_per_s: f64) -> Result<()> {
        if !(slew_a_per_s > 0.0) {
            return Err(Error::DeviceComm {
                device: "field source",
                message: format!("refused ramp with slew {slew_a_per_s} A/s"),
            });
        }
        lock(&self.state).current_a = amps;
        Ok(())
    }

    async fn read_current(&mut self) -> Result<f64> {
        Ok(lock(&self.state).current_a)
    }

    async fn set_output(&mut self, on: bool) -> Result<()> {
        lock(&self.state).field_on = on;
        Ok(())
    }
}

struct SimLockin {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl LockinDetector for SimLockin {
    async fn configure(&mut self, settings: LockinSettings) -> Result<()> {
        lock(&self.state).lockin = Some(settings);
        Ok(())
    }

    async fn read_sample(&mut self) -> Result<RawSample> {
        let hang = lock(&self.state).hang_reads;
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut state = lock(&self.state);
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(Error::DeviceComm {
                device: "lock-in",
                message: "demodulator returned no sample".into(),
            });
        }
        Ok(state.demod_sample())
    }
}

struct SimTeslameter {
    state: Arc<Mutex<SimState>>,
    range_t: f64,
}

#[async_trait]
impl Teslameter for SimTeslameter {
    async fn set_range(&mut self, range_t: f64) -> Result<()> {
        if !(range_t > 0.0 && range_t.is_finite()) {
            return Err(Error::DeviceComm {
                device: "teslameter",
                message: format!("refused range {range_t} T"),
            });
        }
        self.range_t = range_t;
        Ok(())
    }

    async fn read_field(&mut self) -> Result<f64> {
        let state = lock(&self.state);
        let field = state.field_t();
        if field.abs() > self.range_t {
            return Err(Error::DeviceComm {
                device: "teslameter",
                message: format!("field {field} T over the {} T range", self.range_t),
            });
        }
        let noise = state.options.teslameter_noise_t;
        let mut rng = rand::thread_rng();
        Ok(field + rng.gen_range(-noise..=noise))
    }
}

struct SimModulation {
    state: Arc<Mutex<SimState>>,
}

#[async_trait]
impl ModulationDriver for SimModulation {
    async fn set_amplitude(&mut self, volts_rms: f64) -> Result<()> {
        lock(&self.state).modulation_vrms = volts_rms;
        Ok(())
    }

    async fn set_enabled(&mut self, on: bool) -> Result<()> {
        lock(&self.state).modulation_on = on;
        Ok(())
    }
}
