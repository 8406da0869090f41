pub mod sim;

use async_trait::async_trait;

use crate::error::Result;

/// One demodulated lock-in reading, volts.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub x: f64,
    pub y: f64,
}

/// Reference-channel setup, applied once per scan, never per point.
#[derive(Debug, Clone, Copy)]
pub struct LockinSettings {
    pub reference_hz: f64,
    pub time_constant_s: f64,
    pub filter_order: u8,
    pub output_vrms: f64,
}

/// Microwave generator capability.
#[async_trait]
pub trait RfSource: Send + Sync {
    async fn set_frequency(&mut self, hz: f64) -> Result<()>;
    async fn set_power(&mut self, dbm: f64) -> Result<()>;
    async fn set_output(&mut self, on: bool) -> Result<()>;
}

/// Bipolar magnet power supply capability. Ramps are commanded with an
/// explicit slew rate; the supply is expected to reach the target before
/// acknowledging.
#[async_trait]
pub trait FieldSource: Send + Sync {
    async fn ramp_to_current(&mut self, amps: f64, slew_a_per_s: f64) -> Result<()>;
    async fn read_current(&mut self) -> Result<f64>;
    async fn set_output(&mut self, on: bool) -> Result<()>;
}

/// Lock-in amplifier capability.
#[async_trait]
pub trait LockinDetector: Send + Sync {
    async fn configure(&mut self, settings: LockinSettings) -> Result<()>;
    async fn read_sample(&mut self) -> Result<RawSample>;
}

/// Modulation coil driver capability.
#[async_trait]
pub trait ModulationDriver: Send + Sync {
    async fn set_amplitude(&mut self, volts_rms: f64) -> Result<()>;
    async fn set_enabled(&mut self, on: bool) -> Result<()>;
}

/// Hall-probe teslameter capability. Only the magnet calibration routine
/// reads the field directly; scans derive it from the drive current
/// through the calibration curve.
#[async_trait]
pub trait Teslameter: Send + Sync {
    async fn set_range(&mut self, range_t: f64) -> Result<()>;
    async fn read_field(&mut self) -> Result<f64>;
}

/// The fixed instrument topology of one spectrometer.
pub struct DeviceSet {
    pub rf: Box<dyn RfSource>,
    pub field: Box<dyn FieldSource>,
    pub lockin: Box<dyn LockinDetector>,
    pub modulation: Box<dyn ModulationDriver>,
}
