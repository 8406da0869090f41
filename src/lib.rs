mod acquisition;
mod config;
mod error;
mod interlock;
mod point;
mod sink;
mod sweep;

pub mod calibration;
pub mod devices;
pub mod stats;

use serde::{Deserialize, Serialize};

pub use acquisition::{Acquisition, ScanCommand, ScanHandle, ScanPhase, ScanSnapshot, READ_RETRIES};
pub use config::{Config, RfPowerConfig, SignalScaleConfig};
pub use error::{Error, Result};
pub use interlock::{Interlock, InterlockLimits};
pub use point::{MeasurementPoint, ScanSummary};
pub use sink::{MemorySink, ResultSink};
pub use sweep::{ScanSpec, SweepOrder, SweepPoint, SweepSequence};

/// Orientation of the modulation coil pair relative to the sample plane.
/// Each geometry has its own magnet calibration curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoilGeometry {
    InPlane,
    OutOfPlane,
}

impl std::fmt::Display for CoilGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoilGeometry::InPlane => write!(f, "in-plane"),
            CoilGeometry::OutOfPlane => write!(f, "out-of-plane"),
        }
    }
}

impl std::str::FromStr for CoilGeometry {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ip" | "in-plane" | "inplane" => Ok(CoilGeometry::InPlane),
            "oop" | "out-of-plane" | "outofplane" => Ok(CoilGeometry::OutOfPlane),
            other => Err(format!("unknown coil geometry '{other}', expected ip or oop")),
        }
    }
}
