use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;

/// One calibrated sweep coordinate. Immutable once emitted; the result
/// sink owns it from then on.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MeasurementPoint {
    pub index: usize,
    pub frequency_hz: f64,
    pub field_set_t: f64,
    /// Derived from the magnet current readback through the calibration
    /// curve, not an independent field probe.
    pub field_measured_t: f64,
    pub raw_signal_v: f64,
    pub calibrated_signal: f64,
    pub samples_used: u32,
    pub samples_rejected: u32,
    /// Too few samples survived rejection; the point is still emitted.
    pub degraded: bool,
    /// Raw signal left the detector's linear regime.
    pub clipped: bool,
    /// How far the requested field lay outside the calibration envelope,
    /// when extrapolation was explicitly enabled. 0 inside.
    pub extrapolated_t: f64,
    pub timestamp: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScanSummary {
    pub total_points: usize,
    pub emitted: usize,
    pub degraded: usize,
    pub rejected_samples: u64,
    pub elapsed: Duration,
    pub aborted: bool,
    pub completed: bool,
}
