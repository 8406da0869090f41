use thiserror::Error;

/// Convenience alias used throughout the acquisition core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid scan spec: {0}")]
    InvalidScanSpec(String),

    /// Fatal to the running scan; devices are driven to rest before this
    /// surfaces.
    #[error("interlock violation: {0}")]
    InterlockViolation(String),

    #[error("{quantity} {requested} outside calibrated range {min}..{max}")]
    OutOfCalibrationRange {
        quantity: &'static str,
        requested: f64,
        min: f64,
        max: f64,
    },

    #[error("calibration curve '{0}' is locked by a running scan")]
    CalibrationLocked(String),

    #[error("calibration data: {0}")]
    InvalidCalibration(String),

    #[error("{device}: no response within {timeout_ms} ms")]
    DeviceTimeout {
        device: &'static str,
        timeout_ms: u64,
    },

    #[error("{device}: {message}")]
    DeviceComm {
        device: &'static str,
        message: String,
    },

    #[error("result sink: {0}")]
    Sink(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("scan task failed: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that terminate a running scan (everything except the
    /// configuration-time ones, which prevent it from starting at all).
    pub fn is_fatal_to_run(&self) -> bool {
        !matches!(
            self,
            Error::InvalidScanSpec(_) | Error::Config(_) | Error::InvalidCalibration(_)
        )
    }
}
