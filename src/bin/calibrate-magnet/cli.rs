use std::path::PathBuf;

use clap::Parser;

/// Magnet calibration: drive a symmetric hysteresis loop, read the Hall
/// probe at every step and write the branch-averaged current/field curve
#[derive(Parser)]
#[clap(version)]
pub struct Cli {
    /// Peak drive current (A)
    #[arg(long, default_value = "30.0")]
    pub max_current_a: f64,

    /// Points per branch, odd so 0 A is sampled exactly
    #[arg(long, default_value = "61")]
    pub steps: u32,

    /// Teslameter range (T)
    #[arg(long, default_value = "3.0")]
    pub range_t: f64,

    /// Dwell at each current before the field read (ms)
    #[arg(long, default_value = "500")]
    pub dwell_ms: u64,

    /// Slew rate between setpoints (A/s)
    #[arg(long, default_value = "1.0")]
    pub slew_a_per_s: f64,

    /// Output .xy curve file
    #[arg(long, default_value = "DXWD-80_20mm.xy")]
    pub output: PathBuf,
}
