use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use fmr_acquire::{CoilGeometry, ScanSpec, SweepOrder};

/// Broadband FMR sweep against the simulated spectrometer bench
#[derive(Parser)]
#[clap(version)]
pub struct Cli {
    /// Coil geometry selecting the magnet calibration curve (ip | oop)
    #[arg(long, default_value = "ip")]
    pub geometry: CoilGeometry,

    /// Lowest RF frequency (GHz)
    #[arg(long, default_value = "2.5")]
    pub freq_min_ghz: f64,

    /// Highest RF frequency (GHz)
    #[arg(long, default_value = "30.0")]
    pub freq_max_ghz: f64,

    /// RF frequency step (GHz)
    #[arg(long, default_value = "2.5")]
    pub freq_step_ghz: f64,

    /// Lowest field setpoint (mT)
    #[arg(long, default_value = "0.0")]
    pub field_min_mt: f64,

    /// Highest field setpoint (mT)
    #[arg(long, default_value = "400.0")]
    pub field_max_mt: f64,

    /// Field step (mT)
    #[arg(long, default_value = "2.0")]
    pub field_step_mt: f64,

    /// Field modulation amplitude (mT rms)
    #[arg(long, default_value = "0.5")]
    pub modulation_mt_rms: f64,

    /// Lock-in low-pass time constant (s)
    #[arg(long, default_value = "0.01")]
    pub time_constant_s: f64,

    /// Settle time after each setpoint change (ms)
    #[arg(long, default_value = "250")]
    pub settle_ms: u64,

    /// Samples averaged per point
    #[arg(long, default_value = "4")]
    pub averages: u32,

    /// Outlier rejection threshold (V)
    #[arg(long, default_value = "0.005")]
    pub outlier_threshold_v: f64,

    /// Alternate the frequency direction on successive field rows
    #[arg(long)]
    pub boustrophedon: bool,

    /// Allow field setpoints slightly outside the calibrated envelope
    #[arg(long)]
    pub extrapolate: bool,

    /// Magnet calibration curve (.xy), overrides the configured store
    #[arg(long)]
    pub curve: Option<PathBuf>,

    /// Output directory for the per-frequency data files
    #[arg(long, default_value = "data")]
    pub output_dir: PathBuf,
}

impl Cli {
    pub fn scan_spec(&self) -> anyhow::Result<ScanSpec> {
        anyhow::ensure!(self.freq_step_ghz > 0.0, "--freq-step-ghz must be positive");
        anyhow::ensure!(self.field_step_mt > 0.0, "--field-step-mt must be positive");

        Ok(ScanSpec {
            frequencies_hz: arange(self.freq_min_ghz, self.freq_max_ghz, self.freq_step_ghz)
                .into_iter()
                .map(|f| f * 1e9)
                .collect(),
            fields_t: arange(self.field_min_mt, self.field_max_mt, self.field_step_mt)
                .into_iter()
                .map(|b| b * 1e-3)
                .collect(),
            modulation_field_rms_t: self.modulation_mt_rms * 1e-3,
            time_constant_s: self.time_constant_s,
            settle_time: Duration::from_millis(self.settle_ms),
            averaging_count: self.averages,
            outlier_threshold: self.outlier_threshold_v,
            field_order: SweepOrder::Forward,
            frequency_order: if self.boustrophedon {
                SweepOrder::Boustrophedon
            } else {
                SweepOrder::Forward
            },
            extrapolate: self.extrapolate,
            geometry: self.geometry,
        })
    }
}

// inclusive on both ends, like the original frequency grids
fn arange(min: f64, max: f64, step: f64) -> Vec<f64> {
    itertools::iterate(min, |v| v + step)
        .take_while(|v| *v <= max + step * 1e-6)
        .collect()
}
