mod cli;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fmr_acquire::calibration::{CalibrationCurve, CalibrationSample, CurveStore};
use fmr_acquire::devices::sim::{SimBench, SimOptions};
use fmr_acquire::{
    Acquisition, Config, InterlockLimits, MeasurementPoint, ResultSink, ScanPhase, ScanSnapshot,
    ScanSpec, ScanSummary,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fmr_scan=info,fmr_acquire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Loading config...");
    let config = match Config::load() {
        Ok((config, path)) => {
            tracing::info!("config: {}", path.display());
            config
        }
        Err(e) => {
            tracing::warn!("{e}; using built-in defaults");
            Config::default()
        }
    };
    tracing::info!("\n{config}");

    let spec = args.scan_spec()?;
    tracing::info!(
        "{} frequencies x {} fields = {} points, {} geometry",
        spec.frequencies_hz.len(),
        spec.fields_t.len(),
        spec.frequencies_hz.len() * spec.fields_t.len(),
        spec.geometry
    );

    let store = CurveStore::from_config(&config)?;
    let curve = match &args.curve {
        Some(path) => Arc::new(CalibrationCurve::load(path)?),
        None => match store.get(args.geometry) {
            Ok(curve) => curve,
            Err(e) => {
                tracing::warn!(
                    "no stored curve for {} ({e}), using the simulated bench constant",
                    args.geometry
                );
                Arc::new(sim_curve(&config.interlock_limits)?)
            }
        },
    };
    let (field_min_t, field_max_t) = curve.field_range();
    tracing::info!(
        "calibration curve '{}': {:.1}..{:.1} mT",
        curve.name(),
        field_min_t * 1e3,
        field_max_t * 1e3
    );
    let _curve_lock = store.lock_for_scan();

    let bench = SimBench::with_defaults();
    let sink = DataFileSink::new(args.output_dir.clone(), spec.clone());

    let handle = Acquisition::start(config, bench.devices(), curve, spec, sink)?;
    let mut snapshots = handle.subscribe();

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                tracing::warn!("interrupted, aborting scan");
                interrupted = true;
                handle.abort().await;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow().clone();
                print_snapshot(&snapshot);
                if matches!(snapshot.phase, ScanPhase::Completed | ScanPhase::Failed) {
                    break;
                }
            }
        }
    }

    let summary = handle.wait().await?;
    tracing::info!(
        "scan {}: {} of {} points emitted ({} degraded, {} samples rejected) in {:.1} s",
        if summary.aborted { "aborted" } else { "complete" },
        summary.emitted,
        summary.total_points,
        summary.degraded,
        summary.rejected_samples,
        summary.elapsed.as_secs_f64()
    );

    Ok(())
}

fn print_snapshot(snapshot: &ScanSnapshot) {
    if let Some(message) = &snapshot.message {
        println!(
            "[{:>7.1}s] {}: {message}",
            snapshot.elapsed.as_secs_f64(),
            snapshot.phase
        );
    } else if let Some(point) = &snapshot.last_point {
        println!(
            "[{:>7.1}s] {:<11} {:>4}/{} | {:>6.2} GHz {:>9.3} mT -> {:>12.5e} V{}",
            snapshot.elapsed.as_secs_f64(),
            snapshot.phase.to_string(),
            snapshot.emitted,
            snapshot.total_points,
            point.frequency_hz * 1e-9,
            point.field_measured_t * 1e3,
            point.calibrated_signal,
            if point.degraded { " (degraded)" } else { "" },
        );
    } else {
        println!(
            "[{:>7.1}s] {}",
            snapshot.elapsed.as_secs_f64(),
            snapshot.phase
        );
    }
}

/// Linear curve matching the simulated magnet, for runs without a stored
/// calibration file.
fn sim_curve(limits: &InterlockLimits) -> fmr_acquire::Result<CalibrationCurve> {
    let coil_t_per_a = SimOptions::default().coil_t_per_a;
    let samples = (-20..=20)
        .map(|i| {
            let current_a = limits.max_current_a * i as f64 / 20.0;
            CalibrationSample {
                current_a,
                field_t: coil_t_per_a * current_a,
            }
        })
        .collect();
    CalibrationCurve::from_samples("simulated-bench", samples)
}

/// Collects points per frequency and writes the two-column field/signal
/// text files at finalize, plus a scan.json carrying the spec and the
/// run summary.
struct DataFileSink {
    dir: PathBuf,
    spec: ScanSpec,
    datasets: Vec<(f64, Vec<(f64, f64)>)>,
}

impl DataFileSink {
    fn new(dir: PathBuf, spec: ScanSpec) -> Self {
        Self {
            dir,
            spec,
            datasets: Vec::new(),
        }
    }
}

#[async_trait]
impl ResultSink for DataFileSink {
    async fn emit(&mut self, point: MeasurementPoint) -> fmr_acquire::Result<()> {
        let row = match self
            .datasets
            .iter()
            .position(|(f, _)| *f == point.frequency_hz)
        {
            Some(row) => row,
            None => {
                self.datasets.push((point.frequency_hz, Vec::new()));
                self.datasets.len() - 1
            }
        };
        self.datasets[row]
            .1
            .push((point.field_measured_t, point.calibrated_signal));
        Ok(())
    }

    async fn finalize(&mut self, summary: ScanSummary) -> fmr_acquire::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        for (frequency_hz, rows) in &self.datasets {
            let path = self.dir.join(format!("{:.2}GHz.txt", frequency_hz * 1e-9));
            let mut out = std::fs::File::create(&path)?;
            for (field_t, signal) in rows {
                writeln!(out, "{field_t:>14.10} {signal:>14.10}")?;
            }
        }

        let meta = serde_json::json!({ "Spec": &self.spec, "Summary": summary });
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| fmr_acquire::Error::Sink(e.to_string()))?;
        std::fs::write(self.dir.join("scan.json"), json)?;

        tracing::info!(
            "{} data files written to {}",
            self.datasets.len(),
            self.dir.display()
        );
        Ok(())
    }
}
