mod cli;

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fmr_acquire::calibration::{CalibrationCurve, CalibrationSample};
use fmr_acquire::devices::sim::{SimBench, SimOptions};
use fmr_acquire::{Config, Interlock};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calibrate_magnet=info,fmr_acquire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    anyhow::ensure!(
        args.steps >= 3 && args.steps % 2 == 1,
        "--steps must be an odd number of at least 3 so 0 A is sampled exactly"
    );

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
    let mut interlock = Interlock::new(config.interlock_limits);

    // saturation bent into the simulated magnet so the recorded curve has
    // genuine curvature to interpolate over
    let bench = SimBench::new(SimOptions {
        saturation_per_a: 0.004,
        ..SimOptions::default()
    });
    let mut devices = bench.devices();
    let mut probe = bench.teslameter();

    probe.set_range(args.range_t).await?;

    let branch: Vec<f64> = (0..args.steps)
        .map(|i| {
            -args.max_current_a
                + 2.0 * args.max_current_a * i as f64 / (args.steps - 1) as f64
        })
        .collect();
    let loop_currents: Vec<f64> = branch
        .iter()
        .copied()
        .chain(branch.iter().rev().copied())
        .collect();

    tracing::info!(
        "hysteresis loop: {} steps over ±{} A, dwell {} ms",
        loop_currents.len(),
        args.max_current_a,
        args.dwell_ms
    );

    let dwell = Duration::from_millis(args.dwell_ms);

    interlock.check_ramp(loop_currents[0], 2.0 * args.slew_a_per_s)?;
    devices.field.set_output(true).await?;
    devices
        .field
        .ramp_to_current(loop_currents[0], 2.0 * args.slew_a_per_s)
        .await?;
    tokio::time::sleep(dwell * 10).await;

    let mut fields = Vec::with_capacity(loop_currents.len());
    for &current_a in &loop_currents {
        interlock.check_ramp(current_a, args.slew_a_per_s)?;
        devices
            .field
            .ramp_to_current(current_a, args.slew_a_per_s)
            .await?;
        tokio::time::sleep(dwell).await;

        let field_t = probe.read_field().await?;
        println!("{current_a:>12.8} {field_t:>12.8}");
        fields.push(field_t);
    }

    interlock.check_ramp(0.0, 2.0 * args.slew_a_per_s)?;
    devices
        .field
        .ramp_to_current(0.0, 2.0 * args.slew_a_per_s)
        .await?;
    devices.field.set_output(false).await?;

    // average the up and down branches, then subtract the zero-current
    // field so remanence does not offset the curve
    let up = &fields[..branch.len()];
    let down = &fields[branch.len()..];
    let mut averaged: Vec<f64> = up
        .iter()
        .zip(down.iter().rev())
        .map(|(a, b)| (a + b) / 2.0)
        .collect();
    let offset = averaged[branch.len() / 2];
    for field_t in &mut averaged {
        *field_t -= offset;
    }

    let name = args
        .output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("calibration");
    let samples = branch
        .iter()
        .zip(&averaged)
        .map(|(&current_a, &field_t)| CalibrationSample { current_a, field_t })
        .collect();
    let curve = CalibrationCurve::from_samples(name, samples)?;
    curve.save(&args.output)?;

    tracing::info!(
        "curve '{}' with {} samples written to {}",
        curve.name(),
        curve.samples().len(),
        args.output.display()
    );

    Ok(())
}
