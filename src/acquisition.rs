//! Scan orchestration: drives the sweep sequence point by point, gates
//! every setpoint through the interlock, and emits calibrated points to
//! the result sink. A single task owns all four instruments for the
//! duration of a scan; pause/abort arrive over a control channel and are
//! honored at point boundaries and inside the settle wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::calibration::{CalibrationCurve, SignalScale};
use crate::config::Config;
use crate::devices::{DeviceSet, LockinSettings};
use crate::error::{Error, Result};
use crate::interlock::Interlock;
use crate::point::{MeasurementPoint, ScanSummary};
use crate::sink::ResultSink;
use crate::stats;
use crate::sweep::{ScanSpec, SweepSequence};

/// Consecutive detector read failures tolerated per sample before the
/// scan fails. Reads only; setpoint commands are never retried.
pub const READ_RETRIES: usize = 3;

// fraction of the settle window spent ramping the field, the rest is
// spent waiting for the magnet and lock-in to quiet down
const RAMP_FRACTION: f64 = 0.2;

// a point degrades when kept samples fall below 1/2 of averaging_count
const MIN_KEPT_NUMERATOR: u32 = 1;
const MIN_KEPT_DENOMINATOR: u32 = 2;

const LOCKIN_FILTER_ORDER: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanPhase {
    Idle,
    Configuring,
    Running,
    Paused,
    Aborting,
    Completed,
    Failed,
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanPhase::Idle => "idle",
            ScanPhase::Configuring => "configuring",
            ScanPhase::Running => "running",
            ScanPhase::Paused => "paused",
            ScanPhase::Aborting => "aborting",
            ScanPhase::Completed => "completed",
            ScanPhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Copy-on-read scan state published through the watch channel. Only the
/// scan task mutates the underlying record.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSnapshot {
    pub phase: ScanPhase,
    pub next_index: usize,
    pub total_points: usize,
    pub emitted: usize,
    pub degraded: usize,
    pub rejected_samples: u64,
    pub elapsed: Duration,
    pub last_point: Option<MeasurementPoint>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    Pause,
    Resume,
    Abort,
}

#[derive(Debug)]
pub struct ScanHandle {
    ctrl_tx: mpsc::Sender<ScanCommand>,
    snapshot_rx: watch::Receiver<ScanSnapshot>,
    task: tokio::task::JoinHandle<Result<ScanSummary>>,
}

impl ScanHandle {
    pub fn subscribe(&self) -> watch::Receiver<ScanSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub async fn pause(&self) {
        self.ctrl_tx.send(ScanCommand::Pause).await.ok();
    }

    pub async fn resume(&self) {
        self.ctrl_tx.send(ScanCommand::Resume).await.ok();
    }

    pub async fn abort(&self) {
        self.ctrl_tx.send(ScanCommand::Abort).await.ok();
    }

    pub async fn wait(self) -> Result<ScanSummary> {
        self.task
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }
}

pub struct Acquisition;

impl Acquisition {
    /// Validates the spec against the sequencer, the interlock and the
    /// calibration envelope, then spawns the scan task. Validation
    /// failures surface here and no hardware is touched.
    pub fn start(
        config: Config,
        devices: DeviceSet,
        curve: Arc<CalibrationCurve>,
        spec: ScanSpec,
        sink: impl ResultSink + 'static,
    ) -> Result<ScanHandle> {
        config.validate()?;
        let sequence = SweepSequence::build(&spec, &config.interlock_limits)?;
        let scale = SignalScale::new(config.signal_scale)?;
        dry_run(&config, &curve, &spec, &sequence)?;

        let (ctrl_tx, ctrl_rx) = mpsc::channel(8);
        let (snapshot_tx, snapshot_rx) = watch::channel(ScanSnapshot {
            phase: ScanPhase::Idle,
            next_index: 0,
            total_points: sequence.len(),
            emitted: 0,
            degraded: 0,
            rejected_samples: 0,
            elapsed: Duration::ZERO,
            last_point: None,
            message: None,
        });

        let task = ScanTask {
            devices,
            curve,
            interlock: Interlock::new(config.interlock_limits),
            scale,
            spec,
            sequence,
            config,
            tx: snapshot_tx,
            started: Instant::now(),
            pause_pending: false,
            emitted: 0,
            degraded: 0,
            rejected_samples: 0,
            last_point: None,
        };

        let join = tokio::spawn(task.run(sink, ctrl_rx));

        Ok(ScanHandle {
            ctrl_tx,
            snapshot_rx,
            task: join,
        })
    }
}

/// Replays every command the scan will issue against a fresh interlock
/// and the calibration envelope, without touching devices.
fn dry_run(
    config: &Config,
    curve: &CalibrationCurve,
    spec: &ScanSpec,
    sequence: &SweepSequence,
) -> Result<()> {
    let mut interlock = Interlock::new(config.interlock_limits);

    let vrms = spec.modulation_field_rms_t * config.modulation_volts_per_tesla;
    interlock.check_modulation(vrms)?;

    for &f in sequence.frequencies() {
        interlock.check_frequency(f)?;
        interlock.check_power(config.rf_power.power_for(f))?;
    }

    let ramp_window = spec.settle_time.mul_f64(RAMP_FRACTION).as_secs_f64();
    let mut first = true;
    for &field_t in sequence.fields() {
        interlock.check_field(field_t)?;
        let (target_a, _) = current_for(curve, spec, field_t)?;
        let step = (target_a - interlock.last_current()).abs();
        if step > 0.0 {
            let slew = if first {
                config.rest_slew_a_per_s
            } else {
                step / ramp_window
            };
            interlock.check_ramp(target_a, slew)?;
        }
        first = false;
    }

    Ok(())
}

fn current_for(curve: &CalibrationCurve, spec: &ScanSpec, field_t: f64) -> Result<(f64, f64)> {
    if spec.extrapolate {
        Ok(curve.current_for_field_extrapolated(field_t))
    } else {
        curve.current_for_field(field_t).map(|a| (a, 0.0))
    }
}

/// Converts a hanging device call into a `DeviceTimeout` failure.
async fn io<T>(
    device: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeviceTimeout {
            device,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

enum Flow {
    Continue,
    Abort,
}

struct ScanTask {
    devices: DeviceSet,
    curve: Arc<CalibrationCurve>,
    interlock: Interlock,
    scale: SignalScale,
    spec: ScanSpec,
    sequence: SweepSequence,
    config: Config,

    tx: watch::Sender<ScanSnapshot>,
    started: Instant,
    pause_pending: bool,

    emitted: usize,
    degraded: usize,
    rejected_samples: u64,
    last_point: Option<MeasurementPoint>,
}

impl ScanTask {
    async fn run(
        mut self,
        mut sink: impl ResultSink,
        mut ctrl_rx: mpsc::Receiver<ScanCommand>,
    ) -> Result<ScanSummary> {
        match self.run_inner(&mut sink, &mut ctrl_rx).await {
            Ok(aborted) => {
                let summary = self.summary(aborted, !aborted);
                sink.finalize(summary).await?;
                self.publish(ScanPhase::Completed, None, self.emitted);
                if aborted {
                    tracing::warn!("scan aborted after {} of {} points", summary.emitted, summary.total_points);
                } else {
                    tracing::info!("scan completed, {} points emitted", summary.emitted);
                }
                Ok(summary)
            }
            Err(e) => {
                tracing::error!("scan failed: {e}");
                if let Err(rest_err) = self.rest_devices().await {
                    tracing::error!("failed to drive devices to rest: {rest_err}");
                }
                let summary = self.summary(false, false);
                if let Err(sink_err) = sink.finalize(summary).await {
                    tracing::error!("failed to finalize partial results: {sink_err}");
                }
                self.publish(ScanPhase::Failed, Some(e.to_string()), self.emitted);
                Err(e)
            }
        }
    }

    /// Ok(true) means the scan was aborted; devices are already at rest
    /// on every Ok return. Any Err is handled by the caller.
    async fn run_inner(
        &mut self,
        sink: &mut impl ResultSink,
        ctrl_rx: &mut mpsc::Receiver<ScanCommand>,
    ) -> Result<bool> {
        self.publish(ScanPhase::Configuring, None, 0);
        self.setup_devices().await?;

        let initial_settle = Duration::from_millis(self.config.initial_settle_ms)
            + self.lockin_settle();
        if let Flow::Abort = self.settle(initial_settle, ctrl_rx).await {
            return self.abort(ctrl_rx).await.map(|_| true);
        }

        self.publish(ScanPhase::Running, None, 0);

        let ramp_window = self.spec.settle_time.mul_f64(RAMP_FRACTION);
        let settle_wait =
            (self.spec.settle_time - ramp_window) + self.lockin_settle();
        let mut durations = Vec::with_capacity(self.sequence.len());

        let mut index = 0usize;
        while index < self.sequence.len() {
            if let Flow::Abort = self.poll_control(ctrl_rx).await {
                return self.abort(ctrl_rx).await.map(|_| true);
            }

            let point_started = Instant::now();
            let point = self
                .sequence
                .point_at(index)
                .ok_or_else(|| Error::Internal(format!("sweep index {index} out of range")))?;
            self.publish(ScanPhase::Running, None, index);

            let (target_a, overshoot_t) = current_for(&self.curve, &self.spec, point.field_t)?;

            self.interlock.check_frequency(point.frequency_hz)?;
            let power = self.config.rf_power.power_for(point.frequency_hz);
            self.interlock.check_power(power)?;

            let timeout = self.port_timeout();
            io("rf source", timeout, self.devices.rf.set_frequency(point.frequency_hz)).await?;
            io("rf source", timeout, self.devices.rf.set_power(power)).await?;

            let step = (target_a - self.interlock.last_current()).abs();
            if step > 0.0 {
                let slew = step / ramp_window.as_secs_f64();
                self.interlock.check_ramp(target_a, slew)?;
                io(
                    "field source",
                    timeout + ramp_window,
                    self.devices.field.ramp_to_current(target_a, slew),
                )
                .await?;
            }

            if let Flow::Abort = self.settle(settle_wait, ctrl_rx).await {
                return self.abort(ctrl_rx).await.map(|_| true);
            }

            let samples = self.acquire_samples().await?;
            let rejection = stats::reject_outliers(&samples, self.spec.outlier_threshold);
            let kept = rejection.kept as u32;
            let degraded =
                kept * MIN_KEPT_DENOMINATOR < self.spec.averaging_count * MIN_KEPT_NUMERATOR;
            if degraded {
                tracing::warn!(
                    "point {index}: only {kept} of {} samples survived rejection",
                    self.spec.averaging_count
                );
            }

            let current_rb = io(
                "field source",
                timeout,
                self.devices.field.read_current(),
            )
            .await?;
            let (field_measured_t, _) = self.curve.field_for_current_extrapolated(current_rb);

            let scaled = self.scale.scale(rejection.mean);
            let measurement = MeasurementPoint {
                index,
                frequency_hz: point.frequency_hz,
                field_set_t: point.field_t,
                field_measured_t,
                raw_signal_v: rejection.mean,
                calibrated_signal: scaled.value,
                samples_used: kept,
                samples_rejected: rejection.rejected as u32,
                degraded,
                clipped: scaled.clipped,
                extrapolated_t: overshoot_t,
                timestamp: Local::now(),
            };

            sink.emit(measurement).await?;

            self.emitted += 1;
            if degraded {
                self.degraded += 1;
            }
            self.rejected_samples += rejection.rejected as u64;
            self.last_point = Some(measurement);
            durations.push(point_started.elapsed().as_secs_f64());

            index += 1;
            self.publish(ScanPhase::Running, None, index);
        }

        if !durations.is_empty() {
            let plot = stats::BoxPlot::new(&durations);
            tracing::info!(
                "scan loop: {} points in {:.1} s (median {:.3} s/point, iqr {:.3} s)",
                durations.len(),
                self.started.elapsed().as_secs_f64(),
                plot.median(),
                plot.iqr()
            );
        }

        self.rest_devices().await?;
        Ok(false)
    }

    async fn setup_devices(&mut self) -> Result<()> {
        let timeout = self.port_timeout();

        let vrms = self.spec.modulation_field_rms_t * self.config.modulation_volts_per_tesla;
        self.interlock.check_modulation(vrms)?;

        io(
            "lock-in",
            timeout,
            self.devices.lockin.configure(LockinSettings {
                reference_hz: self.config.modulation_frequency_hz,
                time_constant_s: self.spec.time_constant_s,
                filter_order: LOCKIN_FILTER_ORDER,
                output_vrms: vrms,
            }),
        )
        .await?;
        io(
            "modulation driver",
            timeout,
            self.devices.modulation.set_amplitude(vrms),
        )
        .await?;
        io(
            "modulation driver",
            timeout,
            self.devices.modulation.set_enabled(true),
        )
        .await?;

        let first = self
            .sequence
            .point_at(0)
            .ok_or_else(|| Error::Internal("empty sweep sequence".into()))?;

        self.interlock.check_frequency(first.frequency_hz)?;
        let power = self.config.rf_power.power_for(first.frequency_hz);
        self.interlock.check_power(power)?;
        io("rf source", timeout, self.devices.rf.set_frequency(first.frequency_hz)).await?;
        io("rf source", timeout, self.devices.rf.set_power(power)).await?;
        io("rf source", timeout, self.devices.rf.set_output(true)).await?;

        io("field source", timeout, self.devices.field.set_output(true)).await?;
        let (target_a, _) = current_for(&self.curve, &self.spec, first.field_t)?;
        self.interlock
            .check_ramp(target_a, self.config.rest_slew_a_per_s)?;
        let ramp_time = if self.config.rest_slew_a_per_s > 0.0 {
            Duration::from_secs_f64(target_a.abs() / self.config.rest_slew_a_per_s)
        } else {
            Duration::ZERO
        };
        io(
            "field source",
            timeout + ramp_time,
            self.devices
                .field
                .ramp_to_current(target_a, self.config.rest_slew_a_per_s),
        )
        .await?;

        Ok(())
    }

    /// Returns the magnet, the RF source and the modulation driver to the
    /// documented resting state: 0 A, outputs off, idle frequency.
    async fn rest_devices(&mut self) -> Result<()> {
        let timeout = self.port_timeout();

        let ramp_time = Duration::from_secs_f64(
            self.interlock.last_current().abs() / self.config.rest_slew_a_per_s,
        );
        self.interlock
            .check_ramp(0.0, self.config.rest_slew_a_per_s)?;
        io(
            "field source",
            timeout + ramp_time,
            self.devices
                .field
                .ramp_to_current(0.0, self.config.rest_slew_a_per_s),
        )
        .await?;
        io("field source", timeout, self.devices.field.set_output(false)).await?;

        io("rf source", timeout, self.devices.rf.set_output(false)).await?;
        io(
            "rf source",
            timeout,
            self.devices.rf.set_frequency(self.config.idle_frequency_hz),
        )
        .await?;

        io(
            "modulation driver",
            timeout,
            self.devices.modulation.set_enabled(false),
        )
        .await?;

        tracing::info!("devices at rest: 0 A, outputs off");
        Ok(())
    }

    async fn abort(&mut self, _ctrl_rx: &mut mpsc::Receiver<ScanCommand>) -> Result<()> {
        self.publish(ScanPhase::Aborting, None, self.emitted);
        tracing::warn!("abort requested, returning devices to rest");
        self.rest_devices().await
    }

    /// Drains pending control commands; blocks only while paused.
    async fn poll_control(&mut self, ctrl_rx: &mut mpsc::Receiver<ScanCommand>) -> Flow {
        loop {
            match ctrl_rx.try_recv() {
                Ok(ScanCommand::Pause) => self.pause_pending = true,
                Ok(ScanCommand::Resume) => self.pause_pending = false,
                Ok(ScanCommand::Abort) => return Flow::Abort,
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }

        if self.pause_pending {
            self.publish(ScanPhase::Paused, None, self.snapshot_index());
            tracing::info!("scan paused before point {}", self.snapshot_index());
            while self.pause_pending {
                match ctrl_rx.recv().await {
                    Some(ScanCommand::Resume) => self.pause_pending = false,
                    Some(ScanCommand::Abort) => return Flow::Abort,
                    Some(ScanCommand::Pause) => {}
                    // control handle dropped; resume rather than hold the
                    // magnet energized forever
                    None => self.pause_pending = false,
                }
            }
            tracing::info!("scan resumed at point {}", self.snapshot_index());
            self.publish(ScanPhase::Running, None, self.snapshot_index());
        }

        Flow::Continue
    }

    /// Interruptible settle: abort cuts the wait short, pause is recorded
    /// and takes effect at the next point boundary.
    async fn settle(&mut self, wait: Duration, ctrl_rx: &mut mpsc::Receiver<ScanCommand>) -> Flow {
        let deadline = Instant::now() + wait;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Flow::Continue,
                cmd = ctrl_rx.recv() => match cmd {
                    Some(ScanCommand::Abort) => return Flow::Abort,
                    Some(ScanCommand::Pause) => self.pause_pending = true,
                    Some(ScanCommand::Resume) => self.pause_pending = false,
                    None => {
                        tokio::time::sleep_until(deadline).await;
                        return Flow::Continue;
                    }
                },
            }
        }
    }

    async fn acquire_samples(&mut self) -> Result<Vec<f64>> {
        let timeout = self.port_timeout();
        let count = self.spec.averaging_count as usize;
        let mut samples = Vec::with_capacity(count);

        while samples.len() < count {
            let mut attempt = 0usize;
            let sample = loop {
                match io("lock-in", timeout, self.devices.lockin.read_sample()).await {
                    Ok(sample) => break sample,
                    Err(e) => {
                        attempt += 1;
                        if attempt >= READ_RETRIES {
                            return Err(e);
                        }
                        tracing::warn!("detector read failed ({e}), retry {attempt}/{READ_RETRIES}");
                    }
                }
            };
            samples.push(sample.x);
        }

        Ok(samples)
    }

    fn lockin_settle(&self) -> Duration {
        Duration::from_secs_f64(self.spec.time_constant_s * self.config.time_constant_multiplier)
    }

    fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.config.port_timeout_ms)
    }

    fn snapshot_index(&self) -> usize {
        self.tx.borrow().next_index
    }

    fn summary(&self, aborted: bool, completed: bool) -> ScanSummary {
        ScanSummary {
            total_points: self.sequence.len(),
            emitted: self.emitted,
            degraded: self.degraded,
            rejected_samples: self.rejected_samples,
            elapsed: self.started.elapsed(),
            aborted,
            completed,
        }
    }

    fn publish(&self, phase: ScanPhase, message: Option<String>, next_index: usize) {
        self.tx
            .send(ScanSnapshot {
                phase,
                next_index,
                total_points: self.sequence.len(),
                emitted: self.emitted,
                degraded: self.degraded,
                rejected_samples: self.rejected_samples,
                elapsed: self.started.elapsed(),
                last_point: self.last_point,
                message,
            })
            .ok();
    }
}
