//! End-to-end scan scenarios against the simulated bench.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use fmr_acquire::calibration::{CalibrationCurve, CalibrationSample};
use fmr_acquire::devices::sim::SimBench;
use fmr_acquire::{
    Acquisition, CoilGeometry, Config, Error, MemorySink, ScanPhase, ScanSnapshot, ScanSpec,
    SweepOrder, READ_RETRIES,
};

fn test_config() -> Config {
    let mut config = Config::default();
    config.port_timeout_ms = 150;
    config.initial_settle_ms = 0;
    config.time_constant_multiplier = 1.0;
    // short settle windows make the per-point slew large; the scans here
    // only probe sequencing, not magnet thermals
    config.interlock_limits.max_slew_a_per_s = 1000.0;
    config
}

/// Linear curve matching the sim bench's 0.02 T/A coil constant.
fn sim_curve() -> Arc<CalibrationCurve> {
    let samples = (-30..=30)
        .map(|i| CalibrationSample {
            current_a: i as f64,
            field_t: 0.02 * i as f64,
        })
        .collect();
    Arc::new(CalibrationCurve::from_samples("sim", samples).unwrap())
}

fn spec(n_freqs: usize, n_fields: usize, settle: Duration) -> ScanSpec {
    ScanSpec {
        frequencies_hz: (1..=n_freqs).map(|i| i as f64 * 1e9).collect(),
        fields_t: (0..n_fields).map(|i| 0.1 + i as f64 * 0.01).collect(),
        modulation_field_rms_t: 0.5e-3,
        time_constant_s: 0.001,
        settle_time: settle,
        averaging_count: 4,
        outlier_threshold: 1.0,
        field_order: SweepOrder::Forward,
        frequency_order: SweepOrder::Forward,
        extrapolate: false,
        geometry: CoilGeometry::InPlane,
    }
}

async fn wait_for(
    rx: &mut watch::Receiver<ScanSnapshot>,
    what: &str,
    pred: impl Fn(&ScanSnapshot) -> bool,
) {
    let outcome = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if pred(&rx.borrow()) {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("scan task ended before {what}");
            }
        }
    })
    .await;
    outcome.unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn assert_at_rest(bench: &SimBench) {
    let snap = bench.snapshot();
    assert_eq!(snap.current_a, 0.0, "magnet not ramped down");
    assert!(!snap.field_on, "supply output still on");
    assert!(!snap.rf_on, "RF output still on");
    assert!(!snap.modulation_on, "modulation still enabled");
}

#[tokio::test]
async fn full_scan_covers_cross_product_and_rests_devices() {
    let bench = SimBench::with_defaults();
    let sink = MemorySink::new();
    let spec = spec(2, 3, Duration::from_millis(20));

    let handle = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec.clone(),
        sink.clone(),
    )
    .unwrap();
    let mut snapshots = handle.subscribe();
    let summary = handle.wait().await.unwrap();

    assert!(summary.completed && !summary.aborted);
    assert_eq!(summary.emitted, 6);
    assert_eq!(summary.degraded, 0);

    let points = sink.points();
    assert_eq!(points.len(), 6);
    for (i, p) in points.iter().enumerate() {
        assert_eq!(p.index, i);
        // fields are the outer axis: two frequencies per field row
        assert_eq!(p.field_set_t, spec.fields_t[i / 2]);
        assert_eq!(p.frequency_hz, spec.frequencies_hz[i % 2]);
        assert!(
            (p.field_measured_t - p.field_set_t).abs() < 1e-9,
            "readback field diverged at point {i}"
        );
        assert_eq!(p.samples_used, 4);
        assert_eq!(p.samples_rejected, 0);
        assert!(!p.degraded && !p.clipped);
        assert_eq!(p.extrapolated_t, 0.0);
    }

    assert_eq!(sink.summary().unwrap().emitted, 6);
    wait_for(&mut snapshots, "completion", |s| {
        s.phase == ScanPhase::Completed
    })
    .await;
    assert_at_rest(&bench);
}

#[tokio::test]
async fn abort_after_two_points_finalizes_partial_results() {
    let bench = SimBench::with_defaults();
    let sink = MemorySink::new();

    let handle = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec(2, 3, Duration::from_millis(300)),
        sink.clone(),
    )
    .unwrap();

    let mut snapshots = handle.subscribe();
    wait_for(&mut snapshots, "two emitted points", |s| s.emitted >= 2).await;
    handle.abort().await;

    let summary = handle.wait().await.unwrap();
    assert!(summary.aborted && !summary.completed);
    assert_eq!(summary.emitted, 2);
    assert_eq!(summary.total_points, 6);

    let points = sink.points();
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].index, 0);
    assert_eq!(points[1].index, 1);
    assert_eq!(sink.summary().unwrap().emitted, 2);

    assert_at_rest(&bench);
}

#[tokio::test]
async fn pause_resume_continues_without_reemission() {
    let bench = SimBench::with_defaults();
    let sink = MemorySink::new();

    let handle = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec(2, 5, Duration::from_millis(150)),
        sink.clone(),
    )
    .unwrap();

    let mut snapshots = handle.subscribe();
    // the pause lands while point 4 is in flight; the point completes and
    // the scan halts at the next boundary
    wait_for(&mut snapshots, "point index 3", |s| s.emitted >= 4).await;
    handle.pause().await;
    wait_for(&mut snapshots, "paused state", |s| {
        s.phase == ScanPhase::Paused
    })
    .await;

    {
        let snapshot = snapshots.borrow().clone();
        assert_eq!(snapshot.emitted, 5);
        assert_eq!(snapshot.next_index, 5);
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.points().len(), 5, "scan progressed while paused");

    handle.resume().await;
    let summary = handle.wait().await.unwrap();
    assert!(summary.completed);
    assert_eq!(summary.emitted, 10);

    let indices: Vec<usize> = sink.points().iter().map(|p| p.index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>(), "points re-emitted");
}

#[tokio::test]
async fn injected_outlier_rejected_exactly_once() {
    let bench = SimBench::with_defaults();
    let sink = MemorySink::new();
    let mut spec = spec(1, 1, Duration::from_millis(20));
    spec.averaging_count = 5;
    spec.outlier_threshold = 0.05;

    bench.offset_next_sample(1.0);

    let handle = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec,
        sink.clone(),
    )
    .unwrap();
    let summary = handle.wait().await.unwrap();
    assert!(summary.completed);
    assert_eq!(summary.rejected_samples, 1);

    let points = sink.points();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].samples_rejected, 1);
    assert_eq!(points[0].samples_used, 4);
    assert!(!points[0].degraded);
    assert!(
        points[0].raw_signal_v.abs() < 0.01,
        "averaged signal still carries the outlier: {}",
        points[0].raw_signal_v
    );
}

#[tokio::test]
async fn excessive_rejection_marks_point_degraded_but_emits() {
    let bench = SimBench::with_defaults();
    let sink = MemorySink::new();
    let mut spec = spec(1, 1, Duration::from_millis(20));
    spec.outlier_threshold = 0.05;

    // 3 of 4 samples land far apart, only the median survives
    bench.offset_next_sample(10.0);
    bench.offset_next_sample(20.0);
    bench.offset_next_sample(30.0);

    let handle = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec,
        sink.clone(),
    )
    .unwrap();
    let summary = handle.wait().await.unwrap();

    assert!(summary.completed, "degraded point must not fail the scan");
    assert_eq!(summary.degraded, 1);

    let points = sink.points();
    assert_eq!(points.len(), 1, "degraded point was dropped");
    assert!(points[0].degraded);
    assert_eq!(points[0].samples_used, 1);
    assert_eq!(points[0].samples_rejected, 3);
}

#[tokio::test]
async fn transient_detector_failures_are_retried() {
    let bench = SimBench::with_defaults();
    let sink = MemorySink::new();

    bench.fail_next_reads(READ_RETRIES as u32 - 1);

    let handle = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec(1, 1, Duration::from_millis(20)),
        sink.clone(),
    )
    .unwrap();
    let summary = handle.wait().await.unwrap();

    assert!(summary.completed);
    assert_eq!(sink.points().len(), 1);
    assert_eq!(sink.points()[0].samples_used, 4);
}

#[tokio::test]
async fn persistent_detector_failure_fails_scan_preserving_partial_results() {
    let bench = SimBench::with_defaults();
    let sink = MemorySink::new();

    let handle = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec(1, 3, Duration::from_millis(100)),
        sink.clone(),
    )
    .unwrap();

    let mut snapshots = handle.subscribe();
    wait_for(&mut snapshots, "first emitted point", |s| s.emitted >= 1).await;
    bench.fail_next_reads(READ_RETRIES as u32);

    let err = handle.wait().await.unwrap_err();
    assert!(
        matches!(err, Error::DeviceComm { device: "lock-in", .. }),
        "unexpected error: {err}"
    );

    // partial results stay valid and finalized
    assert_eq!(sink.points().len(), 1);
    let summary = sink.summary().unwrap();
    assert!(!summary.completed && !summary.aborted);
    assert_eq!(summary.emitted, 1);

    assert_at_rest(&bench);
}

#[tokio::test]
async fn hanging_detector_read_times_out() {
    let bench = SimBench::with_defaults();
    let sink = MemorySink::new();

    bench.hang_reads(true);

    let handle = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec(1, 1, Duration::from_millis(20)),
        sink.clone(),
    )
    .unwrap();
    let err = handle.wait().await.unwrap_err();

    assert!(
        matches!(err, Error::DeviceTimeout { device: "lock-in", .. }),
        "unexpected error: {err}"
    );
    assert_at_rest(&bench);
}

#[tokio::test]
async fn interlock_violation_at_configuration_never_starts() {
    let bench = SimBench::with_defaults();
    let mut config = test_config();
    config.interlock_limits.max_slew_a_per_s = 2.0;

    // 0 -> 0.4 T inside a 4 ms ramp window is a 5000 A/s step
    let mut spec = spec(1, 1, Duration::from_millis(20));
    spec.fields_t = vec![0.0, 0.4];

    let err = Acquisition::start(
        config,
        bench.devices(),
        sim_curve(),
        spec,
        MemorySink::new(),
    )
    .unwrap_err();

    assert!(
        matches!(err, Error::InterlockViolation(_)),
        "unexpected error: {err}"
    );

    // validation must not touch hardware
    let snap = bench.snapshot();
    assert_eq!(snap.current_a, 0.0);
    assert!(!snap.field_on && !snap.rf_on && !snap.modulation_on);
    assert!(!snap.lockin_configured);
}

#[tokio::test]
async fn invalid_spec_rejected_before_start() {
    let bench = SimBench::with_defaults();
    let mut spec = spec(1, 1, Duration::from_millis(20));
    spec.frequencies_hz.clear();

    let err = Acquisition::start(
        test_config(),
        bench.devices(),
        sim_curve(),
        spec,
        MemorySink::new(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidScanSpec(_)));
}

#[tokio::test]
async fn out_of_envelope_field_requires_extrapolation_opt_in() {
    // ±0.05 T envelope
    let narrow = Arc::new(
        CalibrationCurve::from_samples(
            "narrow",
            (-5..=5)
                .map(|i| CalibrationSample {
                    current_a: i as f64 * 0.5,
                    field_t: i as f64 * 0.01,
                })
                .collect(),
        )
        .unwrap(),
    );

    let mut spec = spec(1, 1, Duration::from_millis(20));
    spec.fields_t = vec![0.06];

    let err = Acquisition::start(
        test_config(),
        SimBench::with_defaults().devices(),
        narrow.clone(),
        spec.clone(),
        MemorySink::new(),
    )
    .unwrap_err();
    assert!(
        matches!(err, Error::OutOfCalibrationRange { .. }),
        "unexpected error: {err}"
    );

    // explicit opt-in runs and records the overshoot on the point
    spec.extrapolate = true;
    let sink = MemorySink::new();
    let handle = Acquisition::start(
        test_config(),
        SimBench::with_defaults().devices(),
        narrow,
        spec,
        sink.clone(),
    )
    .unwrap();
    handle.wait().await.unwrap();

    let points = sink.points();
    assert_eq!(points.len(), 1);
    assert!((points[0].extrapolated_t - 0.01).abs() < 1e-9);
}
