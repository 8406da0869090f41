//! Magnet calibration curves and detector signal scaling.
//!
//! A curve is a lookup table of (drive current, measured field) samples
//! recorded by the `calibrate-magnet` routine. Conversion in either
//! direction is piecewise-linear over the sampled envelope; leaving the
//! envelope is an error unless the caller explicitly asks for
//! extrapolation, in which case the overshoot is reported for point
//! metadata.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{CoilGeometry, Config, SignalScaleConfig};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub current_a: f64,
    pub field_t: f64,
}

/// Immutable after construction. Samples are ascending in current with
/// strictly monotonic field (either direction, so reversed coil wiring
/// still loads).
#[derive(Debug, Clone)]
pub struct CalibrationCurve {
    name: String,
    samples: Vec<CalibrationSample>,
}

fn lerp(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

impl CalibrationCurve {
    pub fn from_samples(
        name: impl Into<String>,
        mut samples: Vec<CalibrationSample>,
    ) -> Result<Self> {
        let name = name.into();
        if samples.len() < 2 {
            return Err(Error::InvalidCalibration(format!(
                "curve '{name}' needs at least 2 samples, got {}",
                samples.len()
            )));
        }
        if samples
            .iter()
            .any(|s| !s.current_a.is_finite() || !s.field_t.is_finite())
        {
            return Err(Error::InvalidCalibration(format!(
                "curve '{name}' contains non-finite samples"
            )));
        }

        samples.sort_by(|a, b| a.current_a.partial_cmp(&b.current_a).unwrap());

        let increasing = samples[1].field_t > samples[0].field_t;
        for w in samples.windows(2) {
            if w[1].current_a <= w[0].current_a {
                return Err(Error::InvalidCalibration(format!(
                    "curve '{name}' has duplicate current sample {} A",
                    w[1].current_a
                )));
            }
            let step_up = w[1].field_t > w[0].field_t;
            if step_up != increasing || w[1].field_t == w[0].field_t {
                return Err(Error::InvalidCalibration(format!(
                    "curve '{name}' field is not strictly monotonic near {} A",
                    w[0].current_a
                )));
            }
        }

        Ok(Self { name, samples })
    }

    /// Parses the two-column `.xy` format written by `calibrate-magnet`
    /// (whitespace separated current/field, `#` comment lines).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("calibration")
            .to_owned();

        let contents = std::fs::read_to_string(path)?;
        let mut samples = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut cols = line.split_whitespace();
            let parse = |field: Option<&str>| -> Result<f64> {
                field
                    .and_then(|v| v.parse::<f64>().ok())
                    .ok_or_else(|| {
                        Error::InvalidCalibration(format!(
                            "{}:{}: expected two numeric columns",
                            path.display(),
                            lineno + 1
                        ))
                    })
            };
            samples.push(CalibrationSample {
                current_a: parse(cols.next())?,
                field_t: parse(cols.next())?,
            });
        }

        Self::from_samples(name, samples)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        use std::io::Write;

        let mut out = std::fs::File::create(path)?;
        writeln!(out, "#  current (A)      field (T)")?;
        for s in &self.samples {
            writeln!(out, "{:>14.8} {:>14.8}", s.current_a, s.field_t)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[CalibrationSample] {
        &self.samples
    }

    pub fn current_range(&self) -> (f64, f64) {
        (
            self.samples[0].current_a,
            self.samples[self.samples.len() - 1].current_a,
        )
    }

    pub fn field_range(&self) -> (f64, f64) {
        let first = self.samples[0].field_t;
        let last = self.samples[self.samples.len() - 1].field_t;
        if first <= last {
            (first, last)
        } else {
            (last, first)
        }
    }

    pub fn field_for_current(&self, current_a: f64) -> Result<f64> {
        let (min, max) = self.current_range();
        if !(current_a >= min && current_a <= max) {
            return Err(Error::OutOfCalibrationRange {
                quantity: "current (A)",
                requested: current_a,
                min,
                max,
            });
        }
        Ok(self.field_for_current_extrapolated(current_a).0)
    }

    /// Edge-segment extension outside the envelope; returns the converted
    /// field and the overshoot magnitude in amperes (0 inside).
    pub fn field_for_current_extrapolated(&self, current_a: f64) -> (f64, f64) {
        let (min, max) = self.current_range();
        let overshoot = if current_a < min {
            min - current_a
        } else if current_a > max {
            current_a - max
        } else {
            0.0
        };

        let seg = self
            .samples
            .windows(2)
            .find(|w| current_a >= w[0].current_a && current_a <= w[1].current_a)
            .unwrap_or_else(|| {
                if current_a < min {
                    &self.samples[0..2]
                } else {
                    &self.samples[self.samples.len() - 2..]
                }
            });

        (
            lerp(
                seg[0].current_a,
                seg[0].field_t,
                seg[1].current_a,
                seg[1].field_t,
                current_a,
            ),
            overshoot,
        )
    }

    pub fn current_for_field(&self, field_t: f64) -> Result<f64> {
        let (min, max) = self.field_range();
        if !(field_t >= min && field_t <= max) {
            return Err(Error::OutOfCalibrationRange {
                quantity: "field (T)",
                requested: field_t,
                min,
                max,
            });
        }
        Ok(self.current_for_field_extrapolated(field_t).0)
    }

    /// Inverse conversion with edge-segment extension; returns the drive
    /// current and the overshoot magnitude in tesla (0 inside).
    pub fn current_for_field_extrapolated(&self, field_t: f64) -> (f64, f64) {
        let (min, max) = self.field_range();
        let overshoot = if field_t < min {
            min - field_t
        } else if field_t > max {
            field_t - max
        } else {
            0.0
        };

        // sign trick keeps the segment test valid for decreasing curves
        let seg = self
            .samples
            .windows(2)
            .find(|w| (field_t - w[0].field_t) * (field_t - w[1].field_t) <= 0.0)
            .unwrap_or_else(|| {
                let below = (field_t < self.samples[0].field_t)
                    == (self.samples[0].field_t < self.samples[1].field_t);
                if below {
                    &self.samples[0..2]
                } else {
                    &self.samples[self.samples.len() - 2..]
                }
            });

        (
            lerp(
                seg[0].field_t,
                seg[0].current_a,
                seg[1].field_t,
                seg[1].current_a,
                field_t,
            ),
            overshoot,
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Scaled {
    pub value: f64,
    /// Raw magnitude left the detector's linear regime; the value is still
    /// scaled, the caller decides what to do with the flag.
    pub clipped: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SignalScale {
    scale_factor: f64,
    detector_gain: f64,
    linear_range_v: f64,
}

impl SignalScale {
    pub fn new(config: SignalScaleConfig) -> Result<Self> {
        if !(config.detector_gain != 0.0 && config.detector_gain.is_finite()) {
            return Err(Error::Config(format!(
                "DetectorGain must be finite and non-zero, got {}",
                config.detector_gain
            )));
        }
        if !(config.linear_range_v > 0.0) {
            return Err(Error::Config(format!(
                "LinearRangeV must be positive, got {}",
                config.linear_range_v
            )));
        }
        Ok(Self {
            scale_factor: config.scale_factor,
            detector_gain: config.detector_gain,
            linear_range_v: config.linear_range_v,
        })
    }

    pub fn scale(&self, raw: f64) -> Scaled {
        Scaled {
            value: raw * self.scale_factor / self.detector_gain,
            clipped: raw.abs() > self.linear_range_v,
        }
    }
}

/// Loads curves by coil geometry and hands out shared references. While a
/// scan holds the lock, `reload` is refused.
pub struct CurveStore {
    dir: PathBuf,
    files: HashMap<CoilGeometry, String>,
    curves: Mutex<HashMap<CoilGeometry, Arc<CalibrationCurve>>>,
    locked: AtomicBool,
}

impl CurveStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        in_plane_file: impl Into<String>,
        out_of_plane_file: impl Into<String>,
    ) -> Self {
        let mut files = HashMap::new();
        files.insert(CoilGeometry::InPlane, in_plane_file.into());
        files.insert(CoilGeometry::OutOfPlane, out_of_plane_file.into());
        Self {
            dir: dir.into(),
            files,
            curves: Mutex::new(HashMap::new()),
            locked: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let dir = match &config.calibration_dir {
            Some(dir) => dir.clone(),
            None => directories::BaseDirs::new()
                .ok_or_else(|| Error::Config("failed to resolve config directory".into()))?
                .config_dir()
                .join("fmr-acquire"),
        };
        Ok(Self::new(
            dir,
            config.in_plane_curve.clone(),
            config.out_of_plane_curve.clone(),
        ))
    }

    pub fn path_for(&self, geometry: CoilGeometry) -> PathBuf {
        self.dir.join(&self.files[&geometry])
    }

    pub fn get(&self, geometry: CoilGeometry) -> Result<Arc<CalibrationCurve>> {
        let mut curves = self.curves.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(curve) = curves.get(&geometry) {
            return Ok(curve.clone());
        }
        let curve = Arc::new(CalibrationCurve::load(self.path_for(geometry))?);
        curves.insert(geometry, curve.clone());
        Ok(curve)
    }

    pub fn reload(&self, geometry: CoilGeometry) -> Result<Arc<CalibrationCurve>> {
        if self.locked.load(Ordering::Acquire) {
            return Err(Error::CalibrationLocked(self.files[&geometry].clone()));
        }
        let curve = Arc::new(CalibrationCurve::load(self.path_for(geometry))?);
        self.curves
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(geometry, curve.clone());
        Ok(curve)
    }

    pub fn lock_for_scan(&self) -> ScanCurveLock<'_> {
        self.locked.store(true, Ordering::Release);
        ScanCurveLock { store: self }
    }
}

pub struct ScanCurveLock<'a> {
    store: &'a CurveStore,
}

impl Drop for ScanCurveLock<'_> {
    fn drop(&mut self) {
        self.store.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_curve() -> CalibrationCurve {
        // 0.02 T per A, the rough constant of the DXWD-80 at 20 mm gap
        let samples = (-10..=10)
            .map(|i| CalibrationSample {
                current_a: i as f64,
                field_t: i as f64 * 0.02,
            })
            .collect();
        CalibrationCurve::from_samples("test", samples).unwrap()
    }

    #[test]
    fn round_trip_within_envelope() {
        let curve = linear_curve();
        for i in [-9.7, -3.2, 0.0, 0.5, 4.25, 9.99] {
            let field = curve.field_for_current(i).unwrap();
            let back = curve.current_for_field(field).unwrap();
            assert!((back - i).abs() < 1e-9, "{i} -> {field} -> {back}");
        }
    }

    #[test]
    fn out_of_range_is_an_error_without_opt_in() {
        let curve = linear_curve();
        let err = curve.current_for_field(0.5).unwrap_err();
        match err {
            Error::OutOfCalibrationRange { requested, max, .. } => {
                assert_eq!(requested, 0.5);
                assert!((max - 0.2).abs() < 1e-12);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(curve.field_for_current(10.5).is_err());
    }

    #[test]
    fn extrapolation_reports_overshoot() {
        let curve = linear_curve();
        let (current, overshoot) = curve.current_for_field_extrapolated(0.24);
        assert!((current - 12.0).abs() < 1e-9);
        assert!((overshoot - 0.04).abs() < 1e-12);

        let (_, inside) = curve.current_for_field_extrapolated(0.1);
        assert_eq!(inside, 0.0);
    }

    #[test]
    fn decreasing_field_curve_inverts() {
        let samples = (0..=5)
            .map(|i| CalibrationSample {
                current_a: i as f64,
                field_t: -0.03 * i as f64,
            })
            .collect();
        let curve = CalibrationCurve::from_samples("reversed", samples).unwrap();
        let current = curve.current_for_field(-0.045).unwrap();
        assert!((current - 1.5).abs() < 1e-9);
    }

    #[test]
    fn non_monotonic_field_rejected() {
        let samples = vec![
            CalibrationSample { current_a: 0.0, field_t: 0.0 },
            CalibrationSample { current_a: 1.0, field_t: 0.02 },
            CalibrationSample { current_a: 2.0, field_t: 0.015 },
        ];
        assert!(CalibrationCurve::from_samples("bad", samples).is_err());
    }

    #[test]
    fn xy_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DXWD-80_test.xy");
        linear_curve().save(&path).unwrap();

        let loaded = CalibrationCurve::load(&path).unwrap();
        assert_eq!(loaded.name(), "DXWD-80_test");
        assert_eq!(loaded.samples().len(), 21);
        let field = loaded.field_for_current(2.5).unwrap();
        assert!((field - 0.05).abs() < 1e-7);
    }

    #[test]
    fn reload_refused_while_scan_holds_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip.xy");
        linear_curve().save(&path).unwrap();

        let store = CurveStore::new(dir.path(), "ip.xy", "oop.xy");
        store.get(CoilGeometry::InPlane).unwrap();

        {
            let _lock = store.lock_for_scan();
            let err = store.reload(CoilGeometry::InPlane).unwrap_err();
            assert!(matches!(err, Error::CalibrationLocked(_)));
        }
        store.reload(CoilGeometry::InPlane).unwrap();
    }

    #[test]
    fn signal_scale_flags_nonlinear_regime() {
        let scale = SignalScale::new(SignalScaleConfig {
            scale_factor: 2.0,
            detector_gain: 4.0,
            linear_range_v: 1.0,
        })
        .unwrap();

        let s = scale.scale(0.5);
        assert_eq!(s.value, 0.25);
        assert!(!s.clipped);

        let s = scale.scale(-1.5);
        assert_eq!(s.value, -0.75);
        assert!(s.clipped);
    }
}
