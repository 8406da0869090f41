use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::interlock::InterlockLimits;
use crate::CoilGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepOrder {
    Forward,
    Reverse,
    /// Reverses direction on every other field row. Frequency axis only.
    Boustrophedon,
}

/// Everything a single scan needs, validated before any hardware is
/// touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSpec {
    pub frequencies_hz: Vec<f64>,
    pub fields_t: Vec<f64>,

    pub modulation_field_rms_t: f64,
    pub time_constant_s: f64,
    pub settle_time: Duration,
    pub averaging_count: u32,
    pub outlier_threshold: f64,

    pub field_order: SweepOrder,
    pub frequency_order: SweepOrder,

    pub extrapolate: bool,
    pub geometry: CoilGeometry,
}

impl ScanSpec {
    pub fn validate(&self, limits: &InterlockLimits) -> Result<()> {
        if self.frequencies_hz.is_empty() {
            return Err(Error::InvalidScanSpec("no frequency setpoints".into()));
        }
        if self.fields_t.is_empty() {
            return Err(Error::InvalidScanSpec("no field setpoints".into()));
        }
        for &f in &self.frequencies_hz {
            if !f.is_finite() || f <= 0.0 {
                return Err(Error::InvalidScanSpec(format!(
                    "frequency setpoint {f} Hz is not a positive finite value"
                )));
            }
            if f > limits.max_frequency_hz {
                return Err(Error::InvalidScanSpec(format!(
                    "frequency setpoint {f} Hz exceeds limit {} Hz",
                    limits.max_frequency_hz
                )));
            }
        }
        for &b in &self.fields_t {
            if !b.is_finite() {
                return Err(Error::InvalidScanSpec(format!(
                    "field setpoint {b} T is not finite"
                )));
            }
            if b.abs() > limits.max_field_t {
                return Err(Error::InvalidScanSpec(format!(
                    "field setpoint {b} T outside ±{} T",
                    limits.max_field_t
                )));
            }
        }
        if self.averaging_count == 0 {
            return Err(Error::InvalidScanSpec("averaging count must be ≥ 1".into()));
        }
        if !(self.outlier_threshold > 0.0 && self.outlier_threshold.is_finite()) {
            return Err(Error::InvalidScanSpec(format!(
                "outlier threshold must be positive, got {}",
                self.outlier_threshold
            )));
        }
        if !(self.modulation_field_rms_t > 0.0 && self.modulation_field_rms_t.is_finite()) {
            return Err(Error::InvalidScanSpec(format!(
                "modulation amplitude must be positive, got {} T rms",
                self.modulation_field_rms_t
            )));
        }
        if !(self.time_constant_s > 0.0 && self.time_constant_s.is_finite()) {
            return Err(Error::InvalidScanSpec(format!(
                "lock-in time constant must be positive, got {} s",
                self.time_constant_s
            )));
        }
        if self.settle_time.is_zero() {
            return Err(Error::InvalidScanSpec("settle time must be positive".into()));
        }
        if self.field_order == SweepOrder::Boustrophedon {
            return Err(Error::InvalidScanSpec(
                "alternating order applies to the frequency axis only".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepPoint {
    pub index: usize,
    pub frequency_hz: f64,
    pub field_t: f64,
}

/// Deterministic enumeration of the field × frequency cross product.
/// Fields are the outer axis: magnet transitions are slow and thermally
/// significant, so each field row is visited exactly once.
#[derive(Debug, Clone)]
pub struct SweepSequence {
    frequencies_hz: Vec<f64>,
    fields_t: Vec<f64>,
    alternate: bool,
}

impl SweepSequence {
    pub fn build(spec: &ScanSpec, limits: &InterlockLimits) -> Result<Self> {
        spec.validate(limits)?;

        let mut fields_t = spec.fields_t.clone();
        if spec.field_order == SweepOrder::Reverse {
            fields_t.reverse();
        }

        let mut frequencies_hz = spec.frequencies_hz.clone();
        if spec.frequency_order == SweepOrder::Reverse {
            frequencies_hz.reverse();
        }

        Ok(Self {
            frequencies_hz,
            fields_t,
            alternate: spec.frequency_order == SweepOrder::Boustrophedon,
        })
    }

    pub fn len(&self) -> usize {
        self.fields_t.len() * self.frequencies_hz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fields(&self) -> &[f64] {
        &self.fields_t
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies_hz
    }

    /// O(1); resume after pause restarts here instead of replaying the
    /// sequence.
    pub fn point_at(&self, index: usize) -> Option<SweepPoint> {
        if index >= self.len() {
            return None;
        }
        let row = index / self.frequencies_hz.len();
        let mut col = index % self.frequencies_hz.len();
        if self.alternate && row % 2 == 1 {
            col = self.frequencies_hz.len() - 1 - col;
        }
        Some(SweepPoint {
            index,
            frequency_hz: self.frequencies_hz[col],
            field_t: self.fields_t[row],
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = SweepPoint> + '_ {
        (0..self.len()).map(|i| self.point_at(i).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(freqs: Vec<f64>, fields: Vec<f64>) -> ScanSpec {
        ScanSpec {
            frequencies_hz: freqs,
            fields_t: fields,
            modulation_field_rms_t: 0.5e-3,
            time_constant_s: 0.02,
            settle_time: Duration::from_millis(250),
            averaging_count: 4,
            outlier_threshold: 0.1,
            field_order: SweepOrder::Forward,
            frequency_order: SweepOrder::Forward,
            extrapolate: false,
            geometry: crate::CoilGeometry::InPlane,
        }
    }

    fn limits() -> InterlockLimits {
        crate::Config::default().interlock_limits
    }

    #[test]
    fn covers_full_cross_product_once() {
        let spec = spec(vec![2.5e9, 5e9, 7.5e9], vec![0.0, 0.05, 0.1, 0.15]);
        let seq = SweepSequence::build(&spec, &limits()).unwrap();

        assert_eq!(seq.len(), 12);
        let points: Vec<_> = seq.iter().collect();
        assert_eq!(points.len(), 12);
        for (i, p) in points.iter().enumerate() {
            assert_eq!(p.index, i);
        }

        let mut coords: Vec<_> = points
            .iter()
            .map(|p| (p.frequency_hz.to_bits(), p.field_t.to_bits()))
            .collect();
        coords.sort();
        coords.dedup();
        assert_eq!(coords.len(), 12, "coordinates must be unique");
    }

    #[test]
    fn fields_are_the_outer_axis() {
        let spec = spec(vec![1e9, 2e9], vec![0.0, 0.1]);
        let seq = SweepSequence::build(&spec, &limits()).unwrap();
        let fields: Vec<_> = seq.iter().map(|p| p.field_t).collect();
        assert_eq!(fields, vec![0.0, 0.0, 0.1, 0.1]);
    }

    #[test]
    fn boustrophedon_reverses_odd_rows() {
        let mut spec = spec(vec![1e9, 2e9, 3e9], vec![0.0, 0.1]);
        spec.frequency_order = SweepOrder::Boustrophedon;
        let seq = SweepSequence::build(&spec, &limits()).unwrap();
        let freqs: Vec<_> = seq.iter().map(|p| p.frequency_hz).collect();
        assert_eq!(freqs, vec![1e9, 2e9, 3e9, 3e9, 2e9, 1e9]);
    }

    #[test]
    fn reverse_field_order_flips_rows() {
        let mut spec = spec(vec![1e9], vec![0.0, 0.1, 0.2]);
        spec.field_order = SweepOrder::Reverse;
        let seq = SweepSequence::build(&spec, &limits()).unwrap();
        let fields: Vec<_> = seq.iter().map(|p| p.field_t).collect();
        assert_eq!(fields, vec![0.2, 0.1, 0.0]);
    }

    #[test]
    fn empty_axes_rejected() {
        assert!(matches!(
            SweepSequence::build(&spec(vec![], vec![0.1]), &limits()),
            Err(Error::InvalidScanSpec(_))
        ));
        assert!(matches!(
            SweepSequence::build(&spec(vec![1e9], vec![]), &limits()),
            Err(Error::InvalidScanSpec(_))
        ));
    }

    #[test]
    fn out_of_limit_setpoints_rejected() {
        assert!(SweepSequence::build(&spec(vec![40e9], vec![0.1]), &limits()).is_err());
        assert!(SweepSequence::build(&spec(vec![1e9], vec![2.0]), &limits()).is_err());
        assert!(SweepSequence::build(&spec(vec![f64::NAN], vec![0.1]), &limits()).is_err());
    }

    #[test]
    fn alternating_field_axis_rejected() {
        let mut s = spec(vec![1e9], vec![0.0]);
        s.field_order = SweepOrder::Boustrophedon;
        assert!(s.validate(&limits()).is_err());
    }
}
