use num_traits::{Float, FromPrimitive, NumOps};

pub struct BoxPlot<T> {
    median: T,
    q1: T,
    q3: T,
    iqr: T,
}

// median and the 25%/75% quartiles of a series, NaN-filtered
fn median_q1q3<T>(series: &[T]) -> (T, T, T)
where
    T: Float + Copy,
{
    let mut sorted_series = series
        .iter()
        .filter(|v| !v.is_nan())
        .copied()
        .collect::<Vec<_>>();
    if sorted_series.is_empty() {
        (T::nan(), T::nan(), T::nan())
    } else {
        sorted_series.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let len = sorted_series.len();
        let q1 = sorted_series[len / 4];
        let q3 = sorted_series[len * 3 / 4];
        let median = sorted_series[len / 2];
        (median, q1, q3)
    }
}

impl<T> BoxPlot<T>
where
    T: Float + NumOps + FromPrimitive + Copy,
{
    pub fn new(series: &[T]) -> Self {
        let (median, q1, q3) = median_q1q3(series);
        Self {
            median,
            q1,
            q3,
            iqr: q3 - q1,
        }
    }

    pub fn median(&self) -> T {
        self.median
    }

    pub fn q1(&self) -> T {
        self.q1
    }

    pub fn q3(&self) -> T {
        self.q3
    }

    pub fn iqr(&self) -> T {
        self.iqr
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rejection<T> {
    pub mean: T,
    pub kept: usize,
    pub rejected: usize,
}

/// Discards samples whose deviation from the series median exceeds
/// `threshold` and averages the survivors. The median itself always
/// survives, so `kept` is at least 1 for a non-empty series.
pub fn reject_outliers<T>(series: &[T], threshold: T) -> Rejection<T>
where
    T: Float + NumOps + FromPrimitive + Copy,
{
    let median = BoxPlot::new(series).median();

    let mut sum = T::zero();
    let mut kept = 0usize;
    let mut rejected = 0usize;
    for &v in series {
        if v.is_nan() || (v - median).abs() > threshold {
            rejected += 1;
        } else {
            sum = sum + v;
            kept += 1;
        }
    }

    let mean = if kept > 0 {
        sum / T::from_usize(kept).unwrap_or_else(T::one)
    } else {
        median
    };

    Rejection {
        mean,
        kept,
        rejected,
    }
}
