//! Statistical analysis routines for the quality worker.
//!
//! Pure functions over finite numeric slices. Non-finite values (NaN,
//! infinities) are excluded before any computation. Routines refuse to
//! produce a result rather than fabricate one: `InsufficientData`,
//! `InsufficientVariance`, and `InvalidSpec` are typed refusals that the
//! quality worker maps to "no finding".

use serde::{Deserialize, Serialize};

use crate::error::StatsError;

/// Control chart limits: centerline with upper/lower bounds at
/// three sample standard deviations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlLimits {
    pub centerline: f64,
    pub upper: f64,
    pub lower: f64,
}

/// A point flagged by the IQR outlier fence.
///
/// `index` refers to the position in the input slice, so callers can
/// attribute the outlier back to the row that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outlier {
    pub index: usize,
    pub value: f64,
}

/// Arithmetic mean of the finite values in `data`.
///
/// Returns `None` when no finite values remain.
pub fn mean(data: &[f64]) -> Option<f64> {
    let finite = finite_values(data);
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}

/// Sample standard deviation (n - 1 denominator) of the finite values.
///
/// Returns `None` when fewer than two finite values remain.
pub fn sample_stddev(data: &[f64]) -> Option<f64> {
    let finite = finite_values(data);
    if finite.len() < 2 {
        return None;
    }
    let m = finite.iter().sum::<f64>() / finite.len() as f64;
    let var = finite.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (finite.len() - 1) as f64;
    Some(var.sqrt())
}

/// Standard score of `value` against a known mean and standard deviation.
///
/// Fails with `InsufficientVariance` when the standard deviation is zero;
/// callers must treat that as "no anomaly", not as an error.
pub fn z_score(value: f64, mean: f64, stddev: f64) -> Result<f64, StatsError> {
    if stddev.abs() < f64::EPSILON {
        return Err(StatsError::InsufficientVariance);
    }
    Ok((value - mean) / stddev)
}

/// Control limits over `data`: centerline = mean, bounds = mean ± 3·s.
///
/// A zero-variance series is valid and collapses all three lines onto the
/// mean, so constant data never produces downstream false anomalies.
pub fn control_limits(data: &[f64]) -> Result<ControlLimits, StatsError> {
    let finite = finite_values(data);
    if finite.len() < 2 {
        return Err(StatsError::InsufficientData {
            needed: 2,
            got: finite.len(),
        });
    }
    let m = finite.iter().sum::<f64>() / finite.len() as f64;
    let s = sample_stddev(&finite).unwrap_or(0.0);
    Ok(ControlLimits {
        centerline: m,
        upper: m + 3.0 * s,
        lower: m - 3.0 * s,
    })
}

/// Process capability index Cpk = min(usl − mean, mean − lsl) / (3·s).
pub fn process_capability(data: &[f64], usl: f64, lsl: f64) -> Result<f64, StatsError> {
    if usl <= lsl {
        return Err(StatsError::InvalidSpec { usl, lsl });
    }
    let finite = finite_values(data);
    if finite.len() < 2 {
        return Err(StatsError::InsufficientData {
            needed: 2,
            got: finite.len(),
        });
    }
    let m = finite.iter().sum::<f64>() / finite.len() as f64;
    let s = sample_stddev(&finite).unwrap_or(0.0);
    if s.abs() < f64::EPSILON {
        return Err(StatsError::InsufficientVariance);
    }
    Ok(((usl - m).min(m - lsl)) / (3.0 * s))
}

/// Outliers by the quartile method: values outside
/// [Q1 − 1.5·IQR, Q3 + 1.5·IQR].
///
/// Returns an empty vector for fewer than four finite points; tiny samples
/// produce no false positives. Non-finite entries are never flagged.
pub fn outliers_iqr(data: &[f64]) -> Vec<Outlier> {
    let indexed: Vec<(usize, f64)> = data
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, v)| (i, *v))
        .collect();
    if indexed.len() < 4 {
        return Vec::new();
    }

    let mut sorted: Vec<f64> = indexed.iter().map(|(_, v)| *v).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let q1 = percentile_sorted(&sorted, 0.25);
    let q3 = percentile_sorted(&sorted, 0.75);
    let iqr = q3 - q1;
    let low = q1 - 1.5 * iqr;
    let high = q3 + 1.5 * iqr;

    indexed
        .into_iter()
        .filter(|(_, v)| *v < low || *v > high)
        .map(|(index, value)| Outlier { index, value })
        .collect()
}

/// Trailing moving average with the given window.
///
/// The first `window − 1` points are undefined and omitted, never
/// zero-filled: the output has `len − window + 1` entries. A zero window
/// or a window longer than the series yields an empty vector.
pub fn moving_average(series: &[f64], window: usize) -> Vec<f64> {
    let finite = finite_values(series);
    if window == 0 || finite.len() < window {
        return Vec::new();
    }
    finite
        .windows(window)
        .map(|w| w.iter().sum::<f64>() / window as f64)
        .collect()
}

fn finite_values(data: &[f64]) -> Vec<f64> {
    data.iter().copied().filter(|v| v.is_finite()).collect()
}

/// Linear-interpolation percentile over an already sorted slice.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let rank = p * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = rank - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_score_basic() {
        let z = z_score(120.0, 100.0, 10.0).unwrap();
        assert!((z - 2.0).abs() < 1e-9);
    }

    #[test]
    fn z_score_zero_variance_is_refusal() {
        assert_eq!(
            z_score(5.0, 5.0, 0.0),
            Err(StatsError::InsufficientVariance)
        );
    }

    #[test]
    fn control_limits_constant_series_collapses() {
        let limits = control_limits(&[10.0, 10.0, 10.0, 10.0]).unwrap();
        assert_eq!(limits.centerline, 10.0);
        assert_eq!(limits.upper, 10.0);
        assert_eq!(limits.lower, 10.0);
    }

    #[test]
    fn control_limits_needs_two_points() {
        let err = control_limits(&[1.0]).unwrap_err();
        assert_eq!(err, StatsError::InsufficientData { needed: 2, got: 1 });
    }

    #[test]
    fn control_limits_known_values() {
        // mean = 5, sample stddev = sqrt(32/7)
        let limits = control_limits(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        let s = (32.0_f64 / 7.0).sqrt();
        assert!((limits.centerline - 5.0).abs() < 1e-9);
        assert!((limits.upper - (5.0 + 3.0 * s)).abs() < 1e-9);
        assert!((limits.lower - (5.0 - 3.0 * s)).abs() < 1e-9);
    }

    #[test]
    fn control_limits_ignores_nan() {
        let limits = control_limits(&[10.0, f64::NAN, 10.0, 10.0]).unwrap();
        assert_eq!(limits.centerline, 10.0);
    }

    #[test]
    fn process_capability_rejects_inverted_spec() {
        let err = process_capability(&[1.0, 2.0, 3.0], 1.0, 2.0).unwrap_err();
        assert!(matches!(err, StatsError::InvalidSpec { .. }));
    }

    #[test]
    fn process_capability_centered_process() {
        // mean = 10, s = sqrt(0.1 / 4) ≈ 0.1581
        let data = [10.0, 10.2, 9.8, 10.1, 9.9];
        let cpk = process_capability(&data, 11.0, 9.0).unwrap();
        assert!((cpk - 2.108).abs() < 0.01);
    }

    #[test]
    fn process_capability_zero_variance_is_refusal() {
        let err = process_capability(&[5.0, 5.0, 5.0], 6.0, 4.0).unwrap_err();
        assert_eq!(err, StatsError::InsufficientVariance);
    }

    #[test]
    fn outliers_flags_extreme_value() {
        let outliers = outliers_iqr(&[1.0, 2.0, 3.0, 4.0, 5.0, 100.0]);
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].index, 5);
        assert_eq!(outliers[0].value, 100.0);
    }

    #[test]
    fn outliers_empty_below_four_points() {
        assert!(outliers_iqr(&[1.0, 2.0, 300.0]).is_empty());
    }

    #[test]
    fn outliers_quartiles_interpolate() {
        // Q1 = 1.75, Q3 = 3.25, fences at -0.5 and 5.5
        assert!(outliers_iqr(&[1.0, 2.0, 3.0, 4.0]).is_empty());
    }

    #[test]
    fn outliers_keeps_original_indices_across_nan() {
        let outliers = outliers_iqr(&[1.0, f64::NAN, 2.0, 3.0, 4.0, 100.0]);
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].index, 5);
    }

    #[test]
    fn moving_average_trailing_window() {
        let ma = moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(ma, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn moving_average_window_one_is_identity() {
        let ma = moving_average(&[1.0, 2.0, 3.0], 1);
        assert_eq!(ma, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn moving_average_degenerate_windows() {
        assert!(moving_average(&[1.0, 2.0], 0).is_empty());
        assert!(moving_average(&[1.0, 2.0], 3).is_empty());
    }

    #[test]
    fn mean_and_stddev_helpers() {
        assert_eq!(mean(&[2.0, 4.0]), Some(3.0));
        assert_eq!(mean(&[f64::NAN]), None);
        assert!(sample_stddev(&[1.0]).is_none());
        let s = sample_stddev(&[2.0, 4.0]).unwrap();
        assert!((s - std::f64::consts::SQRT_2).abs() < 1e-9);
    }
}
