//! Percentile Computation
//!
//! Percentiles are always computed from the raw samples, never from the
//! outlier-cleaned set: noise tails are exactly what isolation failures look like.

use serde::{Deserialize, Serialize};

/// Default percentile ranks reported for every property
pub const DEFAULT_PERCENTILES: [f64; 5] = [50.0, 75.0, 90.0, 95.0, 99.0];

/// A single percentile rank and its value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    /// Rank in percent (0..=100)
    pub rank: f64,
    /// Interpolated sample value at that rank
    pub value: f64,
}

/// Sort a copy of the samples, ordering NaN as equal.
pub(crate) fn sorted_copy(samples: &[f64]) -> Vec<f64> {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted
}

/// Percentile of already sorted samples, linear interpolation between nearest ranks.
pub(crate) fn percentile_of_sorted(sorted: &[f64], percentile: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let p = (percentile / 100.0).clamp(0.0, 1.0);
            let rank = p * (n - 1) as f64;
            let lower_idx = rank.floor() as usize;
            let upper_idx = (lower_idx + 1).min(n - 1);
            let fraction = rank - lower_idx as f64;

            sorted[lower_idx] + fraction * (sorted[upper_idx] - sorted[lower_idx])
        }
    }
}

/// Compute a single percentile from unsorted samples
///
/// Uses linear interpolation between nearest ranks. Ranks outside
/// `0..=100` are clamped.
///
/// # Examples
///
/// ```
/// # use isobench_stats::compute_percentile;
/// let samples = vec![5.0, 1.0, 3.0, 2.0, 4.0];
/// assert_eq!(compute_percentile(&samples, 50.0), 3.0);
/// ```
pub fn compute_percentile(samples: &[f64], percentile: f64) -> f64 {
    percentile_of_sorted(&sorted_copy(samples), percentile)
}

/// Compute several percentiles with a single sort
pub fn compute_percentiles(samples: &[f64], ranks: &[f64]) -> Vec<PercentileValue> {
    let sorted = sorted_copy(samples);
    ranks
        .iter()
        .map(|&rank| PercentileValue {
            rank,
            value: percentile_of_sorted(&sorted, rank),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let p50 = compute_percentile(&samples, 50.0);
        assert!((p50 - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_quartiles_unsorted_input() {
        let mut samples: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        samples.reverse();
        let p25 = compute_percentile(&samples, 25.0);
        let p75 = compute_percentile(&samples, 75.0);

        assert!((p25 - 25.75).abs() < 0.01);
        assert!((p75 - 75.25).abs() < 0.01);
    }

    #[test]
    fn test_single_and_empty() {
        assert!((compute_percentile(&[42.0], 99.0) - 42.0).abs() < f64::EPSILON);
        assert!((compute_percentile(&[], 50.0) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_out_of_range_rank_is_clamped() {
        let samples = vec![1.0, 2.0, 3.0];
        assert_eq!(compute_percentile(&samples, 150.0), 3.0);
        assert_eq!(compute_percentile(&samples, -5.0), 1.0);
    }

    #[test]
    fn test_compute_many() {
        let samples: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let values = compute_percentiles(&samples, &DEFAULT_PERCENTILES);

        assert_eq!(values.len(), DEFAULT_PERCENTILES.len());
        assert_eq!(values[0].rank, 50.0);
        assert!(values[0].value > 49.0 && values[0].value < 51.0);
        assert!(values[4].value > 98.0 && values[4].value < 100.0);
    }
}
