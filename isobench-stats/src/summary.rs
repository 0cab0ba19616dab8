//! Summary Statistics
//!
//! - mean, stddev, min, max, median, trimmed mean and percentiles cover ALL data
//! - `cleaned_mean` and `cleaned_std_dev` cover the samples inside the outlier fences

use crate::outliers::{OutlierMethod, detect_outliers};
use crate::percentiles::{PercentileValue, percentile_of_sorted, sorted_copy};
use serde::{Deserialize, Serialize};

/// Point estimator used as the headline value of a property
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Estimator {
    /// Arithmetic mean of all samples
    #[default]
    Mean,
    /// Arithmetic mean of the samples inside the outlier fences
    CleanedMean,
    /// Median of all samples
    Median,
    /// Mean after discarding `proportion` of the samples from each tail
    TrimmedMean {
        /// Fraction cut from each end, in `[0, 0.5)`
        proportion: f64,
    },
}

/// Summary statistics over one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    /// Mean of all samples
    pub mean: f64,
    /// Sample standard deviation of all samples
    pub std_dev: f64,
    /// Mean of the samples inside the outlier fences
    pub cleaned_mean: f64,
    /// Sample standard deviation of the samples inside the outlier fences
    pub cleaned_std_dev: f64,
    /// Median of all samples
    pub median: f64,
    /// Trimmed mean of all samples (at the configured proportion)
    pub trimmed_mean: f64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
    /// Requested percentiles of all samples
    pub percentiles: Vec<PercentileValue>,
    /// Number of samples
    pub sample_count: usize,
    /// Number of flagged outliers
    pub outlier_count: usize,
}

/// Options controlling [`compute_summary`]
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOptions<'a> {
    /// Outlier detection behind `cleaned_mean`/`cleaned_std_dev`
    pub outlier_method: OutlierMethod,
    /// Percentile ranks to report
    pub percentiles: &'a [f64],
    /// Tail proportion for the trimmed mean
    pub trim_proportion: f64,
}

impl Default for SummaryOptions<'_> {
    fn default() -> Self {
        Self {
            outlier_method: OutlierMethod::default(),
            percentiles: &crate::percentiles::DEFAULT_PERCENTILES,
            trim_proportion: 0.1,
        }
    }
}

/// Compute summary statistics over `samples`
pub fn compute_summary(samples: &[f64], options: &SummaryOptions<'_>) -> SummaryStatistics {
    if samples.is_empty() {
        return SummaryStatistics {
            mean: 0.0,
            std_dev: 0.0,
            cleaned_mean: 0.0,
            cleaned_std_dev: 0.0,
            median: 0.0,
            trimmed_mean: 0.0,
            min: 0.0,
            max: 0.0,
            percentiles: options
                .percentiles
                .iter()
                .map(|&rank| PercentileValue { rank, value: 0.0 })
                .collect(),
            sample_count: 0,
            outlier_count: 0,
        };
    }

    let analysis = detect_outliers(samples, options.outlier_method);
    let cleaned = &analysis.retained;
    let sorted = sorted_copy(samples);

    let all_mean = mean(samples);
    let cleaned_mean = if cleaned.is_empty() {
        all_mean
    } else {
        mean(cleaned)
    };

    SummaryStatistics {
        mean: all_mean,
        std_dev: sample_std_dev(samples, all_mean),
        cleaned_mean,
        cleaned_std_dev: sample_std_dev(cleaned, cleaned_mean),
        median: percentile_of_sorted(&sorted, 50.0),
        trimmed_mean: trimmed_mean_of_sorted(&sorted, options.trim_proportion),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        percentiles: options
            .percentiles
            .iter()
            .map(|&rank| PercentileValue {
                rank,
                value: percentile_of_sorted(&sorted, rank),
            })
            .collect(),
        sample_count: samples.len(),
        outlier_count: analysis.flagged.len(),
    }
}

impl SummaryStatistics {
    /// Value of the chosen estimator
    ///
    /// A trimmed mean at a proportion other than the one the summary was
    /// computed with is not available here; use [`trimmed_mean`] directly.
    pub fn estimate(&self, estimator: Estimator) -> f64 {
        match estimator {
            Estimator::Mean => self.mean,
            Estimator::CleanedMean => self.cleaned_mean,
            Estimator::Median => self.median,
            Estimator::TrimmedMean { .. } => self.trimmed_mean,
        }
    }

    /// Coefficient of variation in percent
    pub fn coefficient_of_variation(&self) -> f64 {
        if self.mean == 0.0 {
            0.0
        } else {
            (self.std_dev / self.mean) * 100.0
        }
    }

    /// Look up a reported percentile by rank
    pub fn percentile(&self, rank: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| (p.rank - rank).abs() < 1e-9)
            .map(|p| p.value)
    }
}

/// Mean after cutting `proportion` of samples from each tail
///
/// The proportion is clamped to `[0, 0.5)`; at least one sample is always kept.
pub fn trimmed_mean(samples: &[f64], proportion: f64) -> f64 {
    trimmed_mean_of_sorted(&sorted_copy(samples), proportion)
}

fn trimmed_mean_of_sorted(sorted: &[f64], proportion: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let proportion = proportion.clamp(0.0, 0.499);
    let cut = ((sorted.len() as f64) * proportion).floor() as usize;
    let kept = &sorted[cut..sorted.len() - cut];
    if kept.is_empty() {
        percentile_of_sorted(sorted, 50.0)
    } else {
        mean(kept)
    }
}

pub(crate) fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

pub(crate) fn sample_std_dev(samples: &[f64], mean: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let variance =
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
    variance.sqrt()
}
