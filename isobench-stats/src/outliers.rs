//! Outlier Detection
//!
//! Outliers are flagged, not discarded: every summary field keeps all
//! samples except the cleaned mean and stddev.

use crate::percentiles::{percentile_of_sorted, sorted_copy};
use serde::{Deserialize, Serialize};

/// How samples are flagged as outliers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum OutlierMethod {
    /// Outliers lie outside `[Q1 - k*IQR, Q3 + k*IQR]`
    Iqr {
        /// IQR multiplier (Tukey fences use 1.5)
        k: f64,
    },
    /// Outliers lie more than `threshold` standard deviations from the mean
    ZScore {
        /// Number of standard deviations
        threshold: f64,
    },
    /// No outlier detection
    None,
}

impl Default for OutlierMethod {
    fn default() -> Self {
        OutlierMethod::Iqr { k: 1.5 }
    }
}

/// Samples split by the fences of an [`OutlierMethod`]
#[derive(Debug, Clone)]
pub struct OutlierAnalysis {
    /// Samples inside the fences, in input order
    pub retained: Vec<f64>,
    /// Input indices of flagged samples
    pub flagged: Vec<usize>,
    /// Flagged samples under the lower fence
    pub below: usize,
    /// Flagged samples over the upper fence
    pub above: usize,
    /// Lower fence
    pub lower_fence: f64,
    /// Upper fence
    pub upper_fence: f64,
    /// Detection method used
    pub method: OutlierMethod,
    total: usize,
}

impl OutlierAnalysis {
    /// Share of flagged samples, in `[0, 1]`
    pub fn flagged_fraction(&self) -> f64 {
        match self.total {
            0 => 0.0,
            total => self.flagged.len() as f64 / total as f64,
        }
    }

    /// More than `fraction` of the samples were flagged; usually means
    /// something else was running on the benchmark cores
    pub fn is_noisy(&self, fraction: f64) -> bool {
        self.flagged_fraction() > fraction
    }

    fn keep_all(samples: &[f64], method: OutlierMethod, lower: f64, upper: f64) -> Self {
        Self {
            retained: samples.to_vec(),
            flagged: Vec::new(),
            below: 0,
            above: 0,
            lower_fence: lower,
            upper_fence: upper,
            method,
            total: samples.len(),
        }
    }
}

/// Flag samples outside the fences of `method`
///
/// # Examples
///
/// ```
/// # use isobench_stats::{detect_outliers, OutlierMethod};
/// let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0, 100.0];
/// let analysis = detect_outliers(&samples, OutlierMethod::default());
/// assert_eq!(analysis.above, 1);
/// assert_eq!(analysis.flagged, vec![5]);
/// ```
pub fn detect_outliers(samples: &[f64], method: OutlierMethod) -> OutlierAnalysis {
    if samples.is_empty() {
        return OutlierAnalysis::keep_all(samples, method, 0.0, 0.0);
    }

    match method {
        OutlierMethod::None => {
            OutlierAnalysis::keep_all(samples, method, f64::NEG_INFINITY, f64::INFINITY)
        }
        OutlierMethod::Iqr { k } => {
            let sorted = sorted_copy(samples);
            let q1 = percentile_of_sorted(&sorted, 25.0);
            let q3 = percentile_of_sorted(&sorted, 75.0);
            let iqr = q3 - q1;
            partition(samples, method, q1 - k * iqr, q3 + k * iqr)
        }
        OutlierMethod::ZScore { threshold } => {
            let n = samples.len() as f64;
            let mean = samples.iter().sum::<f64>() / n;
            let std_dev = (samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();

            if std_dev == 0.0 {
                return OutlierAnalysis::keep_all(samples, method, mean, mean);
            }
            partition(
                samples,
                method,
                mean - threshold * std_dev,
                mean + threshold * std_dev,
            )
        }
    }
}

fn partition(samples: &[f64], method: OutlierMethod, lower: f64, upper: f64) -> OutlierAnalysis {
    let mut analysis = OutlierAnalysis {
        retained: Vec::with_capacity(samples.len()),
        flagged: Vec::new(),
        below: 0,
        above: 0,
        lower_fence: lower,
        upper_fence: upper,
        method,
        total: samples.len(),
    };

    for (index, &value) in samples.iter().enumerate() {
        if value < lower {
            analysis.below += 1;
        } else if value > upper {
            analysis.above += 1;
        } else {
            analysis.retained.push(value);
            continue;
        }
        analysis.flagged.push(index);
    }
    analysis
}
