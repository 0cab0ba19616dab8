//! Confidence Intervals
//!
//! The interval method is a declared option: a Student's t interval around
//! the mean, or a bootstrap interval around whichever estimator is in use.

use crate::bootstrap::{BootstrapConfig, BootstrapError, BootstrapMethod, compute_bootstrap};
use crate::normal::student_t_quantile;
use crate::summary::{Estimator, mean, sample_std_dev, trimmed_mean};
use crate::percentiles::compute_percentile;
use serde::{Deserialize, Serialize};

/// How a confidence interval is computed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum ConfidenceMethod {
    /// `mean ± t(α/2, n-1) · s/√n`; always centered on the mean
    #[default]
    StudentT,
    /// Bootstrap resampling of the configured estimator
    Bootstrap {
        /// Number of resamples
        #[serde(default = "default_iterations")]
        iterations: usize,
        /// Use BCa regardless of sample size
        #[serde(default)]
        force_bca: bool,
    },
}

fn default_iterations() -> usize {
    crate::DEFAULT_BOOTSTRAP_ITERATIONS
}

/// Confidence interval bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    /// Lower bound
    pub lower: f64,
    /// Upper bound
    pub upper: f64,
    /// Confidence level
    pub level: f64,
    /// Method label (`student-t`, `percentile` or `bca`)
    pub method: IntervalKind,
}

/// Interval construction actually used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntervalKind {
    /// Student's t interval
    StudentT,
    /// Bootstrap percentile interval
    Percentile,
    /// Bootstrap BCa interval
    Bca,
}

impl ConfidenceInterval {
    /// Interval width
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Whether `value` lies inside the interval
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Compute a confidence interval for `estimator` over `samples`
///
/// `samples` must be the set the estimator is taken over: for
/// [`Estimator::CleanedMean`] pass the samples retained by outlier
/// detection, otherwise pass them all.
///
/// Returns an error when the sample is too small for the method
/// (two samples for Student's t, three for the bootstrap).
pub fn compute_confidence_interval(
    samples: &[f64],
    estimator: Estimator,
    method: &ConfidenceMethod,
    level: f64,
    seed: u64,
) -> Result<ConfidenceInterval, BootstrapError> {
    if level <= 0.0 || level >= 1.0 {
        return Err(BootstrapError::InvalidConfidenceLevel(level));
    }

    match method {
        ConfidenceMethod::StudentT => {
            if samples.len() < 2 {
                return Err(BootstrapError::NotEnoughSamples {
                    got: samples.len(),
                    min: 2,
                });
            }
            let n = samples.len() as f64;
            let m = mean(samples);
            let s = sample_std_dev(samples, m);
            let t = student_t_quantile(1.0 - (1.0 - level) / 2.0, n - 1.0);
            let half_width = t * s / n.sqrt();

            Ok(ConfidenceInterval {
                lower: m - half_width,
                upper: m + half_width,
                level,
                method: IntervalKind::StudentT,
            })
        }
        ConfidenceMethod::Bootstrap {
            iterations,
            force_bca,
        } => {
            let config = BootstrapConfig {
                iterations: *iterations,
                confidence_level: level,
                parallel: true,
                force_bca: *force_bca,
                seed,
            };
            let result = match estimator {
                Estimator::Mean | Estimator::CleanedMean => {
                    compute_bootstrap(samples, mean, &config)?
                }
                Estimator::Median => {
                    compute_bootstrap(samples, |s| compute_percentile(s, 50.0), &config)?
                }
                Estimator::TrimmedMean { proportion } => {
                    compute_bootstrap(samples, |s| trimmed_mean(s, proportion), &config)?
                }
            };

            Ok(ConfidenceInterval {
                lower: result.lower,
                upper: result.upper,
                level,
                method: match result.method {
                    BootstrapMethod::Percentile => IntervalKind::Percentile,
                    BootstrapMethod::Bca => IntervalKind::Bca,
                },
            })
        }
    }
}
