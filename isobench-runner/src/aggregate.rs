//! Statistics Aggregation
//!
//! Per-property statistics over a program's successful runs.
//!
//! Samples are ordered by repetition index before any statistic is computed,
//! so the output depends only on which runs exist, never on the order in
//! which they completed. Properties are processed in parallel with Rayon.

use isobench_core::{FailureKind, RunResult};
use isobench_stats::{
    ConfidenceInterval, ConfidenceMethod, DEFAULT_CONFIDENCE_LEVEL, DEFAULT_PERCENTILES, Estimator,
    OutlierMethod, SummaryOptions, SummaryStatistics, compute_confidence_interval, compute_summary,
    detect_outliers,
};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Trim proportion reported alongside mean and median
const DEFAULT_TRIM_PROPORTION: f64 = 0.1;

/// Share of flagged samples above which a property is reported as noisy
const NOISY_OUTLIER_FRACTION: f64 = 0.1;

/// Statistical options of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Headline estimator of each property
    #[serde(default)]
    pub estimator: Estimator,
    /// Outlier fences behind the cleaned mean and the noise warning
    #[serde(default)]
    pub outliers: OutlierMethod,
    /// Confidence interval construction
    #[serde(default)]
    pub confidence: ConfidenceMethod,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    /// Percentile ranks to report
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
    /// Only aggregate properties whose name matches this regex
    #[serde(default)]
    pub properties: Option<String>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            estimator: Estimator::default(),
            outliers: OutlierMethod::default(),
            confidence: ConfidenceMethod::default(),
            confidence_level: default_confidence_level(),
            percentiles: default_percentiles(),
            properties: None,
        }
    }
}

fn default_confidence_level() -> f64 {
    DEFAULT_CONFIDENCE_LEVEL
}
fn default_percentiles() -> Vec<f64> {
    DEFAULT_PERCENTILES.to_vec()
}

/// Statistics of one property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyStats {
    pub summary: SummaryStatistics,
    /// Value of the configured estimator
    pub estimate: f64,
    /// `None` when there are too few samples for the configured method
    pub confidence_interval: Option<ConfidenceInterval>,
}

/// Derived view over one program's results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AggregatedStats {
    pub successes: usize,
    pub failures: usize,
    pub failure_breakdown: BTreeMap<FailureKind, usize>,
    pub properties: BTreeMap<String, PropertyStats>,
}

impl AggregatedStats {
    pub fn property(&self, name: &str) -> Option<&PropertyStats> {
        self.properties.get(name)
    }
}

/// Computes [`AggregatedStats`] under a fixed [`StatsConfig`]
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    config: StatsConfig,
    seed: u64,
    filter: Option<Regex>,
}

impl StatsAggregator {
    /// Aggregator for `config`; `seed` drives bootstrap resampling
    pub fn new(config: StatsConfig, seed: u64) -> Result<Self, regex::Error> {
        let filter = config.properties.as_deref().map(Regex::new).transpose()?;
        Ok(Self {
            config,
            seed,
            filter,
        })
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Aggregate a program's results
    pub fn aggregate(&self, results: &[RunResult]) -> AggregatedStats {
        let mut ordered: Vec<&RunResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.repetition());

        let mut stats = AggregatedStats::default();
        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for result in ordered {
            match result.failure_entry() {
                Some(failure) => {
                    stats.failures += 1;
                    *stats.failure_breakdown.entry(failure.kind).or_default() += 1;
                }
                None => {
                    stats.successes += 1;
                    for (name, value) in result.properties() {
                        if self.wants(&name) {
                            samples.entry(name).or_default().push(value);
                        }
                    }
                }
            }
        }

        stats.properties = samples
            .into_par_iter()
            .map(|(name, values)| {
                let property = self.property_stats(&name, &values);
                (name, property)
            })
            .collect();
        stats
    }

    fn wants(&self, property: &str) -> bool {
        self.filter.as_ref().map_or(true, |re| re.is_match(property))
    }

    fn property_stats(&self, name: &str, samples: &[f64]) -> PropertyStats {
        let trim_proportion = match self.config.estimator {
            Estimator::TrimmedMean { proportion } => proportion,
            _ => DEFAULT_TRIM_PROPORTION,
        };
        let summary = compute_summary(
            samples,
            &SummaryOptions {
                outlier_method: self.config.outliers,
                percentiles: &self.config.percentiles,
                trim_proportion,
            },
        );
        let estimate = summary.estimate(self.config.estimator);

        let analysis = detect_outliers(samples, self.config.outliers);
        if analysis.is_noisy(NOISY_OUTLIER_FRACTION) {
            tracing::warn!(
                property = name,
                flagged = analysis.flagged.len(),
                samples = samples.len(),
                cv = summary.coefficient_of_variation(),
                "Many outliers; benchmark cores may be shared with other work"
            );
        }

        // the interval is taken over the same samples as the estimate
        let interval_samples = match self.config.estimator {
            Estimator::CleanedMean if !analysis.retained.is_empty() => &analysis.retained[..],
            _ => samples,
        };
        let confidence_interval = match compute_confidence_interval(
            interval_samples,
            self.config.estimator,
            &self.config.confidence,
            self.config.confidence_level,
            self.seed,
        ) {
            Ok(ci) => Some(ci),
            Err(e) => {
                tracing::debug!(property = name, "No confidence interval: {}", e);
                None
            }
        };

        PropertyStats {
            summary,
            estimate,
            confidence_interval,
        }
    }
}
