#![warn(missing_docs)]
//! isobench Statistical Engine
//!
//! Statistics over the per-property samples of a benchmark program:
//! - Summary statistics with robust estimators (median, trimmed mean)
//! - Outlier detection via IQR or z-score fences
//! - Percentiles computed from raw samples so noise tails stay visible
//! - Confidence intervals by Student's t or seeded bootstrap (percentile / BCa)

mod bootstrap;
mod confidence;
mod normal;
mod outliers;
mod percentiles;
mod summary;

pub use bootstrap::{
    BootstrapConfig, BootstrapError, BootstrapMethod, BootstrapResult, compute_bootstrap,
};
pub use confidence::{
    ConfidenceInterval, ConfidenceMethod, IntervalKind, compute_confidence_interval,
};
pub use normal::{normal_cdf, normal_quantile, student_t_quantile};
pub use outliers::{OutlierAnalysis, OutlierMethod, detect_outliers};
pub use percentiles::{
    DEFAULT_PERCENTILES, PercentileValue, compute_percentile, compute_percentiles,
};
pub use summary::{Estimator, SummaryOptions, SummaryStatistics, compute_summary, trimmed_mean};

/// Below this many samples the bootstrap uses BCa instead of the percentile interval
pub const BCA_THRESHOLD: usize = 100;

/// Default number of bootstrap iterations
pub const DEFAULT_BOOTSTRAP_ITERATIONS: usize = 10_000;

/// Default confidence level (95%)
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;
