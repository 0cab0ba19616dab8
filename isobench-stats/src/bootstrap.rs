//! Bootstrap Resampling
//!
//! Percentile and BCa (Bias-Corrected and Accelerated) bootstrap intervals
//! for an arbitrary statistic. Resampling is driven by a seeded ChaCha
//! stream per chunk, so the same seed always yields the same interval no
//! matter how rayon schedules the chunks.

use crate::normal::{normal_cdf, normal_quantile};
use crate::{BCA_THRESHOLD, DEFAULT_BOOTSTRAP_ITERATIONS, DEFAULT_CONFIDENCE_LEVEL};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resamples drawn per RNG stream
const CHUNK_SIZE: usize = 256;

/// Bootstrap configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Number of bootstrap resamples
    pub iterations: usize,
    /// Confidence level (0.95 for a 95% interval)
    pub confidence_level: f64,
    /// Resample on the rayon pool
    pub parallel: bool,
    /// Use BCa even for large samples
    pub force_bca: bool,
    /// RNG seed
    pub seed: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_BOOTSTRAP_ITERATIONS,
            confidence_level: DEFAULT_CONFIDENCE_LEVEL,
            parallel: true,
            force_bca: false,
            seed: 0,
        }
    }
}

/// Which bootstrap interval was computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapMethod {
    /// Plain percentile interval (N >= 100)
    Percentile,
    /// BCa interval (small samples or forced)
    Bca,
}

/// Result of bootstrap analysis
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapResult {
    /// Statistic evaluated on the original samples
    pub point_estimate: f64,
    /// Lower interval bound
    pub lower: f64,
    /// Upper interval bound
    pub upper: f64,
    /// Standard deviation of the bootstrap distribution
    pub standard_error: f64,
    /// Which interval was computed
    pub method: BootstrapMethod,
}

/// Errors that can occur during bootstrap
#[derive(Debug, Error, PartialEq)]
pub enum BootstrapError {
    #[error("Not enough samples: got {got}, need at least {min}")]
    NotEnoughSamples { got: usize, min: usize },

    #[error("Invalid confidence level: {0} (must be between 0 and 1)")]
    InvalidConfidenceLevel(f64),

    #[error("Bootstrap needs at least one iteration")]
    NoIterations,
}

/// Bootstrap interval for `statistic` over `samples`
///
/// Selects BCa automatically below [`BCA_THRESHOLD`] samples.
pub fn compute_bootstrap<F>(
    samples: &[f64],
    statistic: F,
    config: &BootstrapConfig,
) -> Result<BootstrapResult, BootstrapError>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    if samples.len() < 3 {
        return Err(BootstrapError::NotEnoughSamples {
            got: samples.len(),
            min: 3,
        });
    }
    if config.confidence_level <= 0.0 || config.confidence_level >= 1.0 {
        return Err(BootstrapError::InvalidConfidenceLevel(
            config.confidence_level,
        ));
    }
    if config.iterations == 0 {
        return Err(BootstrapError::NoIterations);
    }

    let point_estimate = statistic(samples);
    let use_bca = config.force_bca || samples.len() < BCA_THRESHOLD;

    if samples.iter().all(|&x| x == samples[0]) {
        return Ok(BootstrapResult {
            point_estimate,
            lower: point_estimate,
            upper: point_estimate,
            standard_error: 0.0,
            method: if use_bca {
                BootstrapMethod::Bca
            } else {
                BootstrapMethod::Percentile
            },
        });
    }

    let mut replicates = resample(samples, &statistic, config);
    let standard_error = {
        let m = crate::summary::mean(&replicates);
        (replicates.iter().map(|x| (x - m).powi(2)).sum::<f64>() / replicates.len() as f64)
            .sqrt()
    };

    let below = replicates.iter().filter(|&&x| x < point_estimate).count();
    replicates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let (lower, upper, method) = if use_bca {
        let (lo, hi) = bca_interval(
            samples,
            &statistic,
            &replicates,
            below,
            config.confidence_level,
        );
        (lo, hi, BootstrapMethod::Bca)
    } else {
        let (lo, hi) = percentile_interval(&replicates, config.confidence_level);
        (lo, hi, BootstrapMethod::Percentile)
    };

    Ok(BootstrapResult {
        point_estimate,
        lower,
        upper,
        standard_error,
        method,
    })
}

/// Draw `config.iterations` replicates of `statistic`, chunk-seeded for determinism
fn resample<F>(samples: &[f64], statistic: &F, config: &BootstrapConfig) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64 + Sync,
{
    let chunks = config.iterations.div_ceil(CHUNK_SIZE);
    let run_chunk = |chunk: usize| -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        rng.set_stream(chunk as u64);
        let count = CHUNK_SIZE.min(config.iterations - chunk * CHUNK_SIZE);
        let mut buffer = vec![0.0; samples.len()];
        (0..count)
            .map(|_| {
                for slot in buffer.iter_mut() {
                    *slot = samples[rng.gen_range(0..samples.len())];
                }
                statistic(&buffer)
            })
            .collect()
    };

    if config.parallel {
        (0..chunks)
            .into_par_iter()
            .map(run_chunk)
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    } else {
        (0..chunks).flat_map(run_chunk).collect()
    }
}

/// Percentile interval over sorted replicates
fn percentile_interval(sorted: &[f64], confidence: f64) -> (f64, f64) {
    let n = sorted.len();
    let alpha = (1.0 - confidence) / 2.0;

    let lower_idx = ((alpha * n as f64).floor() as usize).min(n - 1);
    let upper_idx = (((1.0 - alpha) * n as f64).floor() as usize).min(n - 1);

    (sorted[lower_idx], sorted[upper_idx])
}

/// BCa interval over sorted replicates
///
/// `below` is the number of replicates strictly below the point estimate.
fn bca_interval<F>(
    samples: &[f64],
    statistic: &F,
    sorted: &[f64],
    below: usize,
    confidence: f64,
) -> (f64, f64)
where
    F: Fn(&[f64]) -> f64,
{
    let n = samples.len();
    let b = sorted.len();

    // Bias correction
    let prop = below as f64 / b as f64;
    let z0 = normal_quantile(prop.clamp(0.0001, 0.9999));

    // Acceleration via jackknife
    let mut leave_one_out = Vec::with_capacity(n - 1);
    let jackknife: Vec<f64> = (0..n)
        .map(|i| {
            leave_one_out.clear();
            leave_one_out.extend(
                samples
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, &v)| v),
            );
            statistic(&leave_one_out)
        })
        .collect();

    let jack_mean = crate::summary::mean(&jackknife);
    let numerator: f64 = jackknife.iter().map(|x| (jack_mean - x).powi(3)).sum();
    let denominator: f64 = jackknife.iter().map(|x| (jack_mean - x).powi(2)).sum();
    let a = if denominator.abs() < 1e-12 {
        0.0
    } else {
        numerator / (6.0 * denominator.powf(1.5))
    };

    let alpha = (1.0 - confidence) / 2.0;
    let z_lo = normal_quantile(alpha);
    let z_hi = normal_quantile(1.0 - alpha);

    let alpha1 = normal_cdf(z0 + (z0 + z_lo) / (1.0 - a * (z0 + z_lo)));
    let alpha2 = normal_cdf(z0 + (z0 + z_hi) / (1.0 - a * (z0 + z_hi)));

    let lower_idx = ((alpha1 * b as f64).floor() as usize).min(b - 1);
    let upper_idx = ((alpha2 * b as f64).floor() as usize).min(b - 1);

    (sorted[lower_idx], sorted[upper_idx])
}
