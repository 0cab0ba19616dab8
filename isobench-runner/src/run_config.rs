//! Session parameters.

use crate::aggregate::StatsConfig;
use isobench_core::{BackendKind, DriverKind};
use isobench_core::driver::DEFAULT_CAPTURE_LIMIT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How cores are carved into execution slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSetSpec {
    /// Number of parallel slots; `None` uses every free core
    #[serde(default)]
    pub slots: Option<usize>,
    /// Cores reserved per slot
    #[serde(default = "default_cores_per_slot")]
    pub cores_per_slot: usize,
    /// Reserve cores exclusively
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
    /// Core kept free for the coordinator and the rest of the system
    #[serde(default)]
    pub housekeeping_core: Option<usize>,
    /// Host facility that binds benchmarks to their cores
    #[serde(default)]
    pub backend: BackendKind,
    /// Refuse to run when exclusive sets cannot keep other host work off
    /// their cores
    #[serde(default)]
    pub require_host_isolation: bool,
}

impl Default for CpuSetSpec {
    fn default() -> Self {
        Self {
            slots: None,
            cores_per_slot: default_cores_per_slot(),
            exclusive: default_exclusive(),
            housekeeping_core: None,
            backend: BackendKind::default(),
            require_host_isolation: false,
        }
    }
}

fn default_cores_per_slot() -> usize {
    1
}
fn default_exclusive() -> bool {
    true
}

/// Delay between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    /// Constant delay
    Fixed { delay: Duration },
    /// `initial * 2^retry`, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (zero-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { initial, max } => initial
                .checked_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
                .unwrap_or(max)
                .min(max),
        }
    }
}

/// Parameters of one benchmarking session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Recorded runs per program
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,
    /// Seed for round shuffling and bootstrap resampling
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub cpuset: CpuSetSpec,
    #[serde(default)]
    pub driver: DriverKind,
    /// Per-attempt timeout
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Extra attempts for a retryable failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Unrecorded warm-up rounds run before the measured ones
    #[serde(default)]
    pub discarded_runs: usize,
    /// Shuffle program order within each round
    #[serde(default)]
    pub shuffle: bool,
    /// Scheduling priority of benchmark processes
    #[serde(default)]
    pub niceness: Option<i32>,
    /// Stop issuing runs after this long
    #[serde(default)]
    pub max_session_time: Option<Duration>,
    /// Bytes of stdout/stderr kept per stream
    #[serde(default = "default_capture_limit")]
    pub capture_limit: usize,
    #[serde(default)]
    pub stats: StatsConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repetitions: default_repetitions(),
            seed: 0,
            cpuset: CpuSetSpec::default(),
            driver: DriverKind::default(),
            timeout: None,
            max_retries: default_max_retries(),
            backoff: Backoff::default(),
            discarded_runs: 0,
            shuffle: false,
            niceness: None,
            max_session_time: None,
            capture_limit: default_capture_limit(),
            stats: StatsConfig::default(),
        }
    }
}

fn default_repetitions() -> usize {
    10
}
fn default_max_retries() -> u32 {
    2
}
fn default_capture_limit() -> usize {
    DEFAULT_CAPTURE_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        assert_eq!(Backoff::None.delay(3), Duration::ZERO);

        let fixed = Backoff::Fixed {
            delay: Duration::from_millis(20),
        };
        assert_eq!(fixed.delay(0), Duration::from_millis(20));
        assert_eq!(fixed.delay(5), Duration::from_millis(20));

        let exp = Backoff::Exponential {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
        };
        assert_eq!(exp.delay(0), Duration::from_millis(10));
        assert_eq!(exp.delay(1), Duration::from_millis(20));
        assert_eq!(exp.delay(2), Duration::from_millis(40));
        assert_eq!(exp.delay(3), Duration::from_millis(50));
        assert_eq!(exp.delay(64), Duration::from_millis(50));
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.repetitions, 10);
        assert_eq!(config.max_retries, 2);
        assert!(config.cpuset.exclusive);
        assert_eq!(config.cpuset.cores_per_slot, 1);
        assert_eq!(config.driver, DriverKind::Rusage);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: RunConfig = serde_json::from_str(r#"{"repetitions": 3}"#).unwrap();
        assert_eq!(config.repetitions, 3);
        assert_eq!(config.capture_limit, DEFAULT_CAPTURE_LIMIT);
    }
}
