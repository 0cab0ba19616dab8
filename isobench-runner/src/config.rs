//! Configuration loading from isobench.toml
//!
//! A session can be described entirely in an `isobench.toml` file: runner
//! parameters, core allocation, the measurement driver, statistics and the
//! programs to compare. The file is discovered by walking up from the current
//! directory.

use crate::aggregate::StatsConfig;
use crate::run_config::{Backoff, CpuSetSpec, RunConfig};
use isobench_core::driver::DEFAULT_CAPTURE_LIMIT;
use isobench_core::{BenchmarkProgram, DriverKind, OutputValidator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up by [`IsobenchConfig::discover`]
pub const CONFIG_FILE_NAME: &str = "isobench.toml";

/// isobench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IsobenchConfig {
    /// Session parameters
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Core allocation
    #[serde(default)]
    pub cpuset: CpuSetSpec,
    /// Measurement strategy
    #[serde(default)]
    pub driver: DriverKind,
    /// Statistical options
    #[serde(default)]
    pub stats: StatsConfig,
    /// Programs under comparison, one `[[program]]` table each
    #[serde(default, rename = "program")]
    pub programs: Vec<ProgramConfig>,
}

/// Runner configuration; durations are strings like "500ms" or "2m"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Recorded runs per program
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,
    /// Unrecorded warm-up rounds
    #[serde(default)]
    pub discarded_runs: usize,
    /// Per-attempt timeout
    #[serde(default)]
    pub timeout: Option<String>,
    /// Extra attempts for a retryable failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry delay strategy: "none", "fixed" or "exponential"
    #[serde(default = "default_backoff")]
    pub backoff: String,
    /// Fixed delay, or initial delay for exponential backoff
    #[serde(default = "default_backoff_delay")]
    pub backoff_delay: String,
    /// Upper bound of exponential backoff
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,
    /// Shuffle program order within each round
    #[serde(default)]
    pub shuffle: bool,
    /// Seed for shuffling and bootstrap resampling
    #[serde(default)]
    pub seed: u64,
    /// Scheduling priority of benchmark processes
    #[serde(default)]
    pub niceness: Option<i32>,
    /// Stop starting runs after this long
    #[serde(default)]
    pub max_session_time: Option<String>,
    /// Bytes of stdout/stderr kept per stream
    #[serde(default = "default_capture_limit")]
    pub capture_limit: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            repetitions: default_repetitions(),
            discarded_runs: 0,
            timeout: None,
            max_retries: default_max_retries(),
            backoff: default_backoff(),
            backoff_delay: default_backoff_delay(),
            backoff_max: default_backoff_max(),
            shuffle: false,
            seed: 0,
            niceness: None,
            max_session_time: None,
            capture_limit: default_capture_limit(),
        }
    }
}

fn default_repetitions() -> usize {
    10
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff() -> String {
    "none".to_string()
}
fn default_backoff_delay() -> String {
    "100ms".to_string()
}
fn default_backoff_max() -> String {
    "5s".to_string()
}
fn default_capture_limit() -> usize {
    DEFAULT_CAPTURE_LIMIT
}

/// One `[[program]]` entry
///
/// Exactly one of `command` (argument vector) or `shell` (run via `sh -c`)
/// must be given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub name: String,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Output checks; omit to accept any zero exit
    #[serde(default)]
    pub validator: Option<OutputValidator>,
}

impl ProgramConfig {
    /// Build the program this entry describes
    pub fn to_program(&self) -> anyhow::Result<BenchmarkProgram> {
        let mut program = match (&self.command, &self.shell) {
            (Some(command), None) => {
                if command.is_empty() {
                    anyhow::bail!("Program '{}' has an empty command", self.name);
                }
                BenchmarkProgram::new(&self.name, command.iter().cloned())
            }
            (None, Some(line)) => BenchmarkProgram::shell(&self.name, line),
            (Some(_), Some(_)) => {
                anyhow::bail!("Program '{}' sets both command and shell", self.name)
            }
            (None, None) => anyhow::bail!("Program '{}' needs a command or shell", self.name),
        };

        if let Some(dir) = &self.working_dir {
            program = program.with_working_dir(dir);
        }
        for (key, value) in &self.env {
            program = program.with_env(key, value);
        }
        if let Some(validator) = &self.validator {
            program = program.with_validator(validator.clone());
        }
        Ok(program)
    }
}

impl IsobenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Discover and load configuration by walking up from the current directory
    ///
    /// Returns `Ok(None)` when no file is found; a file that exists but does
    /// not parse is an error.
    pub fn discover() -> anyhow::Result<Option<Self>> {
        let start = std::env::current_dir()?;
        Self::discover_from(&start)
    }

    /// Like [`discover`](Self::discover), starting at `start`
    pub fn discover_from(start: &Path) -> anyhow::Result<Option<Self>> {
        let mut dir = start.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.is_file() {
                tracing::debug!(path = %config_path.display(), "Loading configuration");
                return Self::load(&config_path).map(Some);
            }
            if !dir.pop() {
                return Ok(None);
            }
        }
    }

    /// Session parameters with every duration parsed
    pub fn run_config(&self) -> anyhow::Result<RunConfig> {
        let runner = &self.runner;
        let optional = |s: &Option<String>| s.as_deref().map(Self::parse_duration).transpose();

        let backoff = match runner.backoff.to_lowercase().as_str() {
            "none" => Backoff::None,
            "fixed" => Backoff::Fixed {
                delay: Self::parse_duration(&runner.backoff_delay)?,
            },
            "exponential" => Backoff::Exponential {
                initial: Self::parse_duration(&runner.backoff_delay)?,
                max: Self::parse_duration(&runner.backoff_max)?,
            },
            other => anyhow::bail!("Unknown backoff strategy: {}", other),
        };

        Ok(RunConfig {
            repetitions: runner.repetitions,
            seed: runner.seed,
            cpuset: self.cpuset.clone(),
            driver: self.driver.clone(),
            timeout: optional(&runner.timeout)?,
            max_retries: runner.max_retries,
            backoff,
            discarded_runs: runner.discarded_runs,
            shuffle: runner.shuffle,
            niceness: runner.niceness,
            max_session_time: optional(&runner.max_session_time)?,
            capture_limit: runner.capture_limit,
            stats: self.stats.clone(),
        })
    }

    /// Every `[[program]]` entry, in file order
    pub fn programs(&self) -> anyhow::Result<Vec<BenchmarkProgram>> {
        self.programs.iter().map(ProgramConfig::to_program).collect()
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# isobench configuration

[runner]
# Recorded runs per program
repetitions = 10
# Unrecorded warm-up rounds before measuring
discarded_runs = 0
# Per-attempt timeout (uncomment to enable)
# timeout = "60s"
# Extra attempts after a timeout, spawn or isolation failure
max_retries = 2
# Delay between retries: "none", "fixed" or "exponential"
backoff = "none"
backoff_delay = "100ms"
backoff_max = "5s"
# Shuffle program order within each round
shuffle = false
seed = 0
# Scheduling priority of benchmark processes (uncomment to enable)
# niceness = 0
# Stop starting runs after this long (uncomment to enable)
# max_session_time = "30m"

[cpuset]
# Parallel slots; defaults to every free core
# slots = 2
cores_per_slot = 1
exclusive = true
# Core left to the coordinator (uncomment to enable)
# housekeeping_core = 0
# Fail instead of warning when other processes could share reserved cores
require_host_isolation = false

[cpuset.backend]
# "affinity", or "cgroup" with root = "<delegated cgroup v2 directory>"
kind = "affinity"

[driver]
# "plain-exec", "time-wrapped", "rusage" or "perf-counters"
kind = "rusage"

[stats]
confidence_level = 0.95
percentiles = [50.0, 75.0, 90.0, 95.0, 99.0]
# Only aggregate matching properties (uncomment to enable)
# properties = "^(wall_time|max_rss_kib)$"

[stats.estimator]
# "mean", "cleaned-mean", "median" or "trimmed-mean"
kind = "mean"

[stats.outliers]
# "iqr", "z-score" or "none"
method = "iqr"
k = 1.5

[stats.confidence]
# "student-t" or "bootstrap"
method = "student-t"

# [[program]]
# name = "baseline"
# command = ["./target/release/app", "--input", "data.bin"]
#
# [[program]]
# name = "candidate"
# shell = "./candidate < data.bin"
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m")
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Invalid duration: {}", s));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        let nanos = (value * multiplier as f64).round();
        if nanos >= u64::MAX as f64 {
            return Err(anyhow::anyhow!("Duration out of range: {}", s));
        }
        Ok(Duration::from_nanos(nanos as u64))
    }
}
