#![warn(missing_docs)]
//! # isobench
//!
//! Benchmark external programs on isolated CPU cores and report statistics
//! that survive scrutiny.
//!
//! - **Core isolation**: each run executes on its own reserved core set; two
//!   exclusive sets never share a physical core
//! - **Interleaving**: repetitions of several programs are run round-robin so
//!   transient system load is spread across all of them
//! - **Fail-late**: timeouts, spawn and isolation failures are retried locally
//!   and then recorded, never dropped and never fatal to the session
//! - **Pluggable measurement**: plain exec, GNU `time`, kernel rusage or
//!   `perf stat` counters
//! - **Statistics**: robust estimators, outlier fences, percentiles and
//!   Student-t or seeded bootstrap confidence intervals
//!
//! ## Quick Start
//!
//! ```no_run
//! use isobench::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! isobench::init_logging(false);
//!
//! let manager = CpuSetManager::detect(Some(0))?;
//! let config = RunConfig {
//!     repetitions: 20,
//!     ..Default::default()
//! };
//! let programs = vec![
//!     BenchmarkProgram::new("gzip", ["gzip", "-kf", "data.bin"]),
//!     BenchmarkProgram::shell("zstd", "zstd -qf data.bin"),
//! ];
//!
//! let mut report = Scheduler::new(config.clone(), manager).run(&programs)?;
//! let aggregator = StatsAggregator::new(config.stats, config.seed)?;
//! for (name, stats) in report.aggregate(&aggregator) {
//!     if let Some(wall) = stats.property("wall_time") {
//!         println!("{name}: {:.4}s ({} failed)", wall.estimate, stats.failures);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub use isobench_core::{
    AttemptFailure, BackendKind, BenchmarkProgram, CancelToken, CoreInfo, CpuPool, CpuSet,
    CpuSetError, CpuSetHandle, CpuSetId, CpuSetManager, DriverKind, DriverOptions, ExecBinding,
    FailureKind, FixedTopology, IsolationBackend, Measurement, MeasurementCollector,
    OutputValidator, ParseError, PerfWrapper, RunAttempt, RunDriver, RunError, RunFailure,
    RunOutcome, RunResult, TimeWrapper,
};

#[cfg(target_os = "linux")]
pub use isobench_core::{CgroupCpuset, LinuxAffinity};

pub use isobench_runner::{
    AggregatedStats, Backoff, CpuSetSpec, IsobenchConfig, ProgramResults, PropertyStats,
    ResultSet, RunConfig, Scheduler, SessionError, SessionReport, StatsAggregator, StatsConfig,
};

pub use isobench_stats::{
    ConfidenceInterval, ConfidenceMethod, Estimator, OutlierMethod, SummaryStatistics,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BenchmarkProgram, CancelToken, ConfidenceMethod, CpuSetManager, CpuSetSpec, DriverKind,
        Estimator, FailureKind, IsobenchConfig, OutlierMethod, RunConfig, Scheduler,
        SessionReport, StatsAggregator,
    };
}

/// Install a `tracing` subscriber for isobench's own events
///
/// `verbose` enables per-run debug events. Does nothing if a global
/// subscriber is already installed.
pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        "isobench=debug"
    } else {
        "isobench=info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .try_init();
}
