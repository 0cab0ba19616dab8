//! isobench Runner - Session Orchestration
//!
//! Turns a list of programs and a [`RunConfig`] into a [`SessionReport`]:
//! - Configuration loading from `isobench.toml`
//! - Slot scheduling over exclusive core sets with local retries
//! - Per-program result sets with cached, deterministic statistics

mod aggregate;
mod config;
mod error;
mod results;
mod run_config;
mod scheduler;

pub use aggregate::{AggregatedStats, PropertyStats, StatsAggregator, StatsConfig};
pub use config::{CONFIG_FILE_NAME, IsobenchConfig, ProgramConfig, RunnerConfig};
pub use error::SessionError;
pub use results::{ProgramResults, ResultSet, SessionReport};
pub use run_config::{Backoff, CpuSetSpec, RunConfig};
pub use scheduler::Scheduler;
