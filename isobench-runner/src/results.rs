//! Result sequences and the session report handed to exporters.

use crate::aggregate::{AggregatedStats, StatsAggregator};
use chrono::{DateTime, Utc};
use isobench_core::{BenchmarkProgram, RunResult};
use std::collections::BTreeMap;
use std::time::Duration;

/// A program's results in completion order, with cached statistics
///
/// The cache is dropped whenever a result is appended.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    results: Vec<RunResult>,
    cache: Option<CachedStats>,
}

#[derive(Debug, Clone)]
struct CachedStats {
    config: crate::aggregate::StatsConfig,
    seed: u64,
    stats: AggregatedStats,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed run
    pub fn push(&mut self, result: RunResult) {
        self.results.push(result);
        self.cache = None;
    }

    /// Results in completion order
    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    /// Results in submission (repetition) order
    pub fn by_repetition(&self) -> Vec<&RunResult> {
        let mut ordered: Vec<&RunResult> = self.results.iter().collect();
        ordered.sort_by_key(|r| r.repetition());
        ordered
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.results.len() - self.success_count()
    }

    /// Statistics under `aggregator`, computed on first use
    pub fn stats(&mut self, aggregator: &StatsAggregator) -> &AggregatedStats {
        let fresh = self.cache.as_ref().is_some_and(|c| {
            c.seed == aggregator.seed() && &c.config == aggregator.config()
        });
        if !fresh {
            self.cache = None;
        }
        let results = &self.results;
        &self
            .cache
            .get_or_insert_with(|| CachedStats {
                config: aggregator.config().clone(),
                seed: aggregator.seed(),
                stats: aggregator.aggregate(results),
            })
            .stats
    }

    /// Whether statistics are currently cached
    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }
}

/// One program and its results
#[derive(Debug, Clone)]
pub struct ProgramResults {
    pub program: BenchmarkProgram,
    pub results: ResultSet,
}

/// Everything a session produced
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub programs: Vec<ProgramResults>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Cancelled by the user or stopped by the session time budget
    pub interrupted: bool,
}

impl SessionReport {
    pub fn success_count(&self) -> usize {
        self.programs.iter().map(|p| p.results.success_count()).sum()
    }

    pub fn failure_count(&self) -> usize {
        self.programs.iter().map(|p| p.results.failure_count()).sum()
    }

    /// Result set of the program named `name`
    pub fn program(&self, name: &str) -> Option<&ProgramResults> {
        self.programs.iter().find(|p| p.program.name() == name)
    }

    /// Aggregate every program, keyed by program name
    pub fn aggregate(&mut self, aggregator: &StatsAggregator) -> BTreeMap<String, AggregatedStats> {
        self.programs
            .iter_mut()
            .map(|p| (p.program.name().to_string(), p.results.stats(aggregator).clone()))
            .collect()
    }
}
