//! Run results: one record per benchmark repetition, success or failure.

use crate::error::{FailureKind, RunError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Normalized measurements of one successful execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Measurement {
    /// Exit status of the benchmark program
    pub exit_code: i32,
    /// Elapsed wall-clock time reported by the strategy
    pub wall_time: Option<Duration>,
    /// CPU time spent in user mode
    pub user_time: Option<Duration>,
    /// CPU time spent in kernel mode
    pub sys_time: Option<Duration>,
    /// Peak resident set size in KiB
    pub max_rss_kib: Option<u64>,
    /// Hardware counters by event name
    pub counters: BTreeMap<String, f64>,
    /// Captured stdout tail
    pub stdout: String,
    /// Captured stderr tail
    pub stderr: String,
}

impl Measurement {
    /// Numeric properties of this measurement; times are in seconds
    pub fn properties(&self) -> BTreeMap<String, f64> {
        let mut props = BTreeMap::new();
        if let Some(wall) = self.wall_time {
            props.insert("wall_time".to_string(), wall.as_secs_f64());
        }
        if let Some(user) = self.user_time {
            props.insert("user_time".to_string(), user.as_secs_f64());
        }
        if let Some(sys) = self.sys_time {
            props.insert("sys_time".to_string(), sys.as_secs_f64());
        }
        if let Some(rss) = self.max_rss_kib {
            props.insert("max_rss_kib".to_string(), rss as f64);
        }
        for (name, value) in &self.counters {
            props.insert(name.clone(), *value);
        }
        props
    }
}

/// One failed attempt of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// Zero-based attempt number
    pub attempt: u32,
    pub kind: FailureKind,
    pub message: String,
    /// Time spent in the attempt
    pub elapsed: Duration,
}

impl AttemptFailure {
    pub fn from_error(attempt: u32, error: &RunError, elapsed: Duration) -> Self {
        Self {
            attempt,
            kind: error.kind(),
            message: error.to_string(),
            elapsed,
        }
    }
}

/// Permanent failure entry of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Kind of the final attempt's failure
    pub kind: FailureKind,
    /// Message of the final attempt's failure
    pub message: String,
    /// Every failed attempt in order, the final one included
    pub attempts: Vec<AttemptFailure>,
}

impl RunFailure {
    /// Failure built from a list of failed attempts
    ///
    /// The last attempt determines the recorded kind.
    pub fn from_attempts(attempts: Vec<AttemptFailure>) -> Self {
        let (kind, message) = attempts
            .last()
            .map(|a| (a.kind, a.message.clone()))
            .unwrap_or((FailureKind::Cancelled, "run was never attempted".to_string()));
        Self {
            kind,
            message,
            attempts,
        }
    }

    /// Failure for a run that was never started
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: reason.into(),
            attempts: Vec::new(),
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success(Measurement),
    Failure(RunFailure),
}

/// Recorded result of one repetition of one program
///
/// Fields are only readable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    program: usize,
    repetition: usize,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    duration: Duration,
    outcome: RunOutcome,
}

impl RunResult {
    /// Result of a successful run
    pub fn success(
        program: usize,
        repetition: usize,
        started_at: DateTime<Utc>,
        duration: Duration,
        measurement: Measurement,
    ) -> Self {
        Self::new(
            program,
            repetition,
            started_at,
            duration,
            RunOutcome::Success(measurement),
        )
    }

    /// Result of a run that failed permanently
    pub fn failure(
        program: usize,
        repetition: usize,
        started_at: DateTime<Utc>,
        duration: Duration,
        failure: RunFailure,
    ) -> Self {
        Self::new(
            program,
            repetition,
            started_at,
            duration,
            RunOutcome::Failure(failure),
        )
    }

    fn new(
        program: usize,
        repetition: usize,
        started_at: DateTime<Utc>,
        duration: Duration,
        outcome: RunOutcome,
    ) -> Self {
        let ended_at = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(started_at);
        Self {
            program,
            repetition,
            started_at,
            ended_at,
            duration,
            outcome,
        }
    }

    /// Index of the program in the session
    pub fn program(&self) -> usize {
        self.program
    }

    /// Original repetition index, independent of completion order
    pub fn repetition(&self) -> usize {
        self.repetition
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }

    /// Time from spawn to exit of the final attempt
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn outcome(&self) -> &RunOutcome {
        &self.outcome
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Success(_))
    }

    pub fn measurement(&self) -> Option<&Measurement> {
        match &self.outcome {
            RunOutcome::Success(m) => Some(m),
            RunOutcome::Failure(_) => None,
        }
    }

    pub fn failure_entry(&self) -> Option<&RunFailure> {
        match &self.outcome {
            RunOutcome::Success(_) => None,
            RunOutcome::Failure(f) => Some(f),
        }
    }

    /// Numeric properties of a successful run, `duration` included
    ///
    /// Empty for failures.
    pub fn properties(&self) -> BTreeMap<String, f64> {
        match &self.outcome {
            RunOutcome::Success(m) => {
                let mut props = m.properties();
                props.insert("duration".to_string(), self.duration.as_secs_f64());
                props
            }
            RunOutcome::Failure(_) => BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurement() -> Measurement {
        Measurement {
            wall_time: Some(Duration::from_millis(12)),
            user_time: Some(Duration::from_micros(1500)),
            max_rss_kib: Some(2048),
            counters: BTreeMap::from([("cycles".to_string(), 1.0e6)]),
            ..Default::default()
        }
    }

    #[test]
    fn test_success_properties() {
        let result = RunResult::success(0, 3, Utc::now(), Duration::from_millis(10), measurement());

        let props = result.properties();
        assert!((props["duration"] - 0.010).abs() < 1e-12);
        assert!((props["wall_time"] - 0.012).abs() < 1e-12);
        assert!((props["user_time"] - 0.0015).abs() < 1e-12);
        assert_eq!(props["max_rss_kib"], 2048.0);
        assert_eq!(props["cycles"], 1.0e6);
        assert!(!props.contains_key("sys_time"));
        assert_eq!(result.repetition(), 3);
    }

    #[test]
    fn test_end_after_start() {
        let start = Utc::now();
        let result = RunResult::success(0, 0, start, Duration::from_millis(250), measurement());
        assert_eq!(
            (result.ended_at() - result.started_at()).num_milliseconds(),
            250
        );
    }

    #[test]
    fn test_failure_uses_last_attempt() {
        let attempts = vec![
            AttemptFailure::from_error(
                0,
                &RunError::TimeoutAborted(Duration::from_millis(5)),
                Duration::from_millis(5),
            ),
            AttemptFailure::from_error(
                1,
                &RunError::NonZeroExit { code: 2 },
                Duration::from_millis(1),
            ),
        ];
        let failure = RunFailure::from_attempts(attempts);
        assert_eq!(failure.kind, FailureKind::NonZeroExit);
        assert_eq!(failure.attempts.len(), 2);

        let result = RunResult::failure(1, 0, Utc::now(), Duration::ZERO, failure);
        assert!(!result.is_success());
        assert!(result.properties().is_empty());
        assert!(result.failure_entry().is_some());
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let result = RunResult::failure(
            0,
            0,
            Utc::now(),
            Duration::ZERO,
            RunFailure::cancelled("stop"),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"]["status"], "failure");
        assert_eq!(json["outcome"]["kind"], "cancelled");
    }
}
