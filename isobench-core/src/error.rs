//! Error taxonomy for isolation, execution and measurement parsing.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the CPU isolation layer
#[derive(Debug, Error)]
pub enum CpuSetError {
    #[error("Insufficient isolable cores: requested {requested}, {available} available")]
    ResourceExhausted { requested: usize, available: usize },

    #[error("Process {0} not found (already exited?)")]
    ProcessNotFound(u32),

    #[error("Failed to bind to cores {cores:?}: {message}")]
    IsolationSetup { cores: Vec<usize>, message: String },

    #[error("Invalid cpuset request: {0}")]
    InvalidRequest(String),

    #[error("Failed to read CPU topology: {0}")]
    Topology(#[from] std::io::Error),
}

/// Measurement-wrapper output that does not match the expected versioned format
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{format}: measurement output missing")]
    MissingOutput { format: &'static str },

    #[error("{format}: unrecognized format header {found:?}")]
    UnknownVersion { format: &'static str, found: String },

    #[error("{format}: required field '{field}' missing")]
    MissingField { format: &'static str, field: String },

    #[error("{format}: field '{field}' has invalid value {value:?}")]
    InvalidValue {
        format: &'static str,
        field: String,
        value: String,
    },

    #[error("{format}: field '{field}' appears more than once")]
    DuplicateField { format: &'static str, field: String },

    #[error("{format}: unexpected line {line:?}")]
    UnexpectedLine { format: &'static str, line: String },

    #[error("{format}: counter '{counter}' unavailable ({reason})")]
    CounterUnavailable {
        format: &'static str,
        counter: String,
        reason: String,
    },
}

/// Failure of a single benchmark run attempt
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to execute '{command}': {reason}")]
    Execution { command: String, reason: String },

    #[error("Run exceeded timeout of {0:?}")]
    TimeoutAborted(Duration),

    #[error("Malformed measurement output: {0}")]
    Parse(#[from] ParseError),

    #[error("Isolation setup failed: {0}")]
    Isolation(#[from] CpuSetError),

    #[error("Program exited with status {code}")]
    NonZeroExit { code: i32 },

    #[error("Program terminated by signal {0}")]
    Signaled(i32),

    #[error("Output validation failed: {0}")]
    ValidationFailed(String),

    #[error("Run cancelled")]
    Cancelled,
}

/// Serializable failure tag recorded in failure entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Not enough isolable cores
    ResourceExhausted,
    /// Spawn or exec failure
    ExecutionError,
    /// Exceeded the per-run timeout and was killed
    TimeoutAborted,
    /// Measurement output did not match its format
    ParseError,
    /// Process could not be bound to its core set
    IsolationSetupError,
    /// Program exited with an unexpected status
    NonZeroExit,
    /// Program was killed by a signal it did not expect
    Signaled,
    /// Output validator rejected the run
    ValidationFailed,
    /// Run was never completed because the session was cancelled
    Cancelled,
}

impl RunError {
    /// Failure tag for this error
    pub fn kind(&self) -> FailureKind {
        match self {
            RunError::Execution { .. } => FailureKind::ExecutionError,
            RunError::TimeoutAborted(_) => FailureKind::TimeoutAborted,
            RunError::Parse(_) => FailureKind::ParseError,
            RunError::Isolation(CpuSetError::ResourceExhausted { .. }) => {
                FailureKind::ResourceExhausted
            }
            RunError::Isolation(_) => FailureKind::IsolationSetupError,
            RunError::NonZeroExit { .. } => FailureKind::NonZeroExit,
            RunError::Signaled(_) => FailureKind::Signaled,
            RunError::ValidationFailed(_) => FailureKind::ValidationFailed,
            RunError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// Whether another attempt may succeed
    ///
    /// Timeouts, isolation setup and spawn failures are transient; a program
    /// that produced bad output or the wrong status will do so again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::TimeoutAborted
                | FailureKind::IsolationSetupError
                | FailureKind::ExecutionError
        )
    }
}
