use isobench_core::CpuSetError;
use thiserror::Error;

/// Errors that abort a whole session
///
/// Per-run failures never surface here; they are recorded in the results.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Insufficient isolable cores for session: {0}")]
    ResourceExhausted(CpuSetError),

    #[error("CPU isolation unavailable: {0}")]
    Isolation(CpuSetError),

    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid property filter: {0}")]
    PropertyFilter(#[from] regex::Error),

    #[error("Failed to build slot pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl From<CpuSetError> for SessionError {
    fn from(e: CpuSetError) -> Self {
        match e {
            CpuSetError::ResourceExhausted { .. } => SessionError::ResourceExhausted(e),
            other => SessionError::Isolation(other),
        }
    }
}
