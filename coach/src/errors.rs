use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoachError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("{service} returned status {status}: {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },
    #[error("{service} returned an unusable response: {detail}")]
    MalformedResponse {
        service: &'static str,
        detail: String,
    },
    #[error("network request failed: {0}")]
    Network(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("code execution failed: {0}")]
    Execution(String),
    #[error("process produced {stream} output exceeding limit of {limit} bytes")]
    OutputTooLarge { stream: &'static str, limit: usize },
    #[error("process terminated by signal")]
    TerminatedBySignal,
    #[error("job '{0}' not found")]
    JobNotFound(String),
    #[error("job '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("job store error: {0}")]
    Store(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CoachError {
    /// True for failures caused by an external service rather than by the caller.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            CoachError::Upstream { .. }
                | CoachError::MalformedResponse { .. }
                | CoachError::Network(_)
                | CoachError::Timeout(_)
                | CoachError::Execution(_)
        )
    }

    pub(crate) fn network(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoachError::Network(format!("request timed out: {err}"))
        } else {
            CoachError::Network(err.to_string())
        }
    }
}

impl From<redis::RedisError> for CoachError {
    fn from(err: redis::RedisError) -> Self {
        CoachError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoachError>;
