use thiserror::Error;

/// Failure of a whole bounded batch.
///
/// Per-input failures are not represented here: a mapping function that can fail
/// returns its own `Result` as the output type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
    #[error("task {index} panicked ({panicked} panicked in total): {message}")]
    TaskPanicked {
        index: usize,
        panicked: usize,
        message: String,
    },
    #[error("task join failed: {0}")]
    Join(String),
}

pub type RunResult<T> = Result<T, RunError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("drain timeout must be greater than zero")]
    ZeroTimeout,
}

impl From<tokio::task::JoinError> for RunError {
    fn from(e: tokio::task::JoinError) -> Self {
        RunError::Join(e.to_string())
    }
}
