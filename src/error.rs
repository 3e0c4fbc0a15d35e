//! Error types for potat-eval.

use thiserror::Error;

/// Main error type for potat-eval.
#[derive(Error, Debug)]
pub enum PotatError {
    #[error("The queue is full")]
    QueueFull,

    #[error("Worker execution timed out")]
    WorkerTimeout,

    #[error("Worker is not responding")]
    WorkerUnresponsive,

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Command timed out")]
    CommandTimeout,

    #[error("No client connected")]
    NoSocketClient,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for potat-eval operations.
pub type Result<T> = std::result::Result<T, PotatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_visible_messages() {
        // These strings are part of the observable protocol.
        assert_eq!(PotatError::QueueFull.to_string(), "The queue is full");
        assert_eq!(
            PotatError::WorkerTimeout.to_string(),
            "Worker execution timed out"
        );
        assert_eq!(
            PotatError::WorkerUnresponsive.to_string(),
            "Worker is not responding"
        );
        assert_eq!(PotatError::CommandTimeout.to_string(), "Command timed out");
    }
}
