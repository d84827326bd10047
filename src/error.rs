use thiserror::Error;

/// Error type for the retry worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// A payload or configuration document could not be (de)serialized.
    #[error("Failed to (de)serialize JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A binding declaration is missing a required field.
    #[error("Invalid topology declaration: {message}")]
    InvalidTopology { message: String },

    /// Settings could not be loaded or are inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading the settings file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker did not confirm a publish.
    #[error("Publish to exchange '{exchange}' was not acknowledged by the broker")]
    PublishNotConfirmed { exchange: String },

    /// A consumer task ended abnormally.
    #[error("Consumer '{consumer}' stopped: {reason}")]
    ConsumerStopped { consumer: String, reason: String },
}

impl WorkerError {
    pub(crate) fn invalid_topology(message: impl Into<String>) -> Self {
        WorkerError::InvalidTopology {
            message: message.into(),
        }
    }

    /// Whether the error means the worker cannot start with its current settings.
    ///
    /// Such errors are not fixed by reconnecting, so the process should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::InvalidTopology { .. } | WorkerError::Config(_) | WorkerError::Io(_)
        )
    }
}

impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::Config(s.to_string())
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::Config(s)
    }
}
