//! Error types for the ingestion domain.

/// The result type used throughout strata-ingest.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while ingesting artifacts or running background jobs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A queue message body could not be decoded.
    #[error("malformed message: {message}")]
    MalformedMessage {
        /// Description of the decoding failure.
        message: String,
    },

    /// A local file operation failed.
    #[error("io error: {message}")]
    Io {
        /// Description of the operation that failed.
        message: String,
        /// The underlying cause.
        #[source]
        source: std::io::Error,
    },

    /// A queue operation failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An error from the relational layer.
    #[error("store error: {0}")]
    Store(#[from] strata_store::Error),

    /// An error from strata-core (object storage, semaphore).
    #[error("core error: {0}")]
    Core(#[from] strata_core::Error),
}

impl Error {
    /// Creates a malformed-message error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Creates an io error with context.
    #[must_use]
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Creates a queue error.
    #[must_use]
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same message cannot succeed: the body is
    /// bad or the artifact is gone.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage { .. }
                | Self::InvalidInput(_)
                | Self::Core(
                    strata_core::Error::NotFound(_) | strata_core::Error::InvalidInput(_)
                )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn malformed_message_display() {
        assert_eq!(
            Error::malformed("expected value").to_string(),
            "malformed message: expected value"
        );
    }

    #[test]
    fn io_error_keeps_source() {
        let err = Error::io(
            "failed to write artifact",
            std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full"),
        );
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn core_errors_convert() {
        let err: Error = strata_core::Error::NotFound("b/k".into()).into();
        assert!(matches!(err, Error::Core(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn infrastructure_errors_are_transient() {
        assert!(!Error::queue("timed out").is_permanent());
        assert!(!Error::Store(strata_store::Error::database("lost connection")).is_permanent());
        assert!(!Error::Core(strata_core::Error::storage("503")).is_permanent());
        assert!(Error::malformed("not json").is_permanent());
    }
}
