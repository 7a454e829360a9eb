//! Error types and result aliases for Strata.
//!
//! This module defines the shared error types used across all Strata components.
//! Errors are structured for programmatic handling and include context for debugging.

/// The result type used throughout Strata.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Strata operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A storage operation failed (object storage or relational store).
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A bucket object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an invalid-input error for an empty required argument.
    #[must_use]
    pub fn empty_argument(name: &str) -> Self {
        Self::InvalidInput(format!("{name} cannot be empty"))
    }
}

/// Rejects empty identifiers at API boundaries.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `value` is empty or whitespace.
pub fn require_non_empty(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::empty_argument(name));
    }
    Ok(())
}
