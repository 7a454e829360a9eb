//! Error types for the relational layer.

/// The result type used throughout strata-store.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in relational store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A database statement or connection failed.
    #[error("database error: {message}")]
    Database {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The referenced table does not exist.
    #[error("table not found: {table}")]
    TableNotFound {
        /// Name of the missing table.
        table: String,
    },

    /// A table definition is inconsistent.
    #[error("invalid table definition: {message}")]
    InvalidDefinition {
        /// What is wrong with the definition.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An error from strata-core.
    #[error("core error: {0}")]
    Core(#[from] strata_core::Error),
}

impl Error {
    /// Creates a new database error.
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new database error with a source.
    #[must_use]
    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an error for a missing table.
    #[must_use]
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound {
            table: table.into(),
        }
    }
}

/// Rejects empty identifiers at API boundaries.
pub(crate) fn require_non_empty(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{name} cannot be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn database_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection reset");
        let err = Error::database_with_source("insert FILE_STATE", source);
        assert!(err.to_string().contains("database error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn core_errors_convert() {
        let err: Error = strata_core::Error::InvalidInput("bad".into()).into();
        assert!(matches!(err, Error::Core(_)));
    }

    #[test]
    fn empty_identifier_rejected() {
        let err = require_non_empty("key", "").unwrap_err();
        assert!(err.to_string().contains("key cannot be empty"));
    }
}
