//! Error taxonomy shared by the ingestion, query and cleanup services.

use crate::db::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing input. Surfaced verbatim, never retried.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
impl Error {
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_field() {
        let err = Error::validation("limit", "must be at most 10000");
        assert_eq!(err.to_string(), "invalid limit: must be at most 10000");
        assert!(err.is_validation());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_store_error_converts() {
        let err: Error = StoreError::Closed.into();
        assert!(matches!(err, Error::Storage(StoreError::Closed)));
    }
}
