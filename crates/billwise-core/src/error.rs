//! Error types for BillWise

use serde::Serialize;
use thiserror::Error;

/// A single field-level problem with an uploaded record or file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed record at row {row}: {}", join_fields(.errors))]
    MalformedRecord { row: usize, errors: Vec<FieldError> },

    #[error("Ambiguous merchant '{description}': candidates {}", .candidates.join(", "))]
    AmbiguousMerchant {
        description: String,
        candidates: Vec<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Subscription {0} is already cancelled")]
    AlreadyCancelled(i64),

    #[error("Account '{0}' is being modified by another request; retry")]
    ConcurrentMutationConflict(String),

    #[error("Validation failed: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Whether the caller may simply retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentMutationConflict(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_record_message_lists_fields() {
        let err = Error::MalformedRecord {
            row: 4,
            errors: vec![
                FieldError::new("date", "unrecognized date '31/31/2024'"),
                FieldError::new("amount", "not a number: 'abc'"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Malformed record at row 4: date: unrecognized date '31/31/2024'; amount: not a number: 'abc'"
        );
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(Error::ConcurrentMutationConflict("alice".into()).is_retryable());
        assert!(!Error::AlreadyCancelled(3).is_retryable());
        assert!(!Error::NotFound("subscription 9".into()).is_retryable());
    }
}
