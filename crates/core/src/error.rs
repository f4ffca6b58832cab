//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Epoch length must be positive for epoch arithmetic.
    #[error("Invalid epoch length: {0} (must be > 0)")]
    InvalidEpochLength(u64),

    /// An upstream record is missing a required field or carries an unparsable one.
    #[error("Malformed record: field '{field}' {reason}")]
    MalformedRecord {
        /// Offending field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// Invalid bech32 address.
    #[error("Invalid bech32 address: {0}")]
    InvalidAddress(String),

    /// Invalid base64 public key.
    #[error("Invalid public key encoding")]
    InvalidPublicKey,
}

impl CoreError {
    /// Shorthand for a missing required field.
    pub fn missing(field: &'static str) -> Self {
        CoreError::MalformedRecord {
            field,
            reason: "is missing".to_string(),
        }
    }

    /// Shorthand for a field that is present but unusable.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        CoreError::MalformedRecord {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
