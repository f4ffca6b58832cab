//! Error type of the sync engine and read service.
//!
//! Callers must be able to tell "fetch failed" from "store unreachable" from
//! "no such thing"; each maps to its own variant.

use thiserror::Error;

/// Read-path and engine error.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The requested entity does not exist upstream or in the cache.
    #[error("{0}")]
    NotFound(String),

    /// The request is invalid (e.g. a height before the epoch start).
    #[error("{0}")]
    InvalidRequest(String),

    /// The upstream chain API failed.
    #[error("Upstream request failed: {0:#}")]
    Upstream(anyhow::Error),

    /// The cache store failed.
    #[error("Storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl ServiceError {
    /// Classify an error whose origin is mixed (a fetch followed by a store).
    ///
    /// Anything caused by the database driver is a storage failure; the rest
    /// is attributed to upstream.
    pub fn classify(error: anyhow::Error) -> Self {
        if error.chain().any(|cause| cause.is::<sqlx::Error>()) {
            Self::Storage(error)
        } else {
            Self::Upstream(error)
        }
    }
}

/// Result type alias for ServiceError.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Classify `anyhow` results by where they came from.
pub trait ResultExt<T> {
    /// Tag the error as an upstream failure.
    fn upstream(self) -> ServiceResult<T>;

    /// Tag the error as a storage failure.
    fn storage(self) -> ServiceResult<T>;
}

impl<T> ResultExt<T> for anyhow::Result<T> {
    fn upstream(self) -> ServiceResult<T> {
        self.map_err(ServiceError::Upstream)
    }

    fn storage(self) -> ServiceResult<T> {
        self.map_err(ServiceError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_by_cause() {
        let db: anyhow::Result<()> = Err(sqlx::Error::PoolTimedOut).context("Failed to save");
        assert!(matches!(
            ServiceError::classify(db.unwrap_err()),
            ServiceError::Storage(_)
        ));

        let net = anyhow::anyhow!("All upstream URLs failed for /v1/epochs/latest");
        assert!(matches!(ServiceError::classify(net), ServiceError::Upstream(_)));
    }
}
