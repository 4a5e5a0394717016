//! Error types for the raise-on-failure half of the driver contract.
//!
//! Only `put`, `url`, `signed_url`, `copy`, `move_to` and driver
//! construction ever surface a [`StorageError`].  The presence-check
//! operations (`get`, `meta`, `exists`, `missing`, `delete`) collapse
//! failures into their sentinel values instead.

use thiserror::Error;

/// Longest signed URL lifetime accepted by any driver (7 days).
pub const MAX_EXPIRY_MINUTES: u64 = 7 * 24 * 60;

/// Driver errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The disk configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No disk with the requested name is registered.
    #[error("no disk named '{0}' is configured")]
    UnknownDisk(String),

    /// The requested signed URL lifetime is out of range.
    #[error("signed URL expiry must be between 1 and {MAX_EXPIRY_MINUTES} minutes, got {minutes}")]
    InvalidExpiry { minutes: u64 },

    /// The backend rejected or failed an operation.
    #[error("{operation} failed for '{path}': {source}")]
    Backend {
        operation: &'static str,
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StorageError {
    /// Wrap a backend failure for `operation` on physical `path`.
    pub fn backend(
        operation: &'static str,
        path: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        StorageError::Backend {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Short machine-readable code, used as the metrics status label.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::InvalidConfig(_) => "InvalidConfig",
            StorageError::UnknownDisk(_) => "UnknownDisk",
            StorageError::InvalidExpiry { .. } => "InvalidExpiry",
            StorageError::Backend { .. } => "BackendError",
        }
    }
}

/// Convenience alias used across the driver.
pub type StorageResult<T> = Result<T, StorageError>;
