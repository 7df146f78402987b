//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] and [`fred`] errors. At the orchestrator seams they convert into
//! [`StoreError`] and [`BusError`].

use cyberrange_core::{BusError, StoreError};

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A `PostgreSQL` migration failed.
    #[error("PostgreSQL migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A background `Dragonfly` command stopped before it replied.
    #[error("Dragonfly command aborted: {0}")]
    Aborted(String),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt value at {key}: {reason}")]
    Corrupt {
        /// Key, row or field that held the value.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DbError {
    /// Shorthand for [`DbError::Corrupt`].
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<DbError> for StoreError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::Corrupt { key, reason } => Self::Corrupt { key, reason },
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<DbError> for BusError {
    fn from(error: DbError) -> Self {
        match error {
            DbError::Config(reason) => Self::Connection(reason),
            other => Self::Command(other.to_string()),
        }
    }
}
