//! Error types for the orchestrator binary.

/// Top-level error for the orchestrator binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: cyberrange_core::ConfigError,
    },

    /// Connecting to or migrating a data store failed.
    #[error("database error: {source}")]
    Database {
        /// The underlying data layer error.
        #[from]
        source: cyberrange_db::DbError,
    },

    /// Startup reconciliation failed.
    #[error("reconciliation error: {source}")]
    Reconciliation {
        /// The underlying orchestrator error.
        #[from]
        source: cyberrange_core::OrchestratorError,
    },

    /// The HTTP API failed to start or stopped with an error.
    #[error("api error: {source}")]
    Api {
        /// The underlying server error.
        #[from]
        source: cyberrange_api::ServerError,
    },
}
