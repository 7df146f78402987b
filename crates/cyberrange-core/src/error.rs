//! Error types for session orchestration.
//!
//! Component seams (bus, stores, supervisor) have their own small error
//! enums. [`OrchestratorError`] is the taxonomy callers of the session
//! manager see; every variant is a distinct outcome they must handle.

use std::time::Duration;

use cyberrange_types::{SessionId, SessionState};

/// Failure talking to the message bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The connection to the broker could not be established or was lost.
    #[error("bus connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed a command.
    #[error("bus command failed: {0}")]
    Command(String),
}

/// Failure in a durable store (session registry or step archive).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored record could not be decoded.
    #[error("corrupt record `{key}`: {reason}")]
    Corrupt {
        /// Key or row identifier of the record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A record that must be unique already exists.
    #[error("record already exists: {0}")]
    AlreadyExists(String),
}

/// Failure spawning, probing or stopping a worker process.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The worker executable could not be launched.
    #[error("failed to launch worker `{program}`: {source}")]
    Launch {
        /// Program that was executed.
        program: String,
        /// The underlying OS error.
        source: std::io::Error,
    },

    /// The OS did not report a pid for the launched worker.
    #[error("worker `{program}` exited before reporting a pid")]
    MissingPid {
        /// Program that was executed.
        program: String,
    },

    /// The worker survived both the graceful and the forceful stop.
    #[error("worker {pid} still running after forced kill")]
    StillRunning {
        /// Pid of the surviving worker.
        pid: u32,
    },
}

/// Failure inside the worker-side step loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The simulation failed to advance.
    #[error("simulation failed at step {step}: {message}")]
    Simulation {
        /// Step that was being run.
        step: u32,
        /// Simulator's description of the failure.
        message: String,
    },

    /// The trigger subscription ended and could not be restored.
    #[error("trigger subscription lost after {completed} steps")]
    TriggerLost {
        /// Steps completed before the subscription ended.
        completed: u32,
    },

    /// A step result could not be encoded.
    #[error("failed to encode step result: {0}")]
    Encode(#[from] serde_json::Error),

    /// The bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override held an unusable value.
    #[error("invalid value for {name}: {reason}")]
    Env {
        /// Variable name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Caller-facing outcome of a failed orchestration operation.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The worker could not be started; the session was not created.
    #[error("spawn error: {0}")]
    Spawn(#[source] SupervisorError),

    /// The session is unknown, or its worker is no longer alive.
    #[error("session {session_id} not found: {reason}")]
    NotFound {
        /// The requested session.
        session_id: SessionId,
        /// Why the session is unavailable.
        reason: &'static str,
    },

    /// Another operation on the same session is in flight.
    #[error("session {0} already has a step in flight")]
    Conflict(SessionId),

    /// No step result arrived within the caller's bound.
    ///
    /// Only the wait was abandoned; the worker may still finish the step.
    #[error("session {session_id}: no step result within {waited:?}")]
    Timeout {
        /// The session waited on.
        session_id: SessionId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The step happened in the worker but could not be stored durably.
    #[error("session {session_id}: step {step} ran but was not persisted: {source}")]
    Persistence {
        /// Owning session.
        session_id: SessionId,
        /// Index of the step that was lost.
        step: u32,
        /// The store failure.
        #[source]
        source: StoreError,
    },

    /// The worker sent something that breaks the step protocol.
    #[error("session {session_id}: protocol violation: {message}")]
    Protocol {
        /// Session whose worker misbehaved.
        session_id: SessionId,
        /// Description of the violation.
        message: String,
    },

    /// Stopping the worker failed.
    #[error("supervisor error: {0}")]
    Supervisor(#[source] SupervisorError),

    /// A requested lifecycle transition would move backwards.
    #[error("session {session_id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// The session.
        session_id: SessionId,
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// The session configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The message bus failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// A durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Shorthand for [`OrchestratorError::NotFound`].
    pub const fn not_found(session_id: SessionId, reason: &'static str) -> Self {
        Self::NotFound { session_id, reason }
    }
}
