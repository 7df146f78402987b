//! Session orchestration and step synchronization for the Cyberrange game
//! orchestrator.
//!
//! One worker process runs per session. The orchestrator drives it one step
//! at a time over a message bus, relays its output to live viewers, archives
//! every step, and recovers its bookkeeping after a restart.
//!
//! # Modules
//!
//! - [`bus`] -- [`MessageBus`] seam and the in-process [`MemoryBus`].
//! - [`supervisor`] -- [`WorkerSupervisor`] seam and the OS-backed
//!   [`ProcessSupervisor`].
//! - [`registry`] -- Durable session records and lifecycle transitions.
//! - [`archive`] -- Write-once step archive seam.
//! - [`sync`] -- [`StepSynchronizer`]: trigger, wait, persist.
//! - [`relay`] -- [`OutputRelay`]: worker output to bus channels and back.
//! - [`reconcile`] -- Startup/shutdown reconciliation.
//! - [`sessions`] -- [`SessionManager`] facade over all of the above.
//! - [`worker`] -- Worker-side step loop and the in-process supervisor.
//! - [`config`] -- `cyberrange-config.yaml` loading.
//! - [`error`] -- Error taxonomy.
//!
//! [`MessageBus`]: bus::MessageBus
//! [`MemoryBus`]: bus::MemoryBus
//! [`WorkerSupervisor`]: supervisor::WorkerSupervisor
//! [`ProcessSupervisor`]: supervisor::ProcessSupervisor
//! [`StepSynchronizer`]: sync::StepSynchronizer
//! [`OutputRelay`]: relay::OutputRelay
//! [`SessionManager`]: sessions::SessionManager

pub mod archive;
pub mod bus;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod sessions;
pub mod supervisor;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{BusError, ConfigError, OrchestratorError, StoreError, SupervisorError, WorkerError};
pub use sessions::{Backends, EndReport, SessionManager, SessionSettings, SessionStatus};
pub use sync::StepOutcome;
