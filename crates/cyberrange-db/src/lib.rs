//! Data layer for the Cyberrange orchestrator (`Dragonfly` + `PostgreSQL`).
//!
//! `Dragonfly` carries the live traffic between the orchestrator and its
//! workers and holds the session registry. `PostgreSQL` archives game
//! configurations and every persisted step.
//!
//! # Architecture
//!
//! ```text
//! SessionManager
//!     |
//!     +-- MessageBus ---------> Dragonfly (DragonflyPool)
//!     |     triggers, result queues, output channels
//!     |
//!     +-- SessionStore -------> Dragonfly (DragonflyPool)
//!     |     session:{id} hashes + sessions:index
//!     |
//!     +-- StepArchive --------> PostgreSQL (GameStore)
//!           game_configurations + game_states
//! ```
//!
//! # Modules
//!
//! - [`dragonfly`] -- `Dragonfly` connection and message bus
//! - [`session_store`] -- Registry records as `Dragonfly` hashes
//! - [`postgres`] -- `PostgreSQL` connection pool and migrations
//! - [`game_store`] -- Write-once step archive
//! - [`error`] -- Shared error types

pub mod dragonfly;
pub mod error;
pub mod game_store;
pub mod postgres;
pub mod session_store;

// Re-export primary types for convenience.
pub use dragonfly::DragonflyPool;
pub use error::DbError;
pub use game_store::GameStore;
pub use postgres::PostgresPool;
