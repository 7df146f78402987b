//! Game API server for the Cyberrange orchestrator.
//!
//! A thin Axum shell over [`SessionManager`](cyberrange_core::SessionManager):
//!
//! - **REST endpoints** to start, step, inspect and end games, and to read
//!   or purge the step archive
//! - **`WebSocket` endpoint** (`/ws/{id}`) streaming a game's worker output
//!
//! Step timeouts and the end of a game are ordinary `200` responses with a
//! `status` field; only genuine failures map to error statuses.

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use error::ApiError;
pub use router::build_router;
pub use server::{ServerConfig, ServerError, start_server};
pub use state::AppState;
