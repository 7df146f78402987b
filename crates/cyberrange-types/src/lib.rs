//! Shared type definitions for the Cyberrange game orchestrator.
//!
//! This crate is the single source of truth for the records that cross a
//! boundary: between the orchestrator and the worker (over the bus), between
//! the orchestrator and its stores, and between the API and its clients.
//! Client-facing types export `TypeScript` bindings via `ts-rs`.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrapper for session identifiers
//! - [`enums`] -- Agent/wrapper selectors, lifecycle state, output streams
//! - [`structs`] -- Configuration, registry record, step results, tagged lines
//! - [`channels`] -- Bus channel and key names derived from a session id

pub mod channels;
pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use channels::{ChannelBinding, REGISTRY_INDEX_KEY, session_from_registry_key};
pub use enums::{BlueAgentKind, OutputStream, RedAgentKind, SessionState, UnknownKind, WrapperKind};
pub use ids::SessionId;
pub use structs::{
    DEFAULT_STEP_BUDGET, GameConfig, GameSummary, SessionRecord, SessionUpdate, StepPayload,
    StepResultRecord, StepSnapshot, TaggedLine, WorkerHandle,
};
