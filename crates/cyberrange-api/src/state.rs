//! Shared application state for the game API.

use std::sync::Arc;

use cyberrange_core::SessionManager;

/// Shared state for the Axum application, injected via the `State`
/// extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The session manager every handler delegates to.
    pub manager: Arc<SessionManager>,
}

impl AppState {
    /// Wrap a session manager.
    pub const fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}
