//! Axum router construction for the game API.
//!
//! Assembles all routes (REST + `WebSocket`) into a single [`Router`]
//! with CORS and request tracing.

use axum::Router;
use axum::routing::{delete, get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the complete Axum router.
///
/// CORS allows any origin so a browser front end served elsewhere can call
/// the API.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/games", get(handlers::list_games))
        .route("/games/start", post(handlers::start_game))
        .route(
            "/games/{id}",
            get(handlers::game_status)
                .post(handlers::step_game)
                .delete(handlers::end_game),
        )
        .route("/games/{id}/history", delete(handlers::purge_history))
        .route("/games/{id}/step/{step}", get(handlers::get_step))
        .route("/ws/{id}", get(ws::ws_output))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
