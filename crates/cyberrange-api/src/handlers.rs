//! REST endpoint handlers for the game API.
//!
//! Every handler is a thin translation between HTTP and the
//! [`SessionManager`](cyberrange_core::SessionManager).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness |
//! | `GET` | `/games` | List archived games |
//! | `POST` | `/games/start` | Start a game |
//! | `GET` | `/games/{id}` | Game status |
//! | `POST` | `/games/{id}` | Run the next step |
//! | `DELETE` | `/games/{id}` | End a game |
//! | `DELETE` | `/games/{id}/history` | Purge archived history |
//! | `GET` | `/games/{id}/step/{step}` | One persisted step |

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use cyberrange_core::{EndReport, OrchestratorError, SessionStatus, StepOutcome};
use cyberrange_types::{GameConfig, GameSummary, SessionId, StepSnapshot};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Parse a game id from a path segment.
pub(crate) fn parse_game_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse::<SessionId>()
        .map_err(|e| ApiError::InvalidId(format!("{raw}: {e}")))
}

/// Parse a start request body. Unknown agent or wrapper kinds are rejected
/// here, before any worker is spawned.
pub(crate) fn parse_config(body: &[u8]) -> Result<GameConfig, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(GameConfig::default());
    }
    Ok(serde_json::from_slice(body)?)
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

/// Body of `POST /games/start`.
#[derive(Debug, Serialize)]
pub struct StartResponse {
    /// Id of the new game.
    pub game_id: SessionId,
}

/// Body of `POST /games/{id}`. Only `advanced` carries a new step.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResponse {
    /// One step ran and was persisted.
    Advanced {
        /// The persisted snapshot.
        #[serde(flatten)]
        snapshot: StepSnapshot,
    },
    /// The step budget is used up.
    EndOfGame {
        /// Steps the game completed.
        steps_completed: u32,
    },
    /// No result arrived in time. Retrying collects the pending step.
    Timeout {
        /// How long the request waited, in milliseconds.
        waited_ms: u64,
    },
}

/// Body of `DELETE /games/{id}/history`.
#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    /// Rows removed from the archive.
    pub removed: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "live_sessions": state.manager.live_sessions().len(),
    }))
}

/// `GET /games`
pub async fn list_games(State(state): State<AppState>) -> Result<Json<Vec<GameSummary>>, ApiError> {
    Ok(Json(state.manager.list_games().await?))
}

/// `POST /games/start`. An empty body starts a game with the default
/// configuration; omitted fields take their defaults.
pub async fn start_game(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let config = parse_config(&body)?;
    let game_id = state.manager.start(config).await?;
    Ok((StatusCode::CREATED, Json(StartResponse { game_id })))
}

/// `GET /games/{id}`
pub async fn game_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    let game_id = parse_game_id(&id)?;
    Ok(Json(state.manager.status(game_id).await?))
}

/// `POST /games/{id}`
pub async fn step_game(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StepResponse>, ApiError> {
    let game_id = parse_game_id(&id)?;
    let response = match state.manager.step(game_id).await {
        Ok(StepOutcome::Advanced(snapshot)) => StepResponse::Advanced { snapshot },
        Ok(StepOutcome::EndOfSession { steps_completed }) => StepResponse::EndOfGame { steps_completed },
        Err(OrchestratorError::Timeout { waited, .. }) => StepResponse::Timeout {
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        },
        Err(e) => return Err(e.into()),
    };
    Ok(Json(response))
}

/// `DELETE /games/{id}`
pub async fn end_game(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EndReport>, ApiError> {
    let game_id = parse_game_id(&id)?;
    Ok(Json(state.manager.end(game_id).await?))
}

/// `DELETE /games/{id}/history`
pub async fn purge_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let game_id = parse_game_id(&id)?;
    let removed = state.manager.purge_history(game_id).await?;
    Ok(Json(PurgeResponse { removed }))
}

/// `GET /games/{id}/step/{step}`
pub async fn get_step(
    State(state): State<AppState>,
    Path((id, step)): Path<(String, u32)>,
) -> Result<Json<StepSnapshot>, ApiError> {
    let game_id = parse_game_id(&id)?;
    Ok(Json(state.manager.get_step(game_id, step).await?))
}
