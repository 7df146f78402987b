//! `WebSocket` handler for live worker output.
//!
//! Clients connect to `GET /ws/{id}` and receive one text frame per line
//! the session's worker prints, prefixed `STDOUT: ` or `STDERR: `. Lines
//! printed before the connection are not replayed.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use cyberrange_core::relay::OutputLines;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::handlers::parse_game_id;
use crate::state::AppState;

/// Upgrade an HTTP request to a `WebSocket` connection and stream the
/// game's output. Unknown games are rejected before the upgrade.
///
/// # Route
///
/// `GET /ws/{id}`
pub async fn ws_output(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let game_id = parse_game_id(&id)?;
    let lines = state.manager.subscribe_output(game_id).await?;
    debug!(game_id = %game_id, "output viewer connecting");
    Ok(ws.on_upgrade(move |socket| forward_output(socket, lines)))
}

/// Forward output lines as text frames until either side goes away.
async fn forward_output(mut socket: WebSocket, mut lines: OutputLines) {
    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else {
                    debug!("output stream ended, closing WebSocket");
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                };
                if socket.send(Message::Text(line.to_string().into())).await.is_err() {
                    debug!("WebSocket client disconnected (send failed)");
                    return;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        return;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {e}");
                        return;
                    }
                    // Viewers are read-only.
                    _ => {}
                }
            }
        }
    }
}
