//! HTTP server lifecycle.
//!
//! [`start_server`] binds the listener and serves the router until the
//! given shutdown future resolves, then lets in-flight requests finish.
//! Open `WebSocket` streams end when their game's output stops or the
//! client goes away.

use std::future::Future;
use std::net::{AddrParseError, SocketAddr};

use cyberrange_core::config::InfrastructureConfig;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::AppState;

/// Address the API listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host or IP literal to bind (e.g. `0.0.0.0`).
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerConfig {
    /// Listen address from the `infrastructure` config section.
    pub fn from_infrastructure(infra: &InfrastructureConfig) -> Self {
        Self {
            host: infra.host.clone(),
            port: infra.port,
        }
    }

    /// The address to bind.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidAddress`] if `host` is not an IP
    /// literal.
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|source| ServerError::InvalidAddress { addr: raw, source })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_infrastructure(&InfrastructureConfig::default())
    }
}

/// Serve the game API until `shutdown` resolves.
pub async fn start_server<F>(config: &ServerConfig, state: AppState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "Game API listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)?;

    info!("Game API stopped");
    Ok(())
}

/// Errors that can occur when starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured host and port do not form a socket address.
    #[error("invalid listen address {addr}: {source}")]
    InvalidAddress {
        /// The rejected `host:port` string.
        addr: String,
        /// Parse failure.
        source: AddrParseError,
    },

    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The server hit a fatal I/O error while serving.
    #[error("server stopped with an error: {0}")]
    Serve(#[source] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_listens_on_every_interface() {
        let addr = ServerConfig::default().socket_addr().unwrap();
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 8000);
    }

    #[test]
    fn hostnames_are_rejected() {
        let config = ServerConfig {
            host: "api.local".to_owned(),
            port: 8000,
        };
        assert!(matches!(
            config.socket_addr(),
            Err(ServerError::InvalidAddress { ref addr, .. }) if addr == "api.local:8000"
        ));
    }
}
