//! Orchestrator binary for the Cyberrange game server.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `cyberrange-config.yaml` and the environment
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `Dragonfly` (bus + registry) and `PostgreSQL` (archive)
//! 4. Run archive migrations
//! 5. Reconcile the registry with the workers that are still running
//! 6. Serve the game API until `SIGINT`/`SIGTERM`
//! 7. Stop every tracked worker within the shutdown grace period

mod error;

use std::sync::Arc;

use cyberrange_api::{AppState, ServerConfig};
use cyberrange_core::config::{LogFormat, LoggingConfig, OrchestratorConfig};
use cyberrange_core::sessions::{Backends, SessionManager, SessionSettings};
use cyberrange_core::supervisor::ProcessSupervisor;
use cyberrange_db::{DragonflyPool, PostgresPool};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::LaunchError;

/// Application entry point for the orchestrator.
///
/// # Errors
///
/// Returns an error if any initialization step fails or the API server
/// stops with an error.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1-2. Configuration, then logging shaped by it.
    let config = OrchestratorConfig::load().map_err(LaunchError::from)?;
    init_tracing(&config.logging);
    info!(
        host = config.infrastructure.host,
        port = config.infrastructure.port,
        worker = config.worker.program,
        step_timeout_secs = config.steps.timeout_secs,
        max_steps = config.steps.max_steps,
        "cyberrange-server starting"
    );

    run(config).await?;
    info!("cyberrange-server shutdown complete");
    Ok(())
}

async fn run(config: OrchestratorConfig) -> Result<(), LaunchError> {
    // 3-4. Data stores.
    let dragonfly = DragonflyPool::connect(&config.infrastructure.dragonfly_url).await?;
    let postgres = PostgresPool::connect_url(&config.infrastructure.postgres_url).await?;
    postgres.run_migrations().await?;

    let supervisor = ProcessSupervisor::new(config.worker.clone(), config.infrastructure.dragonfly_url.clone());
    let backends = Backends {
        bus: Arc::new(dragonfly.clone()),
        sessions: Arc::new(dragonfly.clone()),
        archive: Arc::new(postgres.game_store()),
        supervisor: Arc::new(supervisor),
    };
    let manager = Arc::new(SessionManager::new(
        backends,
        SessionSettings::from_config(&config.steps, &config.worker),
    ));

    // 5. Pick up sessions that outlived the previous orchestrator.
    let reconciliation = manager.reconciliation();
    let report = reconciliation.startup().await?;
    info!(
        reattached = report.reattached.len(),
        terminated = report.terminated.len(),
        "Registry reconciled"
    );

    // 6. Serve until a shutdown signal arrives.
    let served = cyberrange_api::start_server(
        &ServerConfig::from_infrastructure(&config.infrastructure),
        AppState::new(Arc::clone(&manager)),
        shutdown_signal(),
    )
    .await;

    // 7. Stop workers even if the server failed.
    let stopped = reconciliation.shutdown().await;
    if !stopped.abandoned.is_empty() {
        tracing::warn!(abandoned = ?stopped.abandoned, "Some workers did not stop");
    }
    info!(stopped = stopped.stopped.len(), "Workers stopped");

    postgres.close().await;
    dragonfly.close().await;
    served?;
    Ok(())
}

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Resolve on `Ctrl-C`, or on `SIGTERM` on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("Shutdown signal received");
}
