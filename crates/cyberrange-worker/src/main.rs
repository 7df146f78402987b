//! Worker binary for the Cyberrange game server.
//!
//! The orchestrator spawns one worker per game. The worker subscribes to its
//! game's trigger channel, runs one simulation step per trigger, pushes the
//! step result onto the game's result queue and exits once the step budget
//! is used up.
//!
//! ```text
//! orchestrator --trigger--> worker --step--> simulation
//!      ^                      |
//!      +------results---------+        stdout: one transcript line per step
//! ```
//!
//! Logs go to stderr; stdout carries the step transcript that the
//! orchestrator relays to `WebSocket` subscribers.

mod scenario;

use std::sync::Arc;

use clap::Parser;
use cyberrange_core::worker::WorkerLoop;
use cyberrange_db::DragonflyPool;
use cyberrange_types::{BlueAgentKind, GameConfig, RedAgentKind, SessionId, WrapperKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::scenario::ScriptedSimulation;

/// Runs the steps of one game on trigger.
#[derive(Parser, Debug)]
#[command(name = "cyberrange-worker", version, about, long_about = None)]
struct Args {
    /// Game this worker serves.
    #[arg(long)]
    session_id: SessionId,

    /// Step budget; the worker exits after this many steps.
    #[arg(long, default_value_t = 10)]
    num_steps: u32,

    /// Observation wrapper (`simple` or `wrap`).
    #[arg(long, default_value = "simple")]
    wrapper_type: WrapperKind,

    /// Attacker policy.
    #[arg(long, default_value = "B_lineAgent")]
    red_agent_type: RedAgentKind,

    /// Defender policy.
    #[arg(long, default_value = "BlueReactRemoveAgent")]
    blue_agent_type: BlueAgentKind,

    /// `Dragonfly` connection URL.
    #[arg(long, env = "DRAGONFLY_URL", default_value = "redis://localhost:6379")]
    bus_url: String,

    /// RNG seed; derived from the session id when omitted.
    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    const fn config(&self) -> GameConfig {
        GameConfig {
            red_agent: self.red_agent_type,
            blue_agent: self.blue_agent_type,
            wrapper: self.wrapper_type,
            steps: self.num_steps,
        }
    }

    fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| {
            let (high, low) = self.session_id.0.as_u64_pair();
            high ^ low
        })
    }
}

/// Worker entry point.
///
/// # Errors
///
/// Returns an error if the bus is unreachable or the step loop fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let config = args.config();
    let seed = args.seed();
    info!(
        session_id = %args.session_id,
        red_agent = config.red_agent.as_str(),
        blue_agent = config.blue_agent.as_str(),
        wrapper = config.wrapper.as_str(),
        steps = config.steps,
        seed,
        "cyberrange-worker starting"
    );

    let bus = DragonflyPool::connect(&args.bus_url).await?;
    let simulation = Box::new(ScriptedSimulation::new(config, seed));
    let worker = WorkerLoop::new(Arc::new(bus.clone()), args.session_id, config.steps, simulation)
        .with_transcript(Box::new(tokio::io::stdout()));

    let outcome = tokio::select! {
        result = worker.run() => Some(result),
        () = stop_signal() => None,
    };
    bus.close().await;

    match outcome {
        Some(result) => {
            let completed = result?;
            info!(session_id = %args.session_id, completed, "Step budget used up, exiting");
        }
        None => warn!(session_id = %args.session_id, "Stop signal received, exiting"),
    }
    Ok(())
}

/// Resolves on `SIGINT` or, on Unix, `SIGTERM`.
async fn stop_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
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
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_arguments_parse() {
        let id = SessionId::new();
        let args = Args::try_parse_from([
            "cyberrange-worker",
            "--session-id",
            &id.to_string(),
            "--num-steps",
            "25",
            "--wrapper-type",
            "wrap",
            "--red-agent-type",
            "RedMeanderAgent",
            "--blue-agent-type",
            "CardiffUni",
            "--bus-url",
            "redis://bus:6379",
        ])
        .unwrap();

        assert_eq!(args.session_id, id);
        assert_eq!(args.bus_url, "redis://bus:6379");
        let config = args.config();
        assert_eq!(config.steps, 25);
        assert_eq!(config.wrapper, WrapperKind::Challenge);
        assert_eq!(config.red_agent, RedAgentKind::Meander);
        assert_eq!(config.blue_agent, BlueAgentKind::CardiffUni);
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let id = SessionId::new().to_string();
        let parsed = Args::try_parse_from([
            "cyberrange-worker",
            "--session-id",
            id.as_str(),
            "--red-agent-type",
            "SneakyAgent",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn seed_defaults_to_the_session_id() {
        let id = SessionId::new().to_string();
        let parse = |extra: &[&str]| {
            let mut argv = vec!["cyberrange-worker", "--session-id", id.as_str()];
            argv.extend_from_slice(extra);
            Args::try_parse_from(argv).unwrap().seed()
        };
        assert_eq!(parse(&[]), parse(&[]));
        assert_eq!(parse(&["--seed", "42"]), 42);
    }
}
