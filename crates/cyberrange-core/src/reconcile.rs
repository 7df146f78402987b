//! Reconciliation between the durable registry and in-memory tracking.
//!
//! On startup the registry is the source of truth for which workers should
//! exist. Every non-terminal entry is probed: live workers are tracked
//! again, dead ones are marked `Terminated` and kept for audit. Output
//! relays are not re-attached; whatever a worker printed while the
//! orchestrator was down is gone.
//!
//! On shutdown every tracked worker is stopped within a bounded grace
//! period. Workers that do not stop in time are abandoned with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cyberrange_types::{SessionId, SessionState, WorkerHandle};
use futures::future::join_all;

use crate::error::OrchestratorError;
use crate::registry::SessionRegistry;
use crate::relay::OutputRelay;
use crate::supervisor::WorkerSupervisor;

/// Sessions with a worker this orchestrator is responsible for.
#[derive(Debug, Default)]
pub struct LiveSessions {
    workers: Mutex<HashMap<SessionId, WorkerHandle>>,
}

impl LiveSessions {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a session's worker.
    pub fn insert(&self, session_id: SessionId, worker: WorkerHandle) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, worker);
    }

    /// Stop tracking a session.
    pub fn remove(&self, session_id: SessionId) -> Option<WorkerHandle> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
    }

    /// Whether a session is tracked.
    pub fn contains(&self, session_id: SessionId) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&session_id)
    }

    /// Copy of every tracked session and its worker.
    pub fn snapshot(&self) -> Vec<(SessionId, WorkerHandle)> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(&id, &worker)| (id, worker))
            .collect()
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What startup reconciliation found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    /// Sessions whose worker is alive and tracked again.
    pub reattached: Vec<SessionId>,
    /// Sessions whose worker was gone, now marked `Terminated`.
    pub terminated: Vec<SessionId>,
    /// Sessions already in a terminal state, left untouched.
    pub finished: Vec<SessionId>,
}

/// What shutdown did with each tracked worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that stopped.
    pub stopped: Vec<SessionId>,
    /// Workers that did not stop within the grace period.
    pub abandoned: Vec<SessionId>,
}

/// Rebuilds and tears down in-memory session tracking.
pub struct ReconciliationManager {
    registry: SessionRegistry,
    supervisor: Arc<dyn WorkerSupervisor>,
    relay: Arc<OutputRelay>,
    live: Arc<LiveSessions>,
    shutdown_grace: Duration,
}

impl std::fmt::Debug for ReconciliationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationManager")
            .field("live", &self.live)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl ReconciliationManager {
    /// Create a manager. `shutdown_grace` bounds how long shutdown waits for
    /// any one worker.
    pub fn new(
        registry: SessionRegistry,
        supervisor: Arc<dyn WorkerSupervisor>,
        relay: Arc<OutputRelay>,
        live: Arc<LiveSessions>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            registry,
            supervisor,
            relay,
            live,
            shutdown_grace,
        }
    }

    /// Scan the registry and rebuild tracking.
    pub async fn startup(&self) -> Result<StartupReport, OrchestratorError> {
        let mut report = StartupReport::default();
        for record in self.registry.all().await? {
            let session_id = record.session_id;
            if record.state.is_terminal() {
                report.finished.push(session_id);
                continue;
            }
            if self.supervisor.is_alive(&record.worker) {
                self.live.insert(session_id, record.worker);
                tracing::info!(session_id = %session_id, pid = record.worker.pid, "re-attached live worker");
                report.reattached.push(session_id);
            } else {
                self.registry.transition(session_id, SessionState::Terminated).await?;
                tracing::warn!(session_id = %session_id, pid = record.worker.pid, "worker gone, session marked terminated");
                report.terminated.push(session_id);
            }
        }
        tracing::info!(
            reattached = report.reattached.len(),
            terminated = report.terminated.len(),
            finished = report.finished.len(),
            "startup reconciliation complete"
        );
        Ok(report)
    }

    /// Stop every tracked worker, concurrently and best-effort.
    pub async fn shutdown(&self) -> ShutdownReport {
        let tracked = self.live.snapshot();
        tracing::info!(workers = tracked.len(), "stopping tracked workers");

        let results = join_all(tracked.into_iter().map(|(session_id, worker)| async move {
            let stopped =
                match tokio::time::timeout(self.shutdown_grace, self.supervisor.terminate(&worker)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::warn!(session_id = %session_id, pid = worker.pid, error = %e, "worker did not stop, abandoning");
                        false
                    }
                    Err(_elapsed) => {
                        tracing::warn!(session_id = %session_id, pid = worker.pid, "worker stop timed out, abandoning");
                        false
                    }
                };
            if stopped {
                self.relay.detach(session_id);
                self.live.remove(session_id);
                if let Err(e) = self.registry.transition(session_id, SessionState::Terminated).await {
                    tracing::warn!(session_id = %session_id, error = %e, "could not mark session terminated");
                }
            }
            (session_id, stopped)
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (session_id, stopped) in results {
            if stopped {
                report.stopped.push(session_id);
            } else {
                report.abandoned.push(session_id);
            }
        }
        report
    }
}
