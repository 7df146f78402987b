//! Session manager: the single entry point for session operations.
//!
//! Owns the component graph (registry, archive, supervisor, relay,
//! synchronizer, live tracking) and exposes one method per client
//! operation. There is no ambient state: everything a session operation
//! touches is reachable from the manager it is called on.

use std::sync::Arc;
use std::time::Duration;

use cyberrange_types::{
    ChannelBinding, GameConfig, GameSummary, SessionId, SessionRecord, SessionState, StepSnapshot,
};
use serde::Serialize;

use crate::archive::StepArchive;
use crate::bus::MessageBus;
use crate::config::{StepConfig, WorkerConfig};
use crate::error::OrchestratorError;
use crate::reconcile::{LiveSessions, ReconciliationManager};
use crate::registry::{SessionRegistry, SessionStore};
use crate::relay::{OutputLines, OutputRelay};
use crate::supervisor::WorkerSupervisor;
use crate::sync::{StepOutcome, StepSynchronizer};

/// The external services a [`SessionManager`] runs on.
#[derive(Clone)]
pub struct Backends {
    /// Message bus shared with workers.
    pub bus: Arc<dyn MessageBus>,
    /// Durable session registry storage.
    pub sessions: Arc<dyn SessionStore>,
    /// Durable step archive.
    pub archive: Arc<dyn StepArchive>,
    /// Worker process supervisor.
    pub supervisor: Arc<dyn WorkerSupervisor>,
}

/// Tunables of a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Timeout used by [`SessionManager::step`].
    pub step_timeout: Duration,
    /// Largest step budget a session may request.
    pub max_steps: u32,
    /// Longest wait between worker liveness probes during a step.
    pub probe_interval: Duration,
    /// Bound on stopping one worker at shutdown.
    pub shutdown_grace: Duration,
}

impl SessionSettings {
    /// Settings from the `steps` and `worker` config sections.
    pub const fn from_config(steps: &StepConfig, worker: &WorkerConfig) -> Self {
        Self {
            step_timeout: steps.timeout(),
            max_steps: steps.max_steps,
            probe_interval: steps.probe_interval(),
            shutdown_grace: worker.shutdown_bound(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&StepConfig::default(), &WorkerConfig::default())
    }
}

/// Where a session's status came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SessionStatus {
    /// The session has a registry record.
    Live {
        /// The registry record.
        record: SessionRecord,
        /// Whether its worker is running.
        worker_alive: bool,
    },
    /// Only the archive knows the session.
    Archived {
        /// Archive summary.
        summary: GameSummary,
    },
}

/// Result of ending a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EndReport {
    /// The ended session.
    pub session_id: SessionId,
    /// Steps it completed.
    pub steps_completed: u32,
    /// Its state before it was ended.
    pub final_state: SessionState,
}

/// Runs sessions: start, step, end, and the queries around them.
pub struct SessionManager {
    bus: Arc<dyn MessageBus>,
    registry: SessionRegistry,
    archive: Arc<dyn StepArchive>,
    supervisor: Arc<dyn WorkerSupervisor>,
    relay: Arc<OutputRelay>,
    live: Arc<LiveSessions>,
    sync: StepSynchronizer,
    settings: SessionSettings,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("settings", &self.settings)
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Wire a manager over `backends`.
    pub fn new(backends: Backends, settings: SessionSettings) -> Self {
        let relay = Arc::new(OutputRelay::new(Arc::clone(&backends.bus)));
        Self::with_relay(backends, settings, relay)
    }

    /// Wire a manager with a preconfigured relay.
    pub fn with_relay(backends: Backends, settings: SessionSettings, relay: Arc<OutputRelay>) -> Self {
        let registry = SessionRegistry::new(backends.sessions);
        let sync = StepSynchronizer::new(
            Arc::clone(&backends.bus),
            registry.clone(),
            Arc::clone(&backends.archive),
            Arc::clone(&backends.supervisor),
            settings.probe_interval,
        );
        Self {
            bus: backends.bus,
            registry,
            archive: backends.archive,
            supervisor: backends.supervisor,
            relay,
            live: Arc::new(LiveSessions::new()),
            sync,
            settings,
        }
    }

    /// Configured settings.
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// The session registry.
    pub const fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Sessions this manager is tracking.
    pub fn live_sessions(&self) -> &LiveSessions {
        &self.live
    }

    /// A reconciliation manager sharing this manager's tracking.
    pub fn reconciliation(&self) -> ReconciliationManager {
        ReconciliationManager::new(
            self.registry.clone(),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.relay),
            Arc::clone(&self.live),
            self.settings.shutdown_grace,
        )
    }

    /// Start a session: archive its configuration, spawn its worker,
    /// register it and relay its output.
    pub async fn start(&self, config: GameConfig) -> Result<SessionId, OrchestratorError> {
        if config.steps == 0 || config.steps > self.settings.max_steps {
            return Err(OrchestratorError::InvalidConfig(format!(
                "steps must be between 1 and {}, got {}",
                self.settings.max_steps, config.steps
            )));
        }

        let session_id = SessionId::new();
        self.archive.record_game(session_id, &config).await?;

        let spawned = match self.supervisor.spawn(session_id, &config).await {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "worker spawn failed");
                if let Err(purge_err) = self.archive.purge_game(session_id).await {
                    tracing::warn!(session_id = %session_id, error = %purge_err, "could not drop archived config");
                }
                return Err(OrchestratorError::Spawn(e));
            }
        };
        let worker = spawned.handle;

        let record = SessionRecord::new(session_id, config, worker);
        if let Err(e) = self.registry.create(&record).await {
            tracing::error!(session_id = %session_id, error = %e, "registry write failed, stopping new worker");
            if let Err(stop_err) = self.supervisor.terminate(&worker).await {
                tracing::warn!(session_id = %session_id, error = %stop_err, "could not stop unregistered worker");
            }
            return Err(e);
        }

        self.relay.attach(session_id, spawned.stdout, spawned.stderr);
        self.live.insert(session_id, worker);
        self.registry.transition(session_id, SessionState::Running).await?;

        tracing::info!(
            session_id = %session_id,
            pid = worker.pid,
            steps = config.steps,
            red = %config.red_agent,
            blue = %config.blue_agent,
            wrapper = %config.wrapper,
            "session started"
        );
        Ok(session_id)
    }

    /// Advance a session by one step with the configured timeout.
    pub async fn step(&self, session_id: SessionId) -> Result<StepOutcome, OrchestratorError> {
        self.step_with_timeout(session_id, self.settings.step_timeout).await
    }

    /// Advance a session by one step, waiting at most `timeout`.
    pub async fn step_with_timeout(
        &self,
        session_id: SessionId,
        timeout: Duration,
    ) -> Result<StepOutcome, OrchestratorError> {
        self.sync.request_step(session_id, timeout).await
    }

    /// End a session: stop its worker and purge its registry entry. The
    /// archived history stays.
    ///
    /// A step being committed finishes first and is counted; a step still
    /// waiting for its result is discarded.
    pub async fn end(&self, session_id: SessionId) -> Result<EndReport, OrchestratorError> {
        let marked = {
            let _commit = self.sync.commit_lock(session_id).await;
            self.mark_terminated(session_id).await
        };
        let record = marked.inspect_err(|_| self.sync.forget(session_id))?;

        self.relay.detach(session_id);
        self.supervisor
            .terminate(&record.worker)
            .await
            .map_err(OrchestratorError::Supervisor)?;
        self.live.remove(session_id);

        let binding = ChannelBinding::for_session(session_id);
        if let Err(e) = self.bus.clear(&binding.results).await {
            tracing::warn!(session_id = %session_id, error = %e, "could not clear result queue");
        }
        self.registry.delete(session_id).await?;
        self.sync.forget(session_id);

        tracing::info!(session_id = %session_id, steps = record.step_counter, "session ended");
        Ok(EndReport {
            session_id,
            steps_completed: record.step_counter,
            final_state: record.state,
        })
    }

    async fn mark_terminated(&self, session_id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        let record = self.registry.require(session_id).await?;
        if !record.state.is_terminal() {
            self.registry.transition(session_id, SessionState::Terminated).await?;
        }
        Ok(record)
    }

    /// Status from the registry, falling back to the archive.
    pub async fn status(&self, session_id: SessionId) -> Result<SessionStatus, OrchestratorError> {
        if let Some(record) = self.registry.get(session_id).await? {
            let worker_alive = self.supervisor.is_alive(&record.worker);
            return Ok(SessionStatus::Live {
                record,
                worker_alive,
            });
        }
        self.archive
            .list_games()
            .await?
            .into_iter()
            .find(|game| game.game_id == session_id)
            .map(|summary| SessionStatus::Archived { summary })
            .ok_or_else(|| OrchestratorError::not_found(session_id, "no such game"))
    }

    /// Every archived game.
    pub async fn list_games(&self) -> Result<Vec<GameSummary>, OrchestratorError> {
        Ok(self.archive.list_games().await?)
    }

    /// One persisted step.
    pub async fn get_step(&self, session_id: SessionId, step: u32) -> Result<StepSnapshot, OrchestratorError> {
        self.archive
            .get_step(session_id, step)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(session_id, "no such step"))
    }

    /// Delete a finished game's archived history. Refused while the session
    /// still has a registry entry.
    pub async fn purge_history(&self, session_id: SessionId) -> Result<u64, OrchestratorError> {
        if self.registry.get(session_id).await?.is_some() {
            return Err(OrchestratorError::Conflict(session_id));
        }
        match self.archive.purge_game(session_id).await? {
            0 => Err(OrchestratorError::not_found(session_id, "no such game")),
            removed => {
                tracing::info!(session_id = %session_id, removed, "game history purged");
                Ok(removed)
            }
        }
    }

    /// Live output of a session.
    pub async fn subscribe_output(&self, session_id: SessionId) -> Result<OutputLines, OrchestratorError> {
        self.registry.require(session_id).await?;
        Ok(self.relay.subscribe(session_id).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::Ordering;

    use async_trait::async_trait;
    use cyberrange_types::RedAgentKind;
    use futures::StreamExt;
    use tokio::sync::Notify;

    use super::*;
    use crate::archive::{InsertOutcome, MemoryStepArchive};
    use crate::error::StoreError;
    use crate::bus::MemoryBus;
    use crate::registry::MemorySessionStore;
    use crate::testing::{StubSupervisor, spawn_responder};

    struct Fixture {
        bus: MemoryBus,
        archive: MemoryStepArchive,
        supervisor: Arc<StubSupervisor>,
        manager: SessionManager,
    }

    /// Archive whose step writes take a while and announce themselves.
    #[derive(Clone)]
    struct SlowArchive {
        inner: MemoryStepArchive,
        writing: Arc<Notify>,
    }

    #[async_trait]
    impl StepArchive for SlowArchive {
        async fn record_game(&self, session_id: SessionId, config: &GameConfig) -> Result<(), StoreError> {
            self.inner.record_game(session_id, config).await
        }

        async fn game_config(&self, session_id: SessionId) -> Result<Option<GameConfig>, StoreError> {
            self.inner.game_config(session_id).await
        }

        async fn insert_step(&self, snapshot: &StepSnapshot) -> Result<InsertOutcome, StoreError> {
            self.writing.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.inner.insert_step(snapshot).await
        }

        async fn get_step(&self, session_id: SessionId, step: u32) -> Result<Option<StepSnapshot>, StoreError> {
            self.inner.get_step(session_id, step).await
        }

        async fn list_games(&self) -> Result<Vec<GameSummary>, StoreError> {
            self.inner.list_games().await
        }

        async fn purge_game(&self, session_id: SessionId) -> Result<u64, StoreError> {
            self.inner.purge_game(session_id).await
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            step_timeout: Duration::from_secs(5),
            max_steps: 50,
            probe_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    fn fixture() -> Fixture {
        let bus = MemoryBus::new();
        let archive = MemoryStepArchive::new();
        let supervisor = Arc::new(StubSupervisor::new());
        let manager = SessionManager::new(
            Backends {
                bus: Arc::new(bus.clone()),
                sessions: Arc::new(MemorySessionStore::new()),
                archive: Arc::new(archive.clone()),
                supervisor: supervisor.clone(),
            },
            settings(),
        );
        Fixture {
            bus,
            archive,
            supervisor,
            manager,
        }
    }

    fn config(steps: u32) -> GameConfig {
        GameConfig {
            steps,
            red_agent: RedAgentKind::Meander,
            ..GameConfig::default()
        }
    }

    #[tokio::test]
    async fn full_session_lifecycle() {
        let f = fixture();
        let id = f.manager.start(config(3)).await.unwrap();
        let responder = spawn_responder(&f.bus, id, Duration::ZERO).await;
        assert!(f.manager.live_sessions().contains(id));

        for expected in 0..3 {
            let outcome = f.manager.step(id).await.unwrap();
            assert!(matches!(outcome, StepOutcome::Advanced(ref s) if s.step == expected));
        }
        assert_eq!(
            f.manager.step(id).await.unwrap(),
            StepOutcome::EndOfSession { steps_completed: 3 }
        );
        assert_eq!(f.manager.get_step(id, 2).await.unwrap().step, 2);

        let report = f.manager.end(id).await.unwrap();
        assert_eq!(report.steps_completed, 3);
        assert_eq!(report.final_state, SessionState::Completed);
        assert!(!f.manager.live_sessions().contains(id));
        assert!(f.manager.registry().get(id).await.unwrap().is_none());

        let listed = f.manager.list_games().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.first().unwrap().completed);
        assert_eq!(listed.first().unwrap().config.red_agent, RedAgentKind::Meander);
        responder.abort();
    }

    #[tokio::test]
    async fn start_rejects_out_of_range_budgets() {
        let f = fixture();
        for steps in [0, 51] {
            let result = f.manager.start(config(steps)).await;
            assert!(matches!(result, Err(OrchestratorError::InvalidConfig(_))));
        }
        assert!(f.manager.list_games().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_creates_no_session() {
        let f = fixture();
        f.supervisor.fail_spawn.store(true, Ordering::Relaxed);
        let result = f.manager.start(config(3)).await;
        assert!(matches!(result, Err(OrchestratorError::Spawn(_))));
        assert!(f.manager.live_sessions().is_empty());
        assert!(f.manager.registry().all().await.unwrap().is_empty());
        assert!(f.manager.list_games().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn end_is_idempotent_for_a_dead_worker_but_not_for_a_missing_session() {
        let f = fixture();
        let id = f.manager.start(config(3)).await.unwrap();
        assert!(matches!(
            f.manager.status(id).await.unwrap(),
            SessionStatus::Live { worker_alive: true, .. }
        ));
        let record = f.manager.registry().require(id).await.unwrap();
        f.supervisor.kill(record.worker.pid);

        let report = f.manager.end(id).await.unwrap();
        assert_eq!(report.final_state, SessionState::Running);
        assert!(matches!(
            f.manager.end(id).await,
            Err(OrchestratorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn status_falls_back_to_the_archive() {
        let f = fixture();
        let id = f.manager.start(config(2)).await.unwrap();
        f.manager.end(id).await.unwrap();

        assert!(matches!(
            f.manager.status(id).await.unwrap(),
            SessionStatus::Archived { summary }
                if summary.game_id == id && summary.step.is_none() && !summary.completed
        ));
        assert!(matches!(
            f.manager.status(SessionId::new()).await,
            Err(OrchestratorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn purge_is_refused_while_live() {
        let f = fixture();
        let id = f.manager.start(config(2)).await.unwrap();
        assert!(matches!(
            f.manager.purge_history(id).await,
            Err(OrchestratorError::Conflict(_))
        ));

        f.manager.end(id).await.unwrap();
        assert_eq!(f.manager.purge_history(id).await.unwrap(), 1);
        assert!(f.archive.game_config(id).await.unwrap().is_none());
        assert!(matches!(
            f.manager.purge_history(id).await,
            Err(OrchestratorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn output_subscription_requires_a_live_session() {
        let f = fixture();
        assert!(matches!(
            f.manager.subscribe_output(SessionId::new()).await,
            Err(OrchestratorError::NotFound { .. })
        ));

        let id = f.manager.start(config(2)).await.unwrap();
        let mut lines = f.manager.subscribe_output(id).await.unwrap();
        let binding = ChannelBinding::for_session(id);
        f.bus.publish(&binding.stderr, "late line").await.unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.to_string(), "STDERR: late line");
    }

    #[tokio::test]
    async fn shutdown_stops_started_sessions() {
        let f = fixture();
        let id = f.manager.start(config(2)).await.unwrap();
        let pid = f.manager.registry().require(id).await.unwrap().worker.pid;

        let report = f.manager.reconciliation().shutdown().await;
        assert_eq!(report.stopped, vec![id]);
        assert!(f.manager.live_sessions().is_empty());
        let terminated = f.supervisor.terminated.lock().unwrap().clone();
        assert_eq!(terminated, vec![pid]);
        assert_eq!(
            f.manager.registry().require(id).await.unwrap().state,
            SessionState::Terminated
        );
    }

    #[tokio::test]
    async fn end_waits_for_a_step_being_committed() {
        let bus = MemoryBus::new();
        let archive = SlowArchive {
            inner: MemoryStepArchive::new(),
            writing: Arc::new(Notify::new()),
        };
        let manager = Arc::new(SessionManager::new(
            Backends {
                bus: Arc::new(bus.clone()),
                sessions: Arc::new(MemorySessionStore::new()),
                archive: Arc::new(archive.clone()),
                supervisor: Arc::new(StubSupervisor::new()),
            },
            settings(),
        ));
        let id = manager.start(config(3)).await.unwrap();
        let responder = spawn_responder(&bus, id, Duration::ZERO).await;

        let stepping = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.step(id).await })
        };
        archive.writing.notified().await;
        let report = manager.end(id).await.unwrap();
        let outcome = stepping.await.unwrap().unwrap();

        assert!(matches!(outcome, StepOutcome::Advanced(ref s) if s.step == 0));
        assert_eq!(report.steps_completed, 1);
        assert_eq!(archive.inner.step_indices(id), vec![0]);
        assert!(manager.registry().get(id).await.unwrap().is_none());
        responder.abort();
    }

    #[tokio::test]
    async fn step_result_arriving_after_end_is_discarded() {
        let f = fixture();
        let id = f.manager.start(config(3)).await.unwrap();
        let _responder = spawn_responder(&f.bus, id, Duration::from_millis(300)).await;

        let (stepped, ended) = tokio::join!(f.manager.step(id), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.manager.end(id).await
        });
        assert!(matches!(stepped, Err(OrchestratorError::NotFound { .. })));
        assert_eq!(ended.unwrap().steps_completed, 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(f.archive.step_indices(id).is_empty());
    }
}
