//! Test doubles shared by the unit tests of this crate.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cyberrange_types::{
    ChannelBinding, GameConfig, SessionId, SessionRecord, SessionState, StepResultRecord,
    WorkerHandle,
};
use futures::StreamExt;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::archive::{MemoryStepArchive, StepArchive};
use crate::bus::{MemoryBus, MessageBus};
use crate::error::SupervisorError;
use crate::registry::{MemorySessionStore, SessionRegistry};
use crate::supervisor::{OutputReader, SpawnedWorker, WorkerSupervisor};
use crate::sync::StepSynchronizer;

/// Supervisor whose "processes" are entries in a set. Spawned workers emit a
/// fixed transcript on stdout and stderr.
#[derive(Debug, Default)]
pub(crate) struct StubSupervisor {
    next_pid: AtomicU32,
    alive: Mutex<HashSet<u32>>,
    pub(crate) terminated: Mutex<Vec<u32>>,
    pub(crate) fail_spawn: std::sync::atomic::AtomicBool,
}

impl StubSupervisor {
    pub(crate) fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(100),
            ..Self::default()
        }
    }

    /// Register a live worker that was not spawned through this supervisor.
    pub(crate) fn adopt(&self) -> WorkerHandle {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.alive.lock().unwrap_or_else(PoisonError::into_inner).insert(pid);
        WorkerHandle {
            pid,
            pgid: pid,
            started_at: 1,
        }
    }

    /// Simulate a crash.
    pub(crate) fn kill(&self, pid: u32) {
        self.alive.lock().unwrap_or_else(PoisonError::into_inner).remove(&pid);
    }
}

#[async_trait]
impl WorkerSupervisor for StubSupervisor {
    async fn spawn(
        &self,
        _session_id: SessionId,
        _config: &GameConfig,
    ) -> Result<SpawnedWorker, SupervisorError> {
        if self.fail_spawn.load(Ordering::Relaxed) {
            return Err(SupervisorError::Launch {
                program: "stub".to_owned(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
            });
        }
        let handle = self.adopt();
        Ok(SpawnedWorker {
            handle,
            stdout: Some(Box::new(Cursor::new(b"booting\nready\n".to_vec())) as OutputReader),
            stderr: Some(Box::new(Cursor::new(b"warning: demo\n".to_vec())) as OutputReader),
        })
    }

    fn is_alive(&self, handle: &WorkerHandle) -> bool {
        self.alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&handle.pid)
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        self.kill(handle.pid);
        self.terminated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle.pid);
        Ok(())
    }
}

/// In-memory seams wired together.
pub(crate) struct Harness {
    pub(crate) bus: MemoryBus,
    pub(crate) registry: SessionRegistry,
    pub(crate) archive: MemoryStepArchive,
    pub(crate) supervisor: Arc<StubSupervisor>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self {
            bus: MemoryBus::new(),
            registry: SessionRegistry::new(Arc::new(MemorySessionStore::new())),
            archive: MemoryStepArchive::new(),
            supervisor: Arc::new(StubSupervisor::new()),
        }
    }

    pub(crate) fn synchronizer(&self) -> StepSynchronizer {
        StepSynchronizer::new(
            Arc::new(self.bus.clone()),
            self.registry.clone(),
            Arc::new(self.archive.clone()),
            self.supervisor.clone(),
            Duration::from_millis(50),
        )
    }

    /// A registered, running session with a live stub worker and an
    /// archived configuration.
    pub(crate) async fn running_session(&self, steps: u32) -> SessionRecord {
        let config = GameConfig {
            steps,
            ..GameConfig::default()
        };
        let mut record = SessionRecord::new(SessionId::new(), config, self.supervisor.adopt());
        self.registry.create(&record).await.ok();
        self.archive.record_game(record.session_id, &config).await.ok();
        self.registry
            .transition(record.session_id, SessionState::Running)
            .await
            .ok();
        record.state = SessionState::Running;
        record
    }

    pub(crate) async fn push_result(&self, binding: &ChannelBinding, result: &StepResultRecord) {
        let raw = serde_json::to_string(result).unwrap_or_default();
        self.bus.push(&binding.results, &raw).await.ok();
    }
}

/// Answer every trigger for `session_id` with the next step result after
/// `delay`. Subscribed by the time this returns.
pub(crate) async fn spawn_responder(
    bus: &MemoryBus,
    session_id: SessionId,
    delay: Duration,
) -> JoinHandle<()> {
    let binding = ChannelBinding::for_session(session_id);
    let mut triggers = bus.subscribe(&binding.trigger).await.unwrap_or_else(|_| {
        Box::pin(futures::stream::empty())
    });
    let bus = bus.clone();
    tokio::spawn(async move {
        let mut completed = 0_u32;
        while triggers.next().await.is_some() {
            tokio::time::sleep(delay).await;
            completed = completed.saturating_add(1);
            let record = StepResultRecord {
                state_snapshot: Some(json!({ "actions": { "Red": "Sleep", "Blue": "Monitor" }, "n": completed })),
                current_step: completed,
            };
            let raw = serde_json::to_string(&record).unwrap_or_default();
            if bus.push(&binding.results, &raw).await.is_err() {
                return;
            }
        }
    })
}
