//! Worker side of the step protocol.
//!
//! A worker subscribes to its session's trigger channel and, for every
//! trigger, runs exactly one simulation step and pushes the result onto the
//! session's result queue. It stops once the step budget is used up.
//!
//! A subscription that ends (the bus reconnected) is re-established after a
//! short delay. Triggers are not lost meanwhile: the orchestrator keeps
//! publishing until a subscriber receives one.
//!
//! [`WorkerLoop`] implements that protocol over any [`MessageBus`] and any
//! [`Simulation`]. The `cyberrange-worker` binary drives it out of process;
//! [`InProcessSupervisor`] runs it as a tokio task for local runs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cyberrange_types::{ChannelBinding, GameConfig, SessionId, StepResultRecord, WorkerHandle};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::bus::{MessageBus, MessageStream};
use crate::error::{SupervisorError, WorkerError};
use crate::supervisor::{OutputReader, SpawnedWorker, WorkerSupervisor};

/// Buffer between an in-process worker's transcript and the output relay.
const TRANSCRIPT_BUFFER: usize = 16 * 1024;

/// First pseudo-pid handed out by [`InProcessSupervisor`]; far above any
/// real pid so the two can't be confused in logs.
const FIRST_TASK_PID: u32 = 0x4000_0000;

/// Wait before re-subscribing to a lost trigger channel.
const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Consecutive failed re-subscriptions before the worker gives up.
const MAX_RESUBSCRIBE_ATTEMPTS: u32 = 120;

/// A simulation that can be advanced one step at a time.
#[async_trait]
pub trait Simulation: Send + 'static {
    /// Run step `step` (zero-based) and return its snapshot.
    async fn step(&mut self, step: u32) -> Result<serde_json::Value, WorkerError>;
}

/// Builds the simulation for a new in-process worker.
pub type SimulationFactory =
    Arc<dyn Fn(SessionId, &GameConfig) -> Box<dyn Simulation> + Send + Sync>;

/// The trigger/step/push loop of one worker.
pub struct WorkerLoop {
    bus: Arc<dyn MessageBus>,
    session_id: SessionId,
    budget: u32,
    simulation: Box<dyn Simulation>,
    transcript: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    resubscribe_delay: Duration,
}

impl WorkerLoop {
    /// Create a loop that runs at most `budget` steps.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        session_id: SessionId,
        budget: u32,
        simulation: Box<dyn Simulation>,
    ) -> Self {
        Self {
            bus,
            session_id,
            budget,
            simulation,
            transcript: None,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    /// Wait `delay` before each attempt to restore a lost trigger
    /// subscription.
    #[must_use]
    pub const fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    /// Also write a line of progress per step to `writer`.
    #[must_use]
    pub fn with_transcript(mut self, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        self.transcript = Some(writer);
        self
    }

    /// Serve triggers until the budget is used up. Returns the number of
    /// completed steps.
    pub async fn run(mut self) -> Result<u32, WorkerError> {
        let binding = ChannelBinding::for_session(self.session_id);
        let mut triggers = self.bus.subscribe(&binding.trigger).await?;
        tracing::info!(session_id = %self.session_id, budget = self.budget, "worker ready");
        self.note(&format!("session {} ready, {} steps", self.session_id, self.budget))
            .await;

        let mut completed = 0_u32;
        while completed < self.budget {
            if triggers.next().await.is_none() {
                triggers = Self::resubscribe(
                    &self.bus,
                    self.session_id,
                    self.resubscribe_delay,
                    &binding.trigger,
                    completed,
                )
                .await?;
                continue;
            }
            let snapshot = self.simulation.step(completed).await?;
            completed = completed.saturating_add(1);

            let record = StepResultRecord {
                state_snapshot: Some(snapshot),
                current_step: completed,
            };
            self.bus
                .push(&binding.results, &serde_json::to_string(&record)?)
                .await?;
            tracing::debug!(session_id = %self.session_id, step = completed, "step result pushed");
            self.note(&format!("step {completed}/{} done", self.budget)).await;
        }

        tracing::info!(session_id = %self.session_id, completed, "step budget reached, worker exiting");
        Ok(completed)
    }

    async fn resubscribe(
        bus: &Arc<dyn MessageBus>,
        session_id: SessionId,
        resubscribe_delay: Duration,
        channel: &str,
        completed: u32,
    ) -> Result<MessageStream, WorkerError> {
        tracing::warn!(session_id = %session_id, completed, "trigger subscription lost, resubscribing");
        for attempt in 1..=MAX_RESUBSCRIBE_ATTEMPTS {
            tokio::time::sleep(resubscribe_delay).await;
            match bus.subscribe(channel).await {
                Ok(triggers) => {
                    tracing::info!(session_id = %session_id, attempt, "trigger subscription restored");
                    return Ok(triggers);
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, attempt, error = %e, "resubscribe failed");
                }
            }
        }
        Err(WorkerError::TriggerLost { completed })
    }

    async fn note(&mut self, line: &str) {
        if let Some(writer) = self.transcript.as_mut() {
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                tracing::debug!(error = %e, "transcript closed");
                self.transcript = None;
            }
        }
    }
}

/// [`WorkerSupervisor`] running each worker as a tokio task in this process.
///
/// Handles carry pseudo-pids that only mean something to the supervisor
/// that issued them. Workers do not survive an orchestrator restart.
pub struct InProcessSupervisor {
    bus: Arc<dyn MessageBus>,
    factory: SimulationFactory,
    next_pid: AtomicU32,
    tasks: Mutex<HashMap<u32, JoinHandle<()>>>,
}

impl std::fmt::Debug for InProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessSupervisor")
            .field("next_pid", &self.next_pid)
            .finish_non_exhaustive()
    }
}

impl InProcessSupervisor {
    /// Create a supervisor whose workers talk over `bus` and run simulations
    /// built by `factory`.
    pub fn new(bus: Arc<dyn MessageBus>, factory: SimulationFactory) -> Self {
        Self {
            bus,
            factory,
            next_pid: AtomicU32::new(FIRST_TASK_PID),
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerSupervisor for InProcessSupervisor {
    async fn spawn(
        &self,
        session_id: SessionId,
        config: &GameConfig,
    ) -> Result<SpawnedWorker, SupervisorError> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (stdout_writer, stdout_reader) = tokio::io::duplex(TRANSCRIPT_BUFFER);
        let (mut stderr_writer, stderr_reader) = tokio::io::duplex(TRANSCRIPT_BUFFER);

        let worker = WorkerLoop::new(
            Arc::clone(&self.bus),
            session_id,
            config.steps,
            (self.factory)(session_id, config),
        )
        .with_transcript(Box::new(stdout_writer));

        let task = tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                tracing::warn!(session_id = %session_id, error = %e, "in-process worker failed");
                let line = format!("worker failed: {e}\n");
                if let Err(write_err) = stderr_writer.write_all(line.as_bytes()).await {
                    tracing::debug!(error = %write_err, "stderr transcript closed");
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, task);

        Ok(SpawnedWorker {
            handle: WorkerHandle {
                pid,
                pgid: pid,
                started_at: 0,
            },
            stdout: Some(Box::new(stdout_reader) as OutputReader),
            stderr: Some(Box::new(stderr_reader) as OutputReader),
        })
    }

    fn is_alive(&self, handle: &WorkerHandle) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.pid)
            .is_some_and(|task| !task.is_finished())
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.pid);
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(pid = handle.pid, error = %e, "in-process worker panicked");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;
    use crate::bus::MemoryBus;

    struct Echo;

    #[async_trait]
    impl Simulation for Echo {
        async fn step(&mut self, step: u32) -> Result<serde_json::Value, WorkerError> {
            Ok(json!({ "echo": step }))
        }
    }

    struct Broken;

    #[async_trait]
    impl Simulation for Broken {
        async fn step(&mut self, step: u32) -> Result<serde_json::Value, WorkerError> {
            Err(WorkerError::Simulation {
                step,
                message: "engine exploded".to_owned(),
            })
        }
    }

    async fn wait_subscribed(bus: &MemoryBus, channel: &str) {
        for _ in 0..500 {
            if bus.subscriber_count(channel) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn one_result_per_trigger_until_budget() {
        let bus = MemoryBus::new();
        let session = SessionId::new();
        let binding = ChannelBinding::for_session(session);
        let worker = tokio::spawn(WorkerLoop::new(Arc::new(bus.clone()), session, 2, Box::new(Echo)).run());
        wait_subscribed(&bus, &binding.trigger).await;

        for expected in 1..=2_u32 {
            bus.publish(&binding.trigger, "go").await.unwrap();
            let raw = bus.pop(&binding.results, Duration::from_secs(5)).await.unwrap().unwrap();
            let record: StepResultRecord = serde_json::from_str(&raw).unwrap();
            assert_eq!(record.current_step, expected);
            assert_eq!(record.state_snapshot, Some(json!({ "echo": expected.saturating_sub(1) })));
        }

        assert_eq!(worker.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn worker_resubscribes_after_bus_disconnect() {
        let bus = MemoryBus::new();
        let session = SessionId::new();
        let binding = ChannelBinding::for_session(session);
        let worker = tokio::spawn(
            WorkerLoop::new(Arc::new(bus.clone()), session, 2, Box::new(Echo))
                .with_resubscribe_delay(Duration::from_millis(5))
                .run(),
        );
        wait_subscribed(&bus, &binding.trigger).await;
        bus.publish(&binding.trigger, "go").await.unwrap();
        assert!(bus.pop(&binding.results, Duration::from_secs(5)).await.unwrap().is_some());

        bus.disconnect_subscribers();
        assert_eq!(bus.subscriber_count(&binding.trigger), 0);
        wait_subscribed(&bus, &binding.trigger).await;

        assert_eq!(bus.publish(&binding.trigger, "go").await.unwrap(), 1);
        let raw = bus.pop(&binding.results, Duration::from_secs(5)).await.unwrap().unwrap();
        let record: StepResultRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.current_step, 2);
        assert_eq!(worker.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn in_process_worker_reports_failure_on_stderr() {
        let bus = MemoryBus::new();
        let shared: Arc<dyn MessageBus> = Arc::new(bus.clone());
        let supervisor = InProcessSupervisor::new(
            shared,
            Arc::new(|_: SessionId, _: &GameConfig| -> Box<dyn Simulation> { Box::new(Broken) }),
        );
        let session = SessionId::new();
        let spawned = supervisor.spawn(session, &GameConfig::default()).await.unwrap();
        assert!(supervisor.is_alive(&spawned.handle));

        let binding = ChannelBinding::for_session(session);
        wait_subscribed(&bus, &binding.trigger).await;
        bus.publish(&binding.trigger, "go").await.unwrap();

        let mut stderr = BufReader::new(spawned.stderr.unwrap()).lines();
        let line = stderr.next_line().await.unwrap().unwrap();
        assert!(line.contains("engine exploded"));

        supervisor.terminate(&spawned.handle).await.unwrap();
        assert!(!supervisor.is_alive(&spawned.handle));
    }
}
