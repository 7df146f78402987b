//! Step synchronization: one "advance" trigger in, one result out.
//!
//! The worker is driven by fire-and-forget triggers and answers on a result
//! queue. [`StepSynchronizer::request_step`] turns that pair into a single
//! call with a timeout:
//!
//! 1. claim the session's single-flight slot (a second caller gets
//!    [`OrchestratorError::Conflict`])
//! 2. publish the trigger, unless an earlier call timed out and its result
//!    is still outstanding (`pending_trigger` in the registry)
//! 3. pop the result queue in slices no longer than the probe interval,
//!    probing the worker's liveness between slices
//! 4. under the session's commit lock, persist the snapshot, then advance
//!    the registry's step counter
//!
//! Ending a session takes the same commit lock before it marks the session
//! terminated, so a result is either committed before the end or discarded
//! after it.
//!
//! A timeout abandons only the caller's wait. The worker still finishes the
//! step and pushes its result; the next request collects that result
//! instead of triggering a new step, so results stay in step order. If that
//! collecting request also waits a full timeout without a result, the
//! trigger is considered lost and the request after it triggers again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use cyberrange_types::{
    ChannelBinding, SessionId, SessionRecord, SessionState, SessionUpdate, StepResultRecord,
    StepSnapshot,
};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::archive::{InsertOutcome, StepArchive};
use crate::bus::MessageBus;
use crate::error::OrchestratorError;
use crate::registry::SessionRegistry;
use crate::supervisor::WorkerSupervisor;

/// Payload of a step trigger. Workers ignore the content.
pub const TRIGGER_PAYLOAD: &str = "advance";

/// Delay between trigger publishes while the worker has not subscribed yet.
const PUBLISH_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Successful outcome of a step request.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The worker ran one step; its snapshot is persisted.
    Advanced(StepSnapshot),
    /// The step budget is used up; no step was run.
    EndOfSession {
        /// Steps the session completed.
        steps_completed: u32,
    },
}

/// What the result queue yielded.
enum Collected {
    Step { index: u32, data: serde_json::Value },
    Exhausted,
}

/// Drives single steps of worker sessions.
pub struct StepSynchronizer {
    bus: Arc<dyn MessageBus>,
    registry: SessionRegistry,
    archive: Arc<dyn StepArchive>,
    supervisor: Arc<dyn WorkerSupervisor>,
    probe_interval: Duration,
    in_flight: Mutex<HashSet<SessionId>>,
    commits: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for StepSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepSynchronizer")
            .field("probe_interval", &self.probe_interval)
            .finish_non_exhaustive()
    }
}

/// Holds a session's single-flight slot; releases it on drop, including
/// when the request future is cancelled.
struct FlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<SessionId>>,
    session_id: SessionId,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

impl StepSynchronizer {
    /// Create a synchronizer. `probe_interval` bounds how long a worker crash
    /// can go unnoticed during a wait.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: SessionRegistry,
        archive: Arc<dyn StepArchive>,
        supervisor: Arc<dyn WorkerSupervisor>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            bus,
            registry,
            archive,
            supervisor,
            probe_interval: probe_interval.max(Duration::from_millis(1)),
            in_flight: Mutex::new(HashSet::new()),
            commits: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a step request for `session_id` is currently running.
    pub fn is_in_flight(&self, session_id: SessionId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&session_id)
    }

    /// Lock out step commits for `session_id` until the guard drops. Held
    /// around registry and archive writes only, never across a result wait.
    pub async fn commit_lock(&self, session_id: SessionId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.commits
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(session_id)
                .or_default(),
        );
        lock.lock_owned().await
    }

    /// Drop the commit lock of a session that no longer exists.
    pub fn forget(&self, session_id: SessionId) {
        self.commits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
    }

    fn claim(&self, session_id: SessionId) -> Result<FlightGuard<'_>, OrchestratorError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(session_id) {
            return Err(OrchestratorError::Conflict(session_id));
        }
        Ok(FlightGuard {
            in_flight: &self.in_flight,
            session_id,
        })
    }

    /// Advance `session_id` by one step, waiting at most `timeout` for the
    /// worker's result.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Conflict`] if a request for the session is
    ///   already running
    /// - [`OrchestratorError::NotFound`] if the session is unknown, has
    ///   ended, or its worker is gone
    /// - [`OrchestratorError::Timeout`] if no result arrived in time
    /// - [`OrchestratorError::Persistence`] if the step ran but could not be
    ///   archived; the step counter still advances
    /// - [`OrchestratorError::Protocol`] if the worker skipped a step or sent
    ///   an unreadable result
    pub async fn request_step(
        &self,
        session_id: SessionId,
        timeout: Duration,
    ) -> Result<StepOutcome, OrchestratorError> {
        let _flight = self.claim(session_id)?;
        let mut record = self.registry.require(session_id).await?;

        match record.state {
            SessionState::Completed => {
                return Ok(StepOutcome::EndOfSession {
                    steps_completed: record.step_counter,
                });
            }
            SessionState::Terminated | SessionState::Expired => {
                return Err(OrchestratorError::not_found(session_id, "session has ended"));
            }
            SessionState::Created => {
                record.state = self.registry.transition(session_id, SessionState::Running).await?;
            }
            SessionState::Running => {}
        }

        if record.budget_exhausted() {
            self.registry.transition(session_id, SessionState::Completed).await?;
            return Ok(StepOutcome::EndOfSession {
                steps_completed: record.step_counter,
            });
        }

        if !self.supervisor.is_alive(&record.worker) {
            self.expire(session_id).await;
            return Err(OrchestratorError::not_found(session_id, "worker is not running"));
        }

        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or_else(|| OrchestratorError::InvalidConfig(format!("step timeout {timeout:?} out of range")))?;
        let binding = ChannelBinding::for_session(session_id);

        if record.pending_trigger {
            tracing::debug!(
                session_id = %session_id,
                step = record.step_counter,
                "collecting result of an earlier timed-out request"
            );
        } else if let Some(collected) = self.collect_queued(&record, &binding).await? {
            tracing::warn!(session_id = %session_id, step = record.step_counter, "result already queued, not triggering");
            return self.finish(&record, collected).await;
        } else {
            self.publish_trigger(&record, &binding, deadline, timeout).await?;
            self.registry
                .update(session_id, &SessionUpdate::pending_trigger(true))
                .await?;
        }

        let collected = match self.await_result(&record, &binding, deadline, timeout).await {
            Err(timed_out @ OrchestratorError::Timeout { .. }) if record.pending_trigger => {
                tracing::warn!(
                    session_id = %session_id,
                    step = record.step_counter,
                    "earlier trigger never produced a result, next request triggers again"
                );
                self.registry
                    .update(session_id, &SessionUpdate::pending_trigger(false))
                    .await?;
                return Err(timed_out);
            }
            awaited => awaited?,
        };
        self.finish(&record, collected).await
    }

    /// Take a result that is already queued without waiting.
    async fn collect_queued(
        &self,
        record: &SessionRecord,
        binding: &ChannelBinding,
    ) -> Result<Option<Collected>, OrchestratorError> {
        while let Some(raw) = self.bus.pop(&binding.results, Duration::ZERO).await? {
            if let Some(collected) = classify(record, &raw)? {
                return Ok(Some(collected));
            }
        }
        Ok(None)
    }

    /// Publish the trigger, retrying while the worker has not subscribed yet.
    async fn publish_trigger(
        &self,
        record: &SessionRecord,
        binding: &ChannelBinding,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), OrchestratorError> {
        let session_id = record.session_id;
        loop {
            if self.bus.publish(&binding.trigger, TRIGGER_PAYLOAD).await? > 0 {
                tracing::debug!(session_id = %session_id, step = record.step_counter, "step triggered");
                return Ok(());
            }
            if !self.supervisor.is_alive(&record.worker) {
                self.expire(session_id).await;
                return Err(OrchestratorError::not_found(session_id, "worker is not running"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OrchestratorError::Timeout {
                    session_id,
                    waited: timeout,
                });
            }
            tokio::time::sleep(remaining.min(PUBLISH_RETRY_INTERVAL)).await;
        }
    }

    /// Pop results until the one for the expected step arrives.
    async fn await_result(
        &self,
        record: &SessionRecord,
        binding: &ChannelBinding,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Collected, OrchestratorError> {
        let session_id = record.session_id;
        let expected = record.step_counter;
        loop {
            let slice = deadline
                .saturating_duration_since(Instant::now())
                .min(self.probe_interval);

            if let Some(raw) = self.bus.pop(&binding.results, slice).await? {
                match classify(record, &raw)? {
                    Some(collected) => return Ok(collected),
                    None => continue,
                }
            }

            if Instant::now() >= deadline {
                tracing::info!(session_id = %session_id, step = expected, ?timeout, "step timed out");
                return Err(OrchestratorError::Timeout {
                    session_id,
                    waited: timeout,
                });
            }
            if !self.supervisor.is_alive(&record.worker) {
                tracing::warn!(session_id = %session_id, pid = record.worker.pid, "worker died mid-step");
                self.expire(session_id).await;
                return Err(OrchestratorError::not_found(session_id, "worker exited mid-step"));
            }
        }
    }

    /// Persist a collected result and advance the registry.
    async fn finish(
        &self,
        record: &SessionRecord,
        collected: Collected,
    ) -> Result<StepOutcome, OrchestratorError> {
        let session_id = record.session_id;
        let _commit = self.commit_lock(session_id).await;

        // The session may have been ended while we waited.
        let current = self.registry.get(session_id).await?;
        if current.is_none_or(|r| matches!(r.state, SessionState::Terminated | SessionState::Expired)) {
            tracing::info!(session_id = %session_id, "session ended mid-step, result discarded");
            return Err(OrchestratorError::not_found(session_id, "session ended mid-step"));
        }

        let (index, data) = match collected {
            Collected::Step { index, data } => (index, data),
            Collected::Exhausted => {
                tracing::info!(session_id = %session_id, "worker reported no steps left");
                self.registry
                    .update(
                        session_id,
                        &SessionUpdate {
                            state: Some(SessionState::Completed),
                            pending_trigger: Some(false),
                            ..SessionUpdate::default()
                        },
                    )
                    .await?;
                return Ok(StepOutcome::EndOfSession {
                    steps_completed: record.step_counter,
                });
            }
        };

        let snapshot = StepSnapshot {
            session_id,
            step: index,
            data,
        };
        let persisted = self.archive.insert_step(&snapshot).await;

        let completed = index.saturating_add(1);
        let update = SessionUpdate {
            state: (completed >= record.config.steps).then_some(SessionState::Completed),
            step_counter: Some(completed),
            pending_trigger: Some(false),
            last_step_at: Some(Utc::now()),
        };
        self.registry.update(session_id, &update).await?;

        match persisted {
            Ok(InsertOutcome::Inserted) => {
                tracing::info!(session_id = %session_id, step = index, "step persisted");
            }
            Ok(InsertOutcome::AlreadyPresent) => {
                tracing::warn!(session_id = %session_id, step = index, "step already archived, stored copy kept");
            }
            Err(source) => {
                tracing::error!(session_id = %session_id, step = index, error = %source, "step ran but was not persisted");
                return Err(OrchestratorError::Persistence {
                    session_id,
                    step: index,
                    source,
                });
            }
        }
        Ok(StepOutcome::Advanced(snapshot))
    }

    /// Mark a session whose worker vanished.
    async fn expire(&self, session_id: SessionId) {
        let update = SessionUpdate {
            state: Some(SessionState::Expired),
            pending_trigger: Some(false),
            ..SessionUpdate::default()
        };
        if let Err(e) = self.registry.update(session_id, &update).await {
            tracing::warn!(session_id = %session_id, error = %e, "could not mark session expired");
        }
    }
}

/// Decode a queued result for `record`'s next step. Stale results (for
/// steps already counted) yield `None`.
fn classify(record: &SessionRecord, raw: &str) -> Result<Option<Collected>, OrchestratorError> {
    let session_id = record.session_id;
    let expected = record.step_counter;
    let result: StepResultRecord = serde_json::from_str(raw).map_err(|e| OrchestratorError::Protocol {
        session_id,
        message: format!("unreadable step result: {e}"),
    })?;
    let step_index = result.step_index();
    let (Some(data), Some(index)) = (result.state_snapshot, step_index) else {
        return Ok(Some(Collected::Exhausted));
    };
    if index < expected {
        tracing::warn!(session_id = %session_id, index, expected, "discarding stale step result");
        return Ok(None);
    }
    if index > expected {
        return Err(OrchestratorError::Protocol {
            session_id,
            message: format!("expected step {expected}, worker sent step {index}"),
        });
    }
    Ok(Some(Collected::Step { index, data }))
}
