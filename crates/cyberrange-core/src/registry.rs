//! Session registry: the durable record of which workers should exist.
//!
//! [`SessionStore`] is the storage seam (`Dragonfly` hashes in production,
//! [`MemorySessionStore`] in-process). [`SessionRegistry`] wraps a store and
//! owns the lifecycle rule: states only move forward.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cyberrange_types::{SessionId, SessionRecord, SessionState, SessionUpdate};

use crate::error::{OrchestratorError, StoreError};

/// Storage for session records.
///
/// `update` writes only the fields set in the [`SessionUpdate`], so
/// concurrent updates to disjoint fields never overwrite each other.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a new record. Fails with [`StoreError::AlreadyExists`] if the
    /// id is taken.
    async fn create(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Fetch a record.
    async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StoreError>;

    /// Apply a partial update. Returns `false` if the record does not exist.
    async fn update(&self, session_id: SessionId, update: &SessionUpdate)
    -> Result<bool, StoreError>;

    /// Remove a record. Returns `false` if it did not exist.
    async fn delete(&self, session_id: SessionId) -> Result<bool, StoreError>;

    /// Ids of every stored record.
    async fn list(&self) -> Result<Vec<SessionId>, StoreError>;
}

/// In-process [`SessionStore`].
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    records: Arc<Mutex<BTreeMap<SessionId, SessionRecord>>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<SessionId, SessionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let mut records = self.records();
        if records.contains_key(&record.session_id) {
            return Err(StoreError::AlreadyExists(record.session_id.to_string()));
        }
        records.insert(record.session_id, record.clone());
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records().get(&session_id).cloned())
    }

    async fn update(
        &self,
        session_id: SessionId,
        update: &SessionUpdate,
    ) -> Result<bool, StoreError> {
        let mut records = self.records();
        let Some(record) = records.get_mut(&session_id) else {
            return Ok(false);
        };
        update.apply_to(record);
        Ok(true)
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool, StoreError> {
        Ok(self.records().remove(&session_id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionId>, StoreError> {
        Ok(self.records().keys().copied().collect())
    }
}

/// Lifecycle-aware access to a [`SessionStore`].
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry").finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Wrap a store.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Insert a new record.
    pub async fn create(&self, record: &SessionRecord) -> Result<(), OrchestratorError> {
        Ok(self.store.create(record).await?)
    }

    /// Fetch a record, if present.
    pub async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>, OrchestratorError> {
        Ok(self.store.get(session_id).await?)
    }

    /// Fetch a record or fail with [`OrchestratorError::NotFound`].
    pub async fn require(&self, session_id: SessionId) -> Result<SessionRecord, OrchestratorError> {
        self.get(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(session_id, "no such session"))
    }

    /// Apply a partial update to an existing record.
    ///
    /// A state change in `update` is checked against the current state
    /// first.
    pub async fn update(
        &self,
        session_id: SessionId,
        update: &SessionUpdate,
    ) -> Result<(), OrchestratorError> {
        if let Some(next) = update.state {
            let current = self.require(session_id).await?;
            check_transition(session_id, current.state, next)?;
        }
        if self.store.update(session_id, update).await? {
            Ok(())
        } else {
            Err(OrchestratorError::not_found(session_id, "no such session"))
        }
    }

    /// Move a session to `next`. Moving to the state it is already in is a
    /// no-op.
    pub async fn transition(
        &self,
        session_id: SessionId,
        next: SessionState,
    ) -> Result<SessionState, OrchestratorError> {
        let current = self.require(session_id).await?;
        if current.state == next {
            return Ok(next);
        }
        check_transition(session_id, current.state, next)?;
        self.update(session_id, &SessionUpdate::state(next)).await?;
        tracing::info!(session_id = %session_id, from = %current.state, to = %next, "session state changed");
        Ok(next)
    }

    /// Remove a record. Returns whether it existed.
    pub async fn delete(&self, session_id: SessionId) -> Result<bool, OrchestratorError> {
        Ok(self.store.delete(session_id).await?)
    }

    /// Every stored record. Ids whose record vanished mid-scan are skipped.
    pub async fn all(&self) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let mut records = Vec::new();
        for session_id in self.store.list().await? {
            if let Some(record) = self.store.get(session_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn check_transition(
    session_id: SessionId,
    from: SessionState,
    to: SessionState,
) -> Result<(), OrchestratorError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidTransition {
            session_id,
            from,
            to,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cyberrange_types::{GameConfig, WorkerHandle};

    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(MemorySessionStore::new()))
    }

    fn record() -> SessionRecord {
        SessionRecord::new(
            SessionId::new(),
            GameConfig::default(),
            WorkerHandle {
                pid: 4242,
                pgid: 4242,
                started_at: 17,
            },
        )
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let registry = registry();
        let record = record();
        registry.create(&record).await.unwrap();
        let again = registry.create(&record).await;
        assert!(matches!(
            again,
            Err(OrchestratorError::Store(StoreError::AlreadyExists(_)))
        ));
    }

    #[tokio::test]
    async fn lifecycle_moves_forward_only() {
        let registry = registry();
        let record = record();
        let id = record.session_id;
        registry.create(&record).await.unwrap();

        registry.transition(id, SessionState::Running).await.unwrap();
        registry.transition(id, SessionState::Completed).await.unwrap();
        let back = registry.transition(id, SessionState::Running).await;
        assert!(matches!(
            back,
            Err(OrchestratorError::InvalidTransition {
                from: SessionState::Completed,
                to: SessionState::Running,
                ..
            })
        ));
        assert_eq!(registry.require(id).await.unwrap().state, SessionState::Completed);
    }

    #[tokio::test]
    async fn disjoint_updates_both_survive() {
        let registry = registry();
        let record = record();
        let id = record.session_id;
        registry.create(&record).await.unwrap();
        registry.transition(id, SessionState::Running).await.unwrap();

        let bump = SessionUpdate {
            step_counter: Some(1),
            ..SessionUpdate::default()
        };
        let (counter, state) = tokio::join!(
            registry.update(id, &bump),
            registry.transition(id, SessionState::Terminated),
        );
        counter.unwrap();
        state.unwrap();

        let stored = registry.require(id).await.unwrap();
        assert_eq!(stored.step_counter, 1);
        assert_eq!(stored.state, SessionState::Terminated);
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let registry = registry();
        let id = SessionId::new();
        assert!(matches!(
            registry.require(id).await,
            Err(OrchestratorError::NotFound { .. })
        ));
        assert!(matches!(
            registry.update(id, &SessionUpdate::pending_trigger(true)).await,
            Err(OrchestratorError::NotFound { .. })
        ));
        assert!(!registry.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn all_lists_every_record() {
        let registry = registry();
        let first = record();
        let second = record();
        registry.create(&first).await.unwrap();
        registry.create(&second).await.unwrap();

        let mut ids: Vec<_> = registry.all().await.unwrap().into_iter().map(|r| r.session_id).collect();
        ids.sort();
        let mut expected = vec![first.session_id, second.session_id];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
