//! Durable step archive seam.
//!
//! The archive stores each game's configuration and its step snapshots,
//! keyed by `(session, step)`. Snapshots are write-once: inserting a step
//! that already exists leaves the stored copy untouched and reports
//! [`InsertOutcome::AlreadyPresent`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use cyberrange_types::{GameConfig, GameSummary, SessionId, StepSnapshot};

use crate::error::StoreError;

/// Result of a write-once insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The snapshot was stored.
    Inserted,
    /// A snapshot for this step already existed and was kept.
    AlreadyPresent,
}

/// Durable storage for game configurations and step snapshots.
#[async_trait]
pub trait StepArchive: Send + Sync + 'static {
    /// Record the configuration a game was started with.
    async fn record_game(&self, session_id: SessionId, config: &GameConfig) -> Result<(), StoreError>;

    /// Configuration of an archived game.
    async fn game_config(&self, session_id: SessionId) -> Result<Option<GameConfig>, StoreError>;

    /// Store a snapshot unless one exists for the same step.
    async fn insert_step(&self, snapshot: &StepSnapshot) -> Result<InsertOutcome, StoreError>;

    /// Fetch one snapshot.
    async fn get_step(&self, session_id: SessionId, step: u32) -> Result<Option<StepSnapshot>, StoreError>;

    /// Every archived game with its latest stored step.
    async fn list_games(&self) -> Result<Vec<GameSummary>, StoreError>;

    /// Delete a game's snapshots and configuration. Returns the number of
    /// rows removed.
    async fn purge_game(&self, session_id: SessionId) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
struct ArchivedGame {
    config: GameConfig,
    steps: BTreeMap<u32, serde_json::Value>,
}

/// In-process [`StepArchive`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStepArchive {
    games: Arc<Mutex<BTreeMap<SessionId, ArchivedGame>>>,
}

impl MemoryStepArchive {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored step indices for a game, ascending.
    pub fn step_indices(&self, session_id: SessionId) -> Vec<u32> {
        self.games
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .map(|game| game.steps.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StepArchive for MemoryStepArchive {
    async fn record_game(&self, session_id: SessionId, config: &GameConfig) -> Result<(), StoreError> {
        let mut games = self.games.lock().unwrap_or_else(PoisonError::into_inner);
        if games.contains_key(&session_id) {
            return Err(StoreError::AlreadyExists(session_id.to_string()));
        }
        games.insert(
            session_id,
            ArchivedGame {
                config: *config,
                steps: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn game_config(&self, session_id: SessionId) -> Result<Option<GameConfig>, StoreError> {
        Ok(self
            .games
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .map(|game| game.config))
    }

    async fn insert_step(&self, snapshot: &StepSnapshot) -> Result<InsertOutcome, StoreError> {
        let mut games = self.games.lock().unwrap_or_else(PoisonError::into_inner);
        let game = games.get_mut(&snapshot.session_id).ok_or_else(|| StoreError::Backend(format!(
            "no game configuration for session {}",
            snapshot.session_id
        )))?;
        if game.steps.contains_key(&snapshot.step) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        game.steps.insert(snapshot.step, snapshot.data.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_step(&self, session_id: SessionId, step: u32) -> Result<Option<StepSnapshot>, StoreError> {
        Ok(self
            .games
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .and_then(|game| game.steps.get(&step))
            .map(|data| StepSnapshot {
                session_id,
                step,
                data: data.clone(),
            }))
    }

    async fn list_games(&self) -> Result<Vec<GameSummary>, StoreError> {
        Ok(self
            .games
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(&id, game)| {
                GameSummary::new(id, game.config, game.steps.keys().next_back().copied())
            })
            .collect())
    }

    async fn purge_game(&self, session_id: SessionId) -> Result<u64, StoreError> {
        let removed = self
            .games
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        Ok(removed.map_or(0, |game| {
            u64::try_from(game.steps.len()).unwrap_or(u64::MAX).saturating_add(1)
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn snapshot(session_id: SessionId, step: u32, marker: &str) -> StepSnapshot {
        StepSnapshot {
            session_id,
            step,
            data: json!({ "marker": marker }),
        }
    }

    #[tokio::test]
    async fn steps_are_write_once() {
        let archive = MemoryStepArchive::new();
        let id = SessionId::new();
        archive.record_game(id, &GameConfig::default()).await.unwrap();

        let first = archive.insert_step(&snapshot(id, 0, "original")).await.unwrap();
        let second = archive.insert_step(&snapshot(id, 0, "rewrite")).await.unwrap();
        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::AlreadyPresent);

        let stored = archive.get_step(id, 0).await.unwrap().unwrap();
        assert_eq!(stored.data, json!({ "marker": "original" }));
    }

    #[tokio::test]
    async fn list_reports_latest_step_and_completion() {
        let archive = MemoryStepArchive::new();
        let id = SessionId::new();
        let config = GameConfig {
            steps: 2,
            ..GameConfig::default()
        };
        archive.record_game(id, &config).await.unwrap();
        archive.insert_step(&snapshot(id, 0, "a")).await.unwrap();

        let listed = archive.list_games().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed.first().unwrap().step, Some(0));
        assert!(!listed.first().unwrap().completed);

        archive.insert_step(&snapshot(id, 1, "b")).await.unwrap();
        let listed = archive.list_games().await.unwrap();
        assert!(listed.first().unwrap().completed);
    }

    #[tokio::test]
    async fn purge_removes_everything() {
        let archive = MemoryStepArchive::new();
        let id = SessionId::new();
        archive.record_game(id, &GameConfig::default()).await.unwrap();
        archive.insert_step(&snapshot(id, 0, "a")).await.unwrap();

        assert_eq!(archive.purge_game(id).await.unwrap(), 2);
        assert_eq!(archive.purge_game(id).await.unwrap(), 0);
        assert!(archive.game_config(id).await.unwrap().is_none());
    }
}
