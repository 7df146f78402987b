//! Write-once step archive in `PostgreSQL`.
//!
//! `game_configurations` holds one row per game with the selectors it was
//! started with. `game_states` holds one JSONB snapshot per step, keyed by
//! `(game_id, step)`. A second insert for the same step is ignored and the
//! first snapshot wins.

use async_trait::async_trait;
use cyberrange_core::StoreError;
use cyberrange_core::archive::{InsertOutcome, StepArchive};
use cyberrange_types::{GameConfig, GameSummary, SessionId, StepSnapshot};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::DbError;

/// Raw `game_configurations` row joined with its latest step.
type GameRow = (Uuid, String, String, String, i32, Option<i32>);

/// Operations on the `game_configurations` and `game_states` tables.
#[derive(Debug, Clone)]
pub struct GameStore {
    pool: PgPool,
}

impl GameStore {
    /// Create a new game store over a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_config(&self, game_id: Uuid, config: &GameConfig) -> Result<(), DbError> {
        sqlx::query(
            r"INSERT INTO game_configurations (game_id, red_agent, blue_agent, wrapper, steps)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (game_id) DO NOTHING",
        )
        .bind(game_id)
        .bind(config.red_agent.as_str())
        .bind(config.blue_agent.as_str())
        .bind(config.wrapper.as_str())
        .bind(to_sql_int("steps", config.steps)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_config(&self, game_id: Uuid) -> Result<Option<GameConfig>, DbError> {
        let row: Option<(String, String, String, i32)> = sqlx::query_as(
            r"SELECT red_agent, blue_agent, wrapper, steps
              FROM game_configurations
              WHERE game_id = $1",
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(red, blue, wrapper, steps)| decode_config(game_id, &red, &blue, &wrapper, steps))
            .transpose()
    }

    async fn insert_snapshot(&self, snapshot: &StepSnapshot) -> Result<InsertOutcome, DbError> {
        let result = sqlx::query(
            r"INSERT INTO game_states (game_id, step, data)
              VALUES ($1, $2, $3)
              ON CONFLICT (game_id, step) DO NOTHING",
        )
        .bind(snapshot.session_id.into_inner())
        .bind(to_sql_int("step", snapshot.step)?)
        .bind(&snapshot.data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                game_id = %snapshot.session_id,
                step = snapshot.step,
                "Step already archived, keeping the first snapshot"
            );
            return Ok(InsertOutcome::AlreadyPresent);
        }
        tracing::debug!(game_id = %snapshot.session_id, step = snapshot.step, "Archived step");
        Ok(InsertOutcome::Inserted)
    }

    async fn fetch_snapshot(&self, game_id: Uuid, step: u32) -> Result<Option<StepSnapshot>, DbError> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            r"SELECT data FROM game_states WHERE game_id = $1 AND step = $2",
        )
        .bind(game_id)
        .bind(to_sql_int("step", step)?)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(data,)| StepSnapshot {
            session_id: SessionId::from(game_id),
            step,
            data,
        }))
    }

    async fn fetch_games(&self) -> Result<Vec<GameSummary>, DbError> {
        let rows: Vec<GameRow> = sqlx::query_as(
            r"SELECT c.game_id, c.red_agent, c.blue_agent, c.wrapper, c.steps, MAX(s.step)
              FROM game_configurations c
              LEFT JOIN game_states s ON s.game_id = c.game_id
              GROUP BY c.game_id
              ORDER BY c.created_at, c.game_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(game_id, red, blue, wrapper, steps, latest)| {
                let config = decode_config(game_id, &red, &blue, &wrapper, steps)?;
                let latest = latest.map(|step| from_sql_int(game_id, "step", step)).transpose()?;
                Ok(GameSummary::new(SessionId::from(game_id), config, latest))
            })
            .collect()
    }

    async fn delete_game(&self, game_id: Uuid) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        let states = sqlx::query(r"DELETE FROM game_states WHERE game_id = $1")
            .bind(game_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let configs = sqlx::query(r"DELETE FROM game_configurations WHERE game_id = $1")
            .bind(game_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        let removed = states.saturating_add(configs);
        tracing::info!(game_id = %game_id, removed, "Purged archived game");
        Ok(removed)
    }
}

fn to_sql_int(field: &str, value: u32) -> Result<i32, DbError> {
    i32::try_from(value).map_err(|e| DbError::Config(format!("{field} {value}: {e}")))
}

fn from_sql_int(game_id: Uuid, field: &str, value: i32) -> Result<u32, DbError> {
    u32::try_from(value)
        .map_err(|e| DbError::corrupt(format!("game {game_id}"), format!("{field} {value}: {e}")))
}

fn decode_config(game_id: Uuid, red: &str, blue: &str, wrapper: &str, steps: i32) -> Result<GameConfig, DbError> {
    let corrupt = |e: cyberrange_types::UnknownKind| DbError::corrupt(format!("game {game_id}"), e.to_string());
    Ok(GameConfig {
        red_agent: red.parse().map_err(corrupt)?,
        blue_agent: blue.parse().map_err(corrupt)?,
        wrapper: wrapper.parse().map_err(corrupt)?,
        steps: from_sql_int(game_id, "steps", steps)?,
    })
}

#[async_trait]
impl StepArchive for GameStore {
    async fn record_game(&self, session_id: SessionId, config: &GameConfig) -> Result<(), StoreError> {
        Ok(self.insert_config(session_id.into_inner(), config).await?)
    }

    async fn game_config(&self, session_id: SessionId) -> Result<Option<GameConfig>, StoreError> {
        Ok(self.fetch_config(session_id.into_inner()).await?)
    }

    async fn insert_step(&self, snapshot: &StepSnapshot) -> Result<InsertOutcome, StoreError> {
        Ok(self.insert_snapshot(snapshot).await?)
    }

    async fn get_step(&self, session_id: SessionId, step: u32) -> Result<Option<StepSnapshot>, StoreError> {
        Ok(self.fetch_snapshot(session_id.into_inner(), step).await?)
    }

    async fn list_games(&self) -> Result<Vec<GameSummary>, StoreError> {
        Ok(self.fetch_games().await?)
    }

    async fn purge_game(&self, session_id: SessionId) -> Result<u64, StoreError> {
        Ok(self.delete_game(session_id.into_inner()).await?)
    }
}
