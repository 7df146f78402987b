//! Session registry records stored as `Dragonfly` hashes.
//!
//! Each record lives in the hash `session:{id}` with one field per value,
//! and its id is a member of the `sessions:index` set. Updates write only
//! the fields they change, so a step counter bump and a concurrent state
//! change never overwrite each other.
//!
//! | Field | Encoding |
//! |-------|----------|
//! | `session_id` | UUID |
//! | `worker_pid`, `worker_pgid` | decimal |
//! | `worker_started_at` | seconds since the epoch |
//! | `state` | `created`, `running`, `completed`, `terminated`, `expired` |
//! | `step_counter`, `max_steps` | decimal |
//! | `red_agent`, `blue_agent`, `wrapper` | worker selector strings |
//! | `created_at`, `last_step_at` | RFC 3339 |
//! | `pending_trigger` | `0` or `1` |
//!
//! A hash without a `session_id` field is the leftover of an update that
//! raced a delete. It is treated as missing and removed on sight.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyberrange_core::StoreError;
use cyberrange_core::registry::SessionStore;
use cyberrange_types::{
    ChannelBinding, GameConfig, REGISTRY_INDEX_KEY, SessionId, SessionRecord, SessionUpdate,
    WorkerHandle,
};
use fred::prelude::*;

use crate::dragonfly::DragonflyPool;
use crate::error::DbError;

const SESSION_ID: &str = "session_id";
const WORKER_PID: &str = "worker_pid";
const WORKER_PGID: &str = "worker_pgid";
const WORKER_STARTED_AT: &str = "worker_started_at";
const STATE: &str = "state";
const STEP_COUNTER: &str = "step_counter";
const MAX_STEPS: &str = "max_steps";
const RED_AGENT: &str = "red_agent";
const BLUE_AGENT: &str = "blue_agent";
const WRAPPER: &str = "wrapper";
const CREATED_AT: &str = "created_at";
const LAST_STEP_AT: &str = "last_step_at";
const PENDING_TRIGGER: &str = "pending_trigger";

// =============================================================================
// Hash encoding
// =============================================================================

const fn encode_flag(flag: bool) -> &'static str {
    if flag { "1" } else { "0" }
}

/// Every field of a record except `session_id`, which is written first and
/// on its own so creation can be exclusive.
fn record_fields(record: &SessionRecord) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        (WORKER_PID, record.worker.pid.to_string()),
        (WORKER_PGID, record.worker.pgid.to_string()),
        (WORKER_STARTED_AT, record.worker.started_at.to_string()),
        (STEP_COUNTER, record.step_counter.to_string()),
        (MAX_STEPS, record.config.steps.to_string()),
        (RED_AGENT, record.config.red_agent.as_str().to_owned()),
        (BLUE_AGENT, record.config.blue_agent.as_str().to_owned()),
        (WRAPPER, record.config.wrapper.as_str().to_owned()),
        (CREATED_AT, record.created_at.to_rfc3339()),
        (PENDING_TRIGGER, encode_flag(record.pending_trigger).to_owned()),
        (STATE, record.state.as_str().to_owned()),
    ];
    if let Some(at) = record.last_step_at {
        fields.push((LAST_STEP_AT, at.to_rfc3339()));
    }
    fields
}

/// Only the fields an update sets.
fn update_fields(update: &SessionUpdate) -> Vec<(&'static str, String)> {
    let mut fields = Vec::new();
    if let Some(state) = update.state {
        fields.push((STATE, state.as_str().to_owned()));
    }
    if let Some(counter) = update.step_counter {
        fields.push((STEP_COUNTER, counter.to_string()));
    }
    if let Some(pending) = update.pending_trigger {
        fields.push((PENDING_TRIGGER, encode_flag(pending).to_owned()));
    }
    if let Some(at) = update.last_step_at {
        fields.push((LAST_STEP_AT, at.to_rfc3339()));
    }
    fields
}

fn required<'a>(key: &str, hash: &'a HashMap<String, String>, field: &str) -> Result<&'a str, DbError> {
    hash.get(field)
        .map(String::as_str)
        .ok_or_else(|| DbError::corrupt(key, format!("missing field `{field}`")))
}

fn parsed<T>(key: &str, hash: &HashMap<String, String>, field: &str) -> Result<T, DbError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    required(key, hash, field)?
        .parse()
        .map_err(|e: T::Err| DbError::corrupt(key, format!("field `{field}`: {e}")))
}

fn timestamp(key: &str, field: &str, raw: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| DbError::corrupt(key, format!("field `{field}`: {e}")))
}

/// Rebuild a record from its hash. `Ok(None)` means the hash is an orphan
/// without a `session_id` field.
fn decode_record(key: &str, hash: &HashMap<String, String>) -> Result<Option<SessionRecord>, DbError> {
    if !hash.contains_key(SESSION_ID) {
        return Ok(None);
    }
    let pending_trigger = match required(key, hash, PENDING_TRIGGER)? {
        "1" => true,
        "0" => false,
        other => {
            return Err(DbError::corrupt(key, format!("field `{PENDING_TRIGGER}`: `{other}`")));
        }
    };
    let last_step_at = hash
        .get(LAST_STEP_AT)
        .map(|raw| timestamp(key, LAST_STEP_AT, raw))
        .transpose()?;

    Ok(Some(SessionRecord {
        session_id: parsed(key, hash, SESSION_ID)?,
        config: GameConfig {
            red_agent: parsed(key, hash, RED_AGENT)?,
            blue_agent: parsed(key, hash, BLUE_AGENT)?,
            wrapper: parsed(key, hash, WRAPPER)?,
            steps: parsed(key, hash, MAX_STEPS)?,
        },
        worker: WorkerHandle {
            pid: parsed(key, hash, WORKER_PID)?,
            pgid: parsed(key, hash, WORKER_PGID)?,
            started_at: parsed(key, hash, WORKER_STARTED_AT)?,
        },
        state: parsed(key, hash, STATE)?,
        step_counter: parsed(key, hash, STEP_COUNTER)?,
        pending_trigger,
        created_at: timestamp(key, CREATED_AT, required(key, hash, CREATED_AT)?)?,
        last_step_at,
    }))
}

// =============================================================================
// Registry operations
// =============================================================================

impl DragonflyPool {
    async fn write_fields(&self, key: &str, fields: Vec<(&'static str, String)>) -> Result<(), DbError> {
        let _: u64 = self.client().hset(key, fields).await?;
        Ok(())
    }

    async fn remove_orphan(&self, session_id: SessionId, key: &str) -> Result<(), DbError> {
        tracing::warn!(session_id = %session_id, "removing partial registry hash");
        let _: u32 = self.client().del(key).await?;
        let _: u32 = self.client().srem(REGISTRY_INDEX_KEY, session_id.to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for DragonflyPool {
    async fn create(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let key = ChannelBinding::for_session(record.session_id).registry;
        let claimed: bool = self
            .client()
            .hsetnx(&key, SESSION_ID, record.session_id.to_string())
            .await
            .map_err(DbError::from)?;
        if !claimed {
            return Err(StoreError::AlreadyExists(key));
        }
        self.write_fields(&key, record_fields(record)).await?;
        let _: u32 = self
            .client()
            .sadd(REGISTRY_INDEX_KEY, record.session_id.to_string())
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn get(&self, session_id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let key = ChannelBinding::for_session(session_id).registry;
        let hash: HashMap<String, String> = self.client().hgetall(&key).await.map_err(DbError::from)?;
        if hash.is_empty() {
            return Ok(None);
        }
        match decode_record(&key, &hash)? {
            Some(record) => Ok(Some(record)),
            None => {
                self.remove_orphan(session_id, &key).await?;
                Ok(None)
            }
        }
    }

    async fn update(&self, session_id: SessionId, update: &SessionUpdate) -> Result<bool, StoreError> {
        let key = ChannelBinding::for_session(session_id).registry;
        let exists: bool = self
            .client()
            .hexists(&key, SESSION_ID)
            .await
            .map_err(DbError::from)?;
        if !exists {
            return Ok(false);
        }
        let fields = update_fields(update);
        if !fields.is_empty() {
            self.write_fields(&key, fields).await?;
        }
        Ok(true)
    }

    async fn delete(&self, session_id: SessionId) -> Result<bool, StoreError> {
        let key = ChannelBinding::for_session(session_id).registry;
        let removed: u32 = self.client().del(&key).await.map_err(DbError::from)?;
        let _: u32 = self
            .client()
            .srem(REGISTRY_INDEX_KEY, session_id.to_string())
            .await
            .map_err(DbError::from)?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<SessionId>, StoreError> {
        let members: Vec<String> = self
            .client()
            .smembers(REGISTRY_INDEX_KEY)
            .await
            .map_err(DbError::from)?;
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            match member.parse() {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!(member = %member, error = %e, "skipping malformed registry index entry"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
