//! Core records exchanged between the orchestrator, the worker and storage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{BlueAgentKind, OutputStream, RedAgentKind, SessionState, WrapperKind};
use crate::ids::SessionId;

/// Default step budget when a start request omits `steps`.
pub const DEFAULT_STEP_BUDGET: u32 = 10;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-session simulation configuration chosen by the client at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GameConfig {
    /// Attacker agent.
    #[serde(default)]
    pub red_agent: RedAgentKind,
    /// Defender agent.
    #[serde(default)]
    pub blue_agent: BlueAgentKind,
    /// Environment wrapper mode.
    #[serde(default)]
    pub wrapper: WrapperKind,
    /// Step budget (`max_steps`) for this session.
    #[serde(default = "default_steps")]
    pub steps: u32,
}

const fn default_steps() -> u32 {
    DEFAULT_STEP_BUDGET
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            red_agent: RedAgentKind::default(),
            blue_agent: BlueAgentKind::default(),
            wrapper: WrapperKind::default(),
            steps: DEFAULT_STEP_BUDGET,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker handle
// ---------------------------------------------------------------------------

/// OS-level handle of a spawned worker.
///
/// `started_at` is the process start time reported by the OS (seconds since
/// the Unix epoch). A pid is only treated as the original worker when its
/// current start time matches, which guards against pid reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct WorkerHandle {
    /// Process id of the worker.
    pub pid: u32,
    /// Process group id; the worker leads its own group.
    pub pgid: u32,
    /// OS start time of the process, `0` when it could not be read.
    pub started_at: u64,
}

// ---------------------------------------------------------------------------
// Session registry record
// ---------------------------------------------------------------------------

/// The registry's view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SessionRecord {
    /// Session identity.
    pub session_id: SessionId,
    /// Configuration the worker was launched with.
    pub config: GameConfig,
    /// Handle of the worker process.
    pub worker: WorkerHandle,
    /// Lifecycle state.
    pub state: SessionState,
    /// Number of steps completed so far (next step index).
    pub step_counter: u32,
    /// A trigger was published whose result has not been collected yet.
    pub pending_trigger: bool,
    /// When the session was started.
    pub created_at: DateTime<Utc>,
    /// When the last step result was collected.
    pub last_step_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// A freshly created record for a newly spawned worker.
    pub fn new(session_id: SessionId, config: GameConfig, worker: WorkerHandle) -> Self {
        Self {
            session_id,
            config,
            worker,
            state: SessionState::Created,
            step_counter: 0,
            pending_trigger: false,
            created_at: Utc::now(),
            last_step_at: None,
        }
    }

    /// Whether the step budget has been used up.
    pub const fn budget_exhausted(&self) -> bool {
        self.step_counter >= self.config.steps
    }
}

/// A partial update to a [`SessionRecord`].
///
/// Only the fields set to `Some` are written, so concurrent updates that
/// touch disjoint fields do not overwrite each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    /// New lifecycle state.
    pub state: Option<SessionState>,
    /// New step counter.
    pub step_counter: Option<u32>,
    /// New pending-trigger flag.
    pub pending_trigger: Option<bool>,
    /// New last-step timestamp.
    pub last_step_at: Option<DateTime<Utc>>,
}

impl SessionUpdate {
    /// Update only the lifecycle state.
    pub const fn state(state: SessionState) -> Self {
        Self {
            state: Some(state),
            step_counter: None,
            pending_trigger: None,
            last_step_at: None,
        }
    }

    /// Update only the pending-trigger flag.
    pub const fn pending_trigger(pending: bool) -> Self {
        Self {
            state: None,
            step_counter: None,
            pending_trigger: Some(pending),
            last_step_at: None,
        }
    }

    /// Whether the update changes nothing.
    pub const fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.step_counter.is_none()
            && self.pending_trigger.is_none()
            && self.last_step_at.is_none()
    }

    /// Apply the update to an in-memory record.
    pub fn apply_to(&self, record: &mut SessionRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(counter) = self.step_counter {
            record.step_counter = counter;
        }
        if let Some(pending) = self.pending_trigger {
            record.pending_trigger = pending;
        }
        if let Some(at) = self.last_step_at {
            record.last_step_at = Some(at);
        }
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// The JSON record the worker pushes onto the result queue after a step.
///
/// `current_step` is the worker's completed-step count after the step ran,
/// so the step index of `state_snapshot` is `current_step - 1`. A `null`
/// snapshot means the worker had no step left to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResultRecord {
    /// The snapshot produced by the step.
    #[serde(alias = "step_snapshot")]
    pub state_snapshot: Option<serde_json::Value>,
    /// Completed steps after this one.
    pub current_step: u32,
}

impl StepResultRecord {
    /// Zero-based index of the step this record belongs to.
    pub const fn step_index(&self) -> Option<u32> {
        self.current_step.checked_sub(1)
    }
}

/// Payload of one simulation step as produced by the worker.
///
/// Stored verbatim (as JSON) by the archive; the orchestrator does not
/// interpret it beyond the step index.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StepPayload {
    /// Last action of each participant role (`Red`, `Blue`).
    pub actions: BTreeMap<String, String>,
    /// Observation of each participant role.
    pub observations: BTreeMap<String, serde_json::Value>,
    /// Any further simulator state.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    #[ts(type = "Record<string, unknown>")]
    pub auxiliary: serde_json::Map<String, serde_json::Value>,
}

/// A durably stored step snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct StepSnapshot {
    /// Owning session.
    pub session_id: SessionId,
    /// Zero-based step index.
    pub step: u32,
    /// The worker's snapshot.
    pub data: serde_json::Value,
}

/// Archive summary of one game, as listed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct GameSummary {
    /// Session id.
    pub game_id: SessionId,
    /// Latest persisted step index, if any step was stored.
    pub step: Option<u32>,
    /// Configuration the game ran with.
    pub config: GameConfig,
    /// Whether every budgeted step was persisted.
    pub completed: bool,
}

impl GameSummary {
    /// Build a summary from a configuration and the latest stored step.
    pub fn new(game_id: SessionId, config: GameConfig, latest_step: Option<u32>) -> Self {
        let completed = latest_step
            .and_then(|s| s.checked_add(1))
            .is_some_and(|done| done >= config.steps);
        Self {
            game_id,
            step: latest_step,
            config,
            completed,
        }
    }
}

// ---------------------------------------------------------------------------
// Output relay
// ---------------------------------------------------------------------------

/// One line of worker output, tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct TaggedLine {
    /// Source stream.
    pub stream: OutputStream,
    /// Line text without the trailing newline.
    pub line: String,
}

impl core::fmt::Display for TaggedLine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.stream.prefix(), self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_config_defaults_match_start_request_defaults() {
        let parsed = serde_json::from_str::<GameConfig>("{}").ok();
        assert_eq!(parsed, Some(GameConfig::default()));
        let config = GameConfig::default();
        assert_eq!(config.steps, 10);
        assert_eq!(config.red_agent, RedAgentKind::BLine);
        assert_eq!(config.blue_agent, BlueAgentKind::ReactRemove);
        assert_eq!(config.wrapper, WrapperKind::Simple);
    }

    #[test]
    fn game_config_rejects_unknown_agent() {
        let parsed = serde_json::from_str::<GameConfig>(r#"{"red_agent": "SleepAgent"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn result_record_step_index_is_one_behind_counter() {
        let record = StepResultRecord {
            state_snapshot: Some(serde_json::json!({"a": 1})),
            current_step: 3,
        };
        assert_eq!(record.step_index(), Some(2));

        let empty = StepResultRecord {
            state_snapshot: None,
            current_step: 0,
        };
        assert_eq!(empty.step_index(), None);
    }

    #[test]
    fn result_record_parses_worker_json() {
        let raw = r#"{"state_snapshot": {"actions": {"Red": "Sleep"}}, "current_step": 1}"#;
        let record: Option<StepResultRecord> = serde_json::from_str(raw).ok();
        assert_eq!(record.map(|r| r.current_step), Some(1));
    }

    #[test]
    fn update_only_touches_set_fields() {
        let mut record = SessionRecord::new(
            SessionId::new(),
            GameConfig::default(),
            WorkerHandle {
                pid: 10,
                pgid: 10,
                started_at: 1,
            },
        );
        SessionUpdate::pending_trigger(true).apply_to(&mut record);
        assert!(record.pending_trigger);
        assert_eq!(record.state, SessionState::Created);

        let update = SessionUpdate {
            step_counter: Some(2),
            ..SessionUpdate::default()
        };
        update.apply_to(&mut record);
        assert_eq!(record.step_counter, 2);
        assert!(record.pending_trigger);
        assert!(SessionUpdate::default().is_empty());
    }

    #[test]
    fn summary_completion_uses_step_budget() {
        let config = GameConfig {
            steps: 3,
            ..GameConfig::default()
        };
        let id = SessionId::new();
        assert!(!GameSummary::new(id, config, Some(1)).completed);
        assert!(GameSummary::new(id, config, Some(2)).completed);
        assert!(!GameSummary::new(id, config, None).completed);
    }

    #[test]
    fn tagged_line_display_has_stream_prefix() {
        let line = TaggedLine {
            stream: OutputStream::Stderr,
            line: String::from("boom"),
        };
        assert_eq!(line.to_string(), "STDERR: boom");
    }
}
