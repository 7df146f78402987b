//! Bus channel and key names for a session.
//!
//! Everything here is derived from the session id alone, so no binding needs
//! to be persisted. The names are part of the wire contract with the worker.
//!
//! | Name | Kind | Purpose |
//! |------|------|---------|
//! | `session:{id}:advance` | pub/sub channel | step trigger, payload ignored |
//! | `session:{id}:results` | list | JSON step results, one per step |
//! | `session:{id}:stdout` | pub/sub channel | worker stdout, one line per message |
//! | `session:{id}:stderr` | pub/sub channel | worker stderr, one line per message |
//! | `session:{id}` | hash | registry record |
//! | `sessions:index` | set | ids of all registry records |

use crate::enums::OutputStream;
use crate::ids::SessionId;

/// Key prefix shared by all per-session names.
pub const SESSION_PREFIX: &str = "session";

/// Set holding the id of every session with a registry record.
pub const REGISTRY_INDEX_KEY: &str = "sessions:index";

/// Bus names for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    /// Pub/sub channel the orchestrator publishes step triggers on.
    pub trigger: String,
    /// List the worker pushes step results onto.
    pub results: String,
    /// Pub/sub channel carrying worker stdout lines.
    pub stdout: String,
    /// Pub/sub channel carrying worker stderr lines.
    pub stderr: String,
    /// Hash holding the session's registry record.
    pub registry: String,
}

impl ChannelBinding {
    /// Derive the binding for `session_id`.
    pub fn for_session(session_id: SessionId) -> Self {
        let base = format!("{SESSION_PREFIX}:{session_id}");
        Self {
            trigger: format!("{base}:advance"),
            results: format!("{base}:results"),
            stdout: format!("{base}:stdout"),
            stderr: format!("{base}:stderr"),
            registry: base,
        }
    }

    /// The output channel for one stream.
    pub fn output(&self, stream: OutputStream) -> &str {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }
}

/// Extract the session id from a registry key (`session:{id}`).
///
/// Returns `None` for any other key, including the per-session channel
/// names that share the prefix.
pub fn session_from_registry_key(key: &str) -> Option<SessionId> {
    let rest = key.strip_prefix(SESSION_PREFIX)?.strip_prefix(':')?;
    if rest.contains(':') {
        return None;
    }
    rest.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_is_deterministic() {
        let id = SessionId::new();
        assert_eq!(ChannelBinding::for_session(id), ChannelBinding::for_session(id));
    }

    #[test]
    fn binding_names_follow_wire_contract() {
        let id = SessionId::new();
        let binding = ChannelBinding::for_session(id);
        assert_eq!(binding.trigger, format!("session:{id}:advance"));
        assert_eq!(binding.results, format!("session:{id}:results"));
        assert_eq!(binding.output(OutputStream::Stdout), format!("session:{id}:stdout"));
        assert_eq!(binding.output(OutputStream::Stderr), format!("session:{id}:stderr"));
        assert_eq!(binding.registry, format!("session:{id}"));
    }

    #[test]
    fn registry_key_parsing_ignores_channels() {
        let id = SessionId::new();
        let binding = ChannelBinding::for_session(id);
        assert_eq!(session_from_registry_key(&binding.registry), Some(id));
        assert_eq!(session_from_registry_key(&binding.results), None);
        assert_eq!(session_from_registry_key("game:abc"), None);
        assert_eq!(session_from_registry_key("session:not-a-uuid"), None);
    }
}
