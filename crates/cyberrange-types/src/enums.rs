//! Enumeration types for the Cyberrange orchestrator.
//!
//! Agent and wrapper selectors are closed enums: the string forms are the
//! ones the worker understands on its command line, and anything else is
//! rejected when a start request is parsed rather than when the worker
//! first tries to build the agent.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Error returned when a selector string does not name a known kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownKind {
    /// Which selector was being parsed (`red agent`, `wrapper`, ...).
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Generates `as_str`, [`Display`](fmt::Display) and [`FromStr`] for a
/// selector enum from its wire strings.
macro_rules! wire_strings {
    ($name:ident, $label:literal, { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            /// Every known variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The wire string passed to the worker.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownKind;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(Self::$variant),)+
                    other => Err(UnknownKind {
                        kind: $label,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Agent and wrapper selectors
// ---------------------------------------------------------------------------

/// Attacker (red team) agent driving the scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum RedAgentKind {
    /// Follows a fixed line of attack straight to the operational server.
    #[default]
    #[serde(rename = "B_lineAgent")]
    BLine,
    /// Wanders the network, exploiting hosts as it discovers them.
    #[serde(rename = "RedMeanderAgent")]
    Meander,
    /// Picks a random valid action each step.
    #[serde(rename = "RandomAgent")]
    Random,
}

wire_strings!(RedAgentKind, "red agent", {
    BLine => "B_lineAgent",
    Meander => "RedMeanderAgent",
    Random => "RandomAgent",
});

/// Defender (blue team) agent responding to the attack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum BlueAgentKind {
    /// Removes malicious processes from hosts it sees compromised.
    #[default]
    #[serde(rename = "BlueReactRemoveAgent")]
    ReactRemove,
    /// Restores compromised hosts from a clean image.
    #[serde(rename = "BlueReactRestoreAgent")]
    ReactRestore,
    /// Cardiff University submission.
    #[serde(rename = "CardiffUni")]
    CardiffUni,
    /// CASTLE gym submission.
    #[serde(rename = "CASTLEgym")]
    CastleGym,
}

wire_strings!(BlueAgentKind, "blue agent", {
    ReactRemove => "BlueReactRemoveAgent",
    ReactRestore => "BlueReactRestoreAgent",
    CardiffUni => "CardiffUni",
    CastleGym => "CASTLEgym",
});

/// How the simulation environment is exposed to the blue agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum WrapperKind {
    /// Raw environment, no observation wrapper.
    #[default]
    #[serde(rename = "simple")]
    Simple,
    /// Challenge wrapper around the blue agent's view.
    #[serde(rename = "wrap")]
    Challenge,
}

wire_strings!(WrapperKind, "wrapper", {
    Simple => "simple",
    Challenge => "wrap",
});

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
///
/// Transitions only move forward:
/// `Created -> Running -> (Completed | Terminated | Expired)`.
/// A session that never reached `Running` may still be terminated or expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SessionState {
    /// Registry entry written, worker spawned, output not yet attached.
    Created,
    /// Worker attached and accepting step triggers.
    Running,
    /// The configured step budget was exhausted.
    Completed,
    /// The session was ended, or its worker was found dead on restart.
    Terminated,
    /// The worker disappeared while the session was still live.
    Expired,
}

impl SessionState {
    /// Whether no further transition is possible.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Expired)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running | Self::Terminated | Self::Expired)
                | (Self::Running, Self::Completed | Self::Terminated | Self::Expired)
        )
    }

    /// The string stored in the registry hash.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "terminated" => Ok(Self::Terminated),
            "expired" => Ok(Self::Expired),
            other => Err(UnknownKind {
                kind: "session state",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker output streams
// ---------------------------------------------------------------------------

/// One of the worker's two output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl OutputStream {
    /// Both streams, stdout first.
    pub const BOTH: [Self; 2] = [Self::Stdout, Self::Stderr];

    /// Channel suffix (`stdout` / `stderr`).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Upper-case prefix used when lines are shown to a viewer.
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
