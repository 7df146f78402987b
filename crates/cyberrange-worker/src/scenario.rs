//! Scripted stand-in for the network defence simulation.
//!
//! The network is the three-subnet enterprise of the challenge scenario:
//! user workstations, enterprise servers and the operational subnet whose
//! server is the attacker's final target. Each step the red agent acts,
//! then the blue agent reacts to what it can see, and the payload records
//! both actions plus each side's observation.
//!
//! Behaviour is driven by the agent kinds in the [`GameConfig`] and a
//! seeded RNG, so a given seed replays the same game.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use cyberrange_core::WorkerError;
use cyberrange_core::worker::Simulation;
use cyberrange_types::{BlueAgentKind, GameConfig, RedAgentKind, StepPayload, WrapperKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};

/// Hosts in scan order.
pub const HOSTS: [&str; 13] = [
    "Defender",
    "Enterprise0",
    "Enterprise1",
    "Enterprise2",
    "Op_Host0",
    "Op_Host1",
    "Op_Host2",
    "Op_Server0",
    "User0",
    "User1",
    "User2",
    "User3",
    "User4",
];

/// The host whose loss ends the defender's day.
const CRITICAL_HOST: &str = "Op_Server0";

/// Where every red agent starts.
const FOOTHOLD: &str = "User0";

/// Chance that an exploit lands.
const EXPLOIT_SUCCESS: f64 = 0.8;

/// Chance that `Remove` evicts a user-level foothold.
const REMOVE_SUCCESS: f64 = 0.6;

/// The fixed attack path of the `B_lineAgent`.
const B_LINE_PLAN: [(&str, &str); 12] = [
    ("DiscoverRemoteSystems", "User1"),
    ("DiscoverNetworkServices", "User1"),
    ("ExploitRemoteService", "User1"),
    ("PrivilegeEscalate", "User1"),
    ("DiscoverNetworkServices", "Enterprise1"),
    ("ExploitRemoteService", "Enterprise1"),
    ("PrivilegeEscalate", "Enterprise1"),
    ("DiscoverRemoteSystems", "Enterprise1"),
    ("DiscoverNetworkServices", "Op_Server0"),
    ("ExploitRemoteService", "Op_Server0"),
    ("PrivilegeEscalate", "Op_Server0"),
    ("Impact", "Op_Server0"),
];

const RED_ACTIONS: [&str; 5] = [
    "DiscoverRemoteSystems",
    "DiscoverNetworkServices",
    "ExploitRemoteService",
    "PrivilegeEscalate",
    "Impact",
];

/// Red's hold on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Access {
    User,
    Privileged,
}

/// What the red agent did this step.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RedMove {
    action: &'static str,
    host: &'static str,
    success: bool,
}

/// A [`Simulation`] that plays out a game from scripted agent policies.
#[derive(Debug)]
pub struct ScriptedSimulation {
    config: GameConfig,
    rng: StdRng,
    access: BTreeMap<&'static str, Access>,
    plan_cursor: usize,
    impacted: bool,
}

impl ScriptedSimulation {
    /// A fresh game with red holding its initial foothold.
    pub fn new(config: GameConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            access: BTreeMap::from([(FOOTHOLD, Access::Privileged)]),
            plan_cursor: 0,
            impacted: false,
        }
    }

    fn exploit_lands(&mut self) -> bool {
        self.rng.random_bool(EXPLOIT_SUCCESS)
    }

    fn pick<'a>(&mut self, hosts: &[&'a str]) -> Option<&'a str> {
        if hosts.is_empty() {
            return None;
        }
        hosts.get(self.rng.random_range(0..hosts.len())).copied()
    }

    // ---------------------------------------------------------------------
    // Red
    // ---------------------------------------------------------------------

    fn red_move(&mut self) -> RedMove {
        let (action, host) = match self.config.red_agent {
            RedAgentKind::BLine => self.b_line_choice(),
            RedAgentKind::Meander => self.meander_choice(),
            RedAgentKind::Random => {
                let action = RED_ACTIONS
                    .get(self.rng.random_range(0..RED_ACTIONS.len()))
                    .copied()
                    .unwrap_or("DiscoverRemoteSystems");
                let host = self.pick(&HOSTS).unwrap_or(FOOTHOLD);
                (action, host)
            }
        };
        let success = self.resolve_red(action, host);
        RedMove { action, host, success }
    }

    fn b_line_choice(&mut self) -> (&'static str, &'static str) {
        let (action, host) = B_LINE_PLAN
            .get(self.plan_cursor)
            .copied()
            .unwrap_or(("Impact", CRITICAL_HOST));
        // An evicted foothold sends the plan back to its exploit.
        if action == "PrivilegeEscalate" && !self.access.contains_key(host) {
            self.plan_cursor = self.plan_cursor.saturating_sub(1);
            return ("ExploitRemoteService", host);
        }
        (action, host)
    }

    fn meander_choice(&mut self) -> (&'static str, &'static str) {
        let unescalated: Vec<&'static str> = self
            .access
            .iter()
            .filter(|(_, access)| **access == Access::User)
            .map(|(host, _)| *host)
            .collect();
        if let Some(host) = self.pick(&unescalated) {
            return ("PrivilegeEscalate", host);
        }
        let fresh: Vec<&'static str> = HOSTS
            .iter()
            .copied()
            .filter(|host| !self.access.contains_key(host))
            .collect();
        match self.pick(&fresh) {
            Some(host) => ("ExploitRemoteService", host),
            None => ("Impact", CRITICAL_HOST),
        }
    }

    fn resolve_red(&mut self, action: &'static str, host: &'static str) -> bool {
        let success = match action {
            "ExploitRemoteService" => {
                let landed = self.exploit_lands();
                if landed {
                    self.access.entry(host).or_insert(Access::User);
                }
                landed
            }
            "PrivilegeEscalate" => match self.access.get_mut(host) {
                Some(access) => {
                    *access = Access::Privileged;
                    true
                }
                None => false,
            },
            "Impact" => {
                let landed = self.access.get(host) == Some(&Access::Privileged);
                self.impacted |= landed && host == CRITICAL_HOST;
                landed
            }
            // Discovery always succeeds.
            _ => true,
        };
        if self.config.red_agent == RedAgentKind::BLine && (success || action.starts_with("Discover")) {
            self.plan_cursor = self.plan_cursor.saturating_add(1);
        }
        success
    }

    // ---------------------------------------------------------------------
    // Blue
    // ---------------------------------------------------------------------

    fn blue_move(&mut self, red: &RedMove) -> String {
        let suspicious = red.success && matches!(red.action, "ExploitRemoteService" | "PrivilegeEscalate");
        let target = suspicious.then_some(red.host);
        let critical_lost = self.access.contains_key(CRITICAL_HOST);

        let (action, host) = match (self.config.blue_agent, target) {
            (BlueAgentKind::ReactRemove, Some(host)) => ("Remove", host),
            (BlueAgentKind::ReactRestore, Some(host)) => ("Restore", host),
            (BlueAgentKind::CardiffUni, _) if critical_lost => ("Restore", CRITICAL_HOST),
            (BlueAgentKind::CardiffUni, Some(host)) => ("Remove", host),
            (BlueAgentKind::CardiffUni, None) => ("DecoyApache", "Enterprise0"),
            (BlueAgentKind::CastleGym, Some(host)) => {
                if self.rng.random_bool(0.5) {
                    ("Analyse", host)
                } else {
                    ("Restore", host)
                }
            }
            (BlueAgentKind::CastleGym, None) if critical_lost => ("Restore", CRITICAL_HOST),
            _ => return String::from("Monitor"),
        };
        self.resolve_blue(action, host);
        format!("{action} {host}")
    }

    fn resolve_blue(&mut self, action: &str, host: &'static str) {
        match action {
            "Restore" if host != FOOTHOLD => {
                self.access.remove(host);
            }
            "Remove" => {
                if self.access.get(host) == Some(&Access::User) && self.rng.random_bool(REMOVE_SUCCESS) {
                    self.access.remove(host);
                }
            }
            _ => {}
        }
    }

    // ---------------------------------------------------------------------
    // Observations
    // ---------------------------------------------------------------------

    fn blue_observation(&self, red: &RedMove) -> Value {
        let activity: BTreeSet<&str> = if red.action == "Impact" || red.action.starts_with("Discover") {
            BTreeSet::from([red.host])
        } else {
            BTreeSet::new()
        };
        match self.config.wrapper {
            WrapperKind::Simple => {
                let hosts: serde_json::Map<String, Value> = HOSTS
                    .iter()
                    .map(|host| {
                        let seen = if activity.contains(host) { "Scan" } else { "None" };
                        let compromised = match self.access.get(host) {
                            Some(Access::Privileged) => "Privileged",
                            Some(Access::User) => "User",
                            None => "No",
                        };
                        ((*host).to_owned(), json!({ "activity": seen, "compromised": compromised }))
                    })
                    .collect();
                Value::Object(hosts)
            }
            // Four bits per host: activity scan, activity exploit,
            // user access, privileged access.
            WrapperKind::Challenge => {
                let bits: Vec<u8> = HOSTS
                    .iter()
                    .flat_map(|host| {
                        let access = self.access.get(host);
                        [
                            u8::from(activity.contains(host)),
                            u8::from(red.host == *host && red.action == "ExploitRemoteService"),
                            u8::from(access == Some(&Access::User)),
                            u8::from(access == Some(&Access::Privileged)),
                        ]
                    })
                    .collect();
                json!(bits)
            }
        }
    }

    /// Defender reward: the negated cost of red's current access.
    fn blue_reward(&self) -> f64 {
        let cost: f64 = self
            .access
            .iter()
            .map(|(host, access)| match (*host, access) {
                (CRITICAL_HOST, Access::Privileged) => 1.0,
                (_, Access::Privileged) => 0.1,
                _ => 0.0,
            })
            .sum();
        if self.impacted { -(cost + 10.0) } else { -cost }
    }

    /// Hosts red currently holds, in scan order.
    pub fn compromised_hosts(&self) -> Vec<&'static str> {
        HOSTS.iter().copied().filter(|host| self.access.contains_key(host)).collect()
    }
}

#[async_trait]
impl Simulation for ScriptedSimulation {
    async fn step(&mut self, step: u32) -> Result<Value, WorkerError> {
        let red = self.red_move();
        let blue = self.blue_move(&red);

        let mut payload = StepPayload::default();
        payload.actions.insert(String::from("Red"), format!("{} {}", red.action, red.host));
        payload.actions.insert(String::from("Blue"), blue);
        payload.observations.insert(
            String::from("Red"),
            json!({ "success": red.success, "host": red.host }),
        );
        payload
            .observations
            .insert(String::from("Blue"), self.blue_observation(&red));
        payload.auxiliary.insert(String::from("step"), json!(step));
        payload.auxiliary.insert(String::from("reward"), json!(self.blue_reward()));
        payload
            .auxiliary
            .insert(String::from("compromised"), json!(self.compromised_hosts()));

        Ok(serde_json::to_value(&payload)?)
    }
}
