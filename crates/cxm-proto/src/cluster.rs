//! Cluster data model shared by the daemon and the operator tool.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of the local node in the election protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Started, no cluster joined yet.
    Alone,
    /// Registration with a known leader in progress.
    Joining,
    /// Follower of an active leader.
    Passive,
    /// Holder of the leader duties.
    Active,
    /// Election in progress.
    Voting,
    /// Shutting down, no longer takes part in elections.
    Leaving,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Alone => write!(f, "alone"),
            Role::Joining => write!(f, "joining"),
            Role::Passive => write!(f, "passive"),
            Role::Active => write!(f, "active"),
            Role::Voting => write!(f, "voting"),
            Role::Leaving => write!(f, "leaving"),
        }
    }
}

/// Cluster-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Normal,
    /// At least one failed member is being recovered.
    Recovery,
    /// Liveness data is contradictory: mutating operations are refused.
    Panic,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::Recovery => write!(f, "recovery"),
            Mode::Panic => write!(f, "panic"),
        }
    }
}

/// One node admitted to the cluster, as seen by the active leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Resolved and validated hostname.
    pub name: String,
    /// Leader clock when the last follower heartbeat was received.
    pub last_net_timestamp: i64,
    /// Leader clock minus follower clock, used to normalize disk timestamps.
    pub clock_offset: i64,
    /// VMs reported running on this node.
    pub running_vms: BTreeSet<String>,
}

impl ClusterMember {
    pub fn new(name: impl Into<String>, now: i64) -> Self {
        Self {
            name: name.into(),
            last_net_timestamp: now,
            clock_offset: 0,
            running_vms: BTreeSet::new(),
        }
    }
}

/// Per-member liveness map, keyed by member name.
pub type MemberStatus = BTreeMap<String, ClusterMember>;

/// Summary returned by the `getState` operator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    pub role: Role,
    pub mode: Mode,
    pub leader: Option<String>,
    /// Unix time of the last completed tally, if any.
    pub last_election_at: Option<i64>,
}

/// Internal snapshot returned by the `getDump` operator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorDump {
    pub node: String,
    pub cluster: String,
    pub state: StateInfo,
    pub members: MemberStatus,
    pub last_leader_seen_at: i64,
    pub current_election: Option<u64>,
    pub ballots: BTreeMap<u64, String>,
    pub recovering: BTreeSet<String>,
}

/// A single live migration of a load-balancing plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub vm: String,
    pub from: String,
    pub to: String,
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.vm, self.from, self.to)
    }
}
