//! Failure detection of the active master.
//!
//! Every `TM_WATCHDOG` the leader compares each member's last network
//! heartbeat and its disk slot timestamp against `TM_SLAVE`. Only a member
//! stale on both channels is recovered; a single stale channel is logged.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use cxm_proto::cluster::{MemberStatus, Mode, Role};
use cxm_proto::defaults::TM_SLAVE;
use cxm_proto::error::{CxmError, CxmResult};

use super::{Coordinator, Effect};

/// Outcome of one failure detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Every other member is stale on a channel while we are not: we are
    /// the one cut off.
    SelfIsolated,
    /// Members stale on both channels.
    Failed(BTreeSet<String>),
}

/// Members stale on each channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedSets {
    pub net: BTreeSet<String>,
    pub disk: BTreeSet<String>,
}

/// Classify members by channel. Net members and disk slots must match.
pub fn failed_sets(
    now: i64,
    members: &MemberStatus,
    disk: &BTreeMap<String, i64>,
) -> CxmResult<FailedSets> {
    let limit = TM_SLAVE.as_secs() as i64;

    if !members.keys().eq(disk.keys()) {
        return Err(CxmError::Inconsistent(format!(
            "members {:?} do not match disk slots {:?}",
            members.keys().collect::<Vec<_>>(),
            disk.keys().collect::<Vec<_>>()
        )));
    }

    let mut sets = FailedSets::default();
    for (name, member) in members {
        if now - member.last_net_timestamp > limit {
            sets.net.insert(name.clone());
        }
    }
    for (name, ts) in disk {
        let offset = members.get(name).map_or(0, |m| m.clock_offset);
        if now - ts - offset > limit {
            sets.disk.insert(name.clone());
        }
    }
    Ok(sets)
}

/// Run one failure detection pass on behalf of `local`.
pub fn detect_failures(
    now: i64,
    local: &str,
    members: &MemberStatus,
    disk: &BTreeMap<String, i64>,
) -> CxmResult<Verdict> {
    let sets = failed_sets(now, members, disk)?;
    let total = members.len();

    if total > 0 && (sets.net.len() == total || sets.disk.len() == total) {
        return Err(CxmError::AllHeartbeatsLost);
    }

    // With two members, either one may be the isolated one.
    if total > 2 {
        let isolated =
            |set: &BTreeSet<String>| !set.contains(local) && set.len() == total - 1;
        if isolated(&sets.net) || isolated(&sets.disk) {
            return Ok(Verdict::SelfIsolated);
        }
    }

    let failed: BTreeSet<String> = sets.net.intersection(&sets.disk).cloned().collect();
    if failed.contains(local) {
        return Err(CxmError::Inconsistent(format!(
            "heartbeats of {} itself are stale",
            local
        )));
    }

    for name in sets.net.symmetric_difference(&sets.disk) {
        let channel = if sets.net.contains(name) { "network" } else { "disk" };
        warn!("coordinator: {} lost its {} heartbeat only", name, channel);
    }

    if failed.is_empty() {
        Ok(Verdict::Healthy)
    } else {
        Ok(Verdict::Failed(failed))
    }
}

impl Coordinator {
    pub(super) fn on_disk_scanned(&mut self, now: i64, result: CxmResult<BTreeMap<String, i64>>) {
        // Slots erased after this scan was issued may still be in it.
        self.scans_done += 1;
        let done = self.scans_done;
        let erased: Vec<String> = self
            .erasing
            .iter()
            .filter(|(_, issued)| **issued >= done)
            .map(|(name, _)| name.clone())
            .collect();
        self.erasing.retain(|_, issued| *issued > done);

        if self.role != Role::Active || self.mode == Mode::Panic {
            return;
        }
        let disk = match result {
            Ok(mut disk) => {
                for name in erased {
                    if !self.members.contains_key(&name) {
                        disk.remove(&name);
                    }
                }
                disk
            }
            Err(e) => {
                self.engage_panic(&format!("cannot read disk heartbeats: {}", e));
                return;
            }
        };

        match detect_failures(now, self.name(), &self.members, &disk) {
            Err(e) => self.engage_panic(&e.to_string()),
            Ok(Verdict::Healthy) => {}
            Ok(Verdict::SelfIsolated) => self.demote(),
            Ok(Verdict::Failed(nodes)) => {
                for node in nodes {
                    self.start_recovery(node);
                }
            }
        }
    }

    fn start_recovery(&mut self, node: String) {
        if !self.recovering.insert(node.clone()) {
            return;
        }
        warn!("coordinator: node {} failed, starting recovery", node);
        if self.mode == Mode::Normal {
            self.set_mode(Mode::Recovery);
        }

        let vms = self
            .members
            .get(&node)
            .map(|m| m.running_vms.iter().cloned().collect())
            .unwrap_or_default();
        let targets = self
            .members
            .keys()
            .filter(|name| !self.recovering.contains(*name))
            .cloned()
            .collect();
        self.emit(Effect::Recover {
            node,
            vms,
            targets,
        });
    }

    pub(super) fn on_recovery_done(&mut self, node: String, result: CxmResult<()>) {
        self.recovering.remove(&node);
        if self.role != Role::Active {
            warn!("recovery: {} finished after losing the master role", node);
            return;
        }

        match result {
            Ok(()) => {
                info!("recovery: node {} recovered, removing it from the cluster", node);
                self.members.remove(&node);
                self.erase_slot(node);
            }
            Err(e) => {
                self.engage_panic(&format!("recovery of {} failed: {}", node, e));
            }
        }

        if self.recovering.is_empty() && self.mode == Mode::Recovery {
            self.set_mode(Mode::Normal);
        }
    }
}
