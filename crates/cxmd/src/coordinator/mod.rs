//! Cluster coordinator: membership, election and failure detection.
//!
//! The coordinator is a sans-IO state machine. The daemon feeds it one
//! [`Input`] at a time (heartbeat messages, timer ticks, I/O completions,
//! operator commands) together with the current unix time, and executes the
//! [`Effect`]s it returns: sending datagrams, arming timers, touching the
//! heartbeat disk, calling the leader. Every role or mode transition happens
//! inside [`Coordinator::step`], so no locking is needed around the state.
//!
//! ```text
//! Alone -> Joining -> Passive <-> Voting -> Active | Passive
//!   any -> Leaving
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use cxm_core::loadbalancer::Placement;
use cxm_proto::cluster::{ClusterMember, CoordinatorDump, MemberStatus, Mode, Role, StateInfo};
use cxm_proto::defaults::TM_MASTER;
use cxm_proto::error::{CxmError, CxmResult};
use cxm_proto::message::{MasterHeartbeat, Message, SlaveHeartbeat};
use cxm_proto::rpc::{LocalRequest, RemoteRequest, Response};

use crate::config::ClusterConfig;

pub mod election;
pub mod watchdog;

#[cfg(test)]
mod tests;

/// Reply channel of a pending RPC.
pub type Reply = oneshot::Sender<Response>;

/// Identity of a timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    Join,
    Tally,
    LeaderHeartbeat,
    FollowerHeartbeat,
    LeaderWatchdog,
    FollowerWatchdog,
}

/// A timer, as armed and as delivered back when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// One-shot, end of the initial listening period.
    Join,
    /// One-shot, end of the vote collection window.
    Tally { election: u64 },
    LeaderHeartbeat,
    FollowerHeartbeat,
    LeaderWatchdog,
    FollowerWatchdog,
}

impl Timer {
    pub fn kind(&self) -> TimerKind {
        match self {
            Timer::Join => TimerKind::Join,
            Timer::Tally { .. } => TimerKind::Tally,
            Timer::LeaderHeartbeat => TimerKind::LeaderHeartbeat,
            Timer::FollowerHeartbeat => TimerKind::FollowerHeartbeat,
            Timer::LeaderWatchdog => TimerKind::LeaderWatchdog,
            Timer::FollowerWatchdog => TimerKind::FollowerWatchdog,
        }
    }
}

/// Destination of a heartbeat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dest {
    Broadcast,
    Node(String),
}

/// Request arriving from one of the RPC services.
#[derive(Debug)]
pub enum Command {
    Local(LocalRequest),
    /// Name arguments have already been resolved by the RPC layer.
    Remote(RemoteRequest),
}

/// Everything that can happen to the coordinator.
#[derive(Debug)]
pub enum Input {
    /// Daemon started: listen for a leader, then join or bootstrap.
    Start,
    Message(Message),
    Timer(Timer),
    /// VMs currently running on this node.
    LocalVms(Vec<String>),
    /// Completion of [`Effect::CheckDiskInUse`].
    DiskInUse(bool),
    /// Completion of [`Effect::MakeSlot`].
    SlotMade {
        name: String,
        result: CxmResult<()>,
        reply: Option<Reply>,
    },
    /// Completion of [`Effect::ScanDisk`].
    DiskScanned(CxmResult<BTreeMap<String, i64>>),
    /// [`Effect::WriteDiskTimestamp`] failed.
    DiskWriteFailed(CxmError),
    /// A heartbeat could not be sent, retries included.
    SendFailed(CxmError),
    /// Completion of [`Effect::Register`].
    Joined(CxmResult<()>),
    /// Completion of [`Effect::Recover`].
    RecoveryDone { node: String, result: CxmResult<()> },
    Command { command: Command, reply: Reply },
}

/// Work requested from the runtime.
#[derive(Debug)]
pub enum Effect {
    Send { msg: Message, dest: Dest },
    StartTimer(Timer),
    StopTimer(TimerKind),
    CheckDiskInUse,
    MakeSlot { name: String, reply: Option<Reply> },
    EraseSlot { name: String },
    WriteDiskTimestamp { timestamp: i64 },
    ScanDisk,
    /// Register this node with the given leader.
    Register { leader: String },
    /// Relay an operator panic request to the leader.
    ForwardPanic { leader: String, reply: Reply },
    /// Ask the leader to enter panic mode on our behalf.
    EscalatePanic { leader: String },
    /// Evacuate the VMs of a failed node onto `targets`.
    Recover {
        node: String,
        vms: Vec<String>,
        targets: Vec<String>,
    },
    Balance {
        placement: Placement,
        dry_run: bool,
        reply: Reply,
    },
    /// Unregister from `leader` if any, then stop the daemon.
    Leave { leader: Option<String> },
    Shutdown(Option<CxmError>),
}

/// The master state machine of one node.
pub struct Coordinator {
    config: Arc<ClusterConfig>,
    /// Low bits of every ballot, distinct per node.
    ip_suffix: u64,
    rng: StdRng,

    role: Role,
    mode: Mode,
    leader: Option<String>,
    /// Authoritative on the active leader, mirrored on followers.
    members: MemberStatus,
    last_leader_seen_at: i64,

    /// Latest election this node took part in.
    current_election: Option<u64>,
    ballots: BTreeMap<u64, String>,
    last_tally_at: Option<i64>,
    /// The current leader has shown panic mode since we last engaged it.
    leader_saw_panic: bool,

    recovering: BTreeSet<String>,
    /// Disk scans requested and completed; the disk worker runs in order.
    scans_issued: u64,
    scans_done: u64,
    /// Slots being erased, with the number of scans issued before the erase.
    erasing: BTreeMap<String, u64>,
    local_vms: Vec<String>,

    effects: Vec<Effect>,
}

impl Coordinator {
    pub fn new(config: Arc<ClusterConfig>, ip_suffix: u64, rng: StdRng) -> Self {
        Self {
            config,
            ip_suffix,
            rng,
            role: Role::Alone,
            mode: Mode::Normal,
            leader: None,
            members: MemberStatus::new(),
            last_leader_seen_at: 0,
            current_election: None,
            ballots: BTreeMap::new(),
            last_tally_at: None,
            leader_saw_panic: false,
            recovering: BTreeSet::new(),
            scans_issued: 0,
            scans_done: 0,
            erasing: BTreeMap::new(),
            local_vms: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn members(&self) -> &MemberStatus {
        &self.members
    }

    pub fn state_info(&self) -> StateInfo {
        StateInfo {
            role: self.role,
            mode: self.mode,
            leader: self.leader.clone(),
            last_election_at: self.last_tally_at,
        }
    }

    pub fn dump(&self) -> CoordinatorDump {
        CoordinatorDump {
            node: self.name().to_string(),
            cluster: self.config.cluster.clone(),
            state: self.state_info(),
            members: self.members.clone(),
            last_leader_seen_at: self.last_leader_seen_at,
            current_election: self.current_election,
            ballots: self.ballots.clone(),
            recovering: self.recovering.clone(),
        }
    }

    /// Process one input at time `now` (unix seconds).
    pub fn step(&mut self, now: i64, input: Input) -> Vec<Effect> {
        match input {
            Input::Start => self.start(),
            Input::Message(msg) => self.dispatch_message(now, msg),
            Input::Timer(timer) => self.on_timer(now, timer),
            Input::LocalVms(vms) => self.local_vms = vms,
            Input::DiskInUse(in_use) => self.on_disk_in_use(in_use),
            Input::SlotMade {
                name,
                result,
                reply,
            } => self.on_slot_made(now, name, result, reply),
            Input::DiskScanned(result) => self.on_disk_scanned(now, result),
            Input::DiskWriteFailed(e) => self.on_disk_write_failed(e),
            Input::SendFailed(e) => self.on_send_failed(e),
            Input::Joined(result) => self.on_joined(now, result),
            Input::RecoveryDone { node, result } => self.on_recovery_done(node, result),
            Input::Command { command, reply } => match command {
                Command::Local(req) => self.local_request(req, reply),
                Command::Remote(req) => self.remote_request(req, reply),
            },
        }
        std::mem::take(&mut self.effects)
    }

    fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn message_cluster(&self) -> String {
        self.config.cluster.clone()
    }

    // -------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            info!("coordinator: role {} -> {}", self.role, role);
            self.role = role;
        }
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode == mode {
            return;
        }
        let previous = self.mode;
        if mode == Mode::Panic {
            error!("coordinator: mode {} -> {}", previous, mode);
        } else {
            info!("coordinator: mode {} -> {}", previous, mode);
        }
        self.mode = mode;

        if mode == Mode::Panic {
            self.stop_watchdogs();
        } else if previous == Mode::Panic {
            self.start_watchdogs();
        }
    }

    /// Enter panic mode. Only an operator recovery leaves it.
    ///
    /// The mode of a follower mirrors its leader, so a follower that panics
    /// on its own escalates to the leader.
    fn engage_panic(&mut self, reason: &str) {
        if self.mode == Mode::Panic {
            return;
        }
        error!("coordinator: PANIC: {}", reason);
        self.leader_saw_panic = false;
        self.set_mode(Mode::Panic);
        if self.role == Role::Passive {
            self.escalate_panic();
        }
    }

    fn escalate_panic(&mut self) {
        if let Some(leader) = self.leader.clone().filter(|l| l != self.name()) {
            info!("coordinator: escalating panic to {}", leader);
            self.emit(Effect::EscalatePanic { leader });
        }
    }

    fn start_watchdogs(&mut self) {
        if self.mode == Mode::Panic {
            return;
        }
        match self.role {
            Role::Active => {
                self.emit(Effect::StartTimer(Timer::LeaderWatchdog));
                self.emit(Effect::StartTimer(Timer::FollowerWatchdog));
            }
            Role::Passive if self.leader.is_some() => {
                self.emit(Effect::StartTimer(Timer::FollowerWatchdog));
            }
            _ => {}
        }
    }

    fn stop_watchdogs(&mut self) {
        self.emit(Effect::StopTimer(TimerKind::LeaderWatchdog));
        self.emit(Effect::StopTimer(TimerKind::FollowerWatchdog));
    }

    fn stop_all_timers(&mut self) {
        for kind in [
            TimerKind::Join,
            TimerKind::Tally,
            TimerKind::LeaderHeartbeat,
            TimerKind::FollowerHeartbeat,
            TimerKind::LeaderWatchdog,
            TimerKind::FollowerWatchdog,
        ] {
            self.emit(Effect::StopTimer(kind));
        }
    }

    fn scan_disk(&mut self) {
        self.scans_issued += 1;
        self.emit(Effect::ScanDisk);
    }

    /// Scans already issued still return the slot; see `on_disk_scanned`.
    fn erase_slot(&mut self, name: String) {
        self.erasing.insert(name.clone(), self.scans_issued);
        self.emit(Effect::EraseSlot { name });
    }

    /// Take the leader duties.
    fn become_active(&mut self, now: i64) {
        self.set_role(Role::Active);
        self.leader = Some(self.name().to_string());
        self.last_leader_seen_at = now;

        // Recoveries started by a previous leader are not ours to finish.
        self.recovering.clear();
        if self.mode == Mode::Recovery {
            self.set_mode(Mode::Normal);
        }

        // The mirrored status is only as fresh as the last leader heartbeat:
        // give every member a full grace period.
        for member in self.members.values_mut() {
            member.last_net_timestamp = now;
        }
        let name = self.name().to_string();
        self.members
            .entry(name.clone())
            .or_insert_with(|| ClusterMember::new(name, now));

        self.emit(Effect::StartTimer(Timer::LeaderHeartbeat));
        self.emit(Effect::StartTimer(Timer::FollowerHeartbeat));
        self.start_watchdogs();
    }

    /// Follow `leader`.
    fn become_passive(&mut self, now: i64, leader: String) {
        self.set_role(Role::Passive);
        self.leader = Some(leader);
        self.last_leader_seen_at = now;
        self.leader_saw_panic = false;

        self.emit(Effect::StartTimer(Timer::FollowerHeartbeat));
        self.start_watchdogs();
    }

    /// Give up the leader duties after losing every other member.
    fn demote(&mut self) {
        warn!("coordinator: every other member looks dead from here, stepping down");
        self.set_role(Role::Passive);
        self.leader = None;
        self.emit(Effect::StopTimer(TimerKind::LeaderHeartbeat));
        self.emit(Effect::StopTimer(TimerKind::LeaderWatchdog));
        self.emit(Effect::StopTimer(TimerKind::FollowerWatchdog));
    }

    // -------------------------------------------------------------------
    // Join
    // -------------------------------------------------------------------

    fn start(&mut self) {
        if self.role != Role::Alone {
            warn!("coordinator: already started");
            return;
        }
        info!(
            "coordinator: looking for the active master of cluster {}",
            self.config.cluster
        );
        self.emit(Effect::StartTimer(Timer::Join));
    }

    fn on_join_timer(&mut self) {
        if self.role != Role::Alone {
            return;
        }

        if let Some(leader) = self.leader.clone() {
            info!("coordinator: joining cluster {} through {}", self.config.cluster, leader);
            self.set_role(Role::Joining);
            self.emit(Effect::Register { leader });
            return;
        }

        if !self.config.is_allowed(self.name()) {
            error!(
                "coordinator: {} is not allowed in cluster {}",
                self.name(),
                self.config.cluster
            );
            let reason = format!("{} is not in the allow-list", self.name());
            self.emit(Effect::Shutdown(Some(CxmError::NodeRefused(reason))));
            return;
        }

        info!("coordinator: no active master found, creating cluster {}", self.config.cluster);
        self.emit(Effect::CheckDiskInUse);
    }

    fn on_disk_in_use(&mut self, in_use: bool) {
        if self.role != Role::Alone {
            return;
        }
        if in_use {
            error!("coordinator: heartbeat disk shows live slots, refusing to create a cluster");
            self.emit(Effect::Shutdown(Some(CxmError::ClusterCreationRefused)));
            return;
        }
        let name = self.name().to_string();
        self.emit(Effect::MakeSlot { name, reply: None });
    }

    fn on_slot_made(&mut self, now: i64, name: String, result: CxmResult<()>, reply: Option<Reply>) {
        let Some(reply) = reply else {
            // Our own slot, while bootstrapping.
            if self.role != Role::Alone {
                return;
            }
            match result {
                Ok(()) => {
                    info!("coordinator: cluster {} created", self.config.cluster);
                    self.members.insert(name.clone(), ClusterMember::new(name, now));
                    self.become_active(now);
                }
                Err(e) => {
                    error!("coordinator: cannot reserve a disk slot: {}", e);
                    self.emit(Effect::Shutdown(Some(e)));
                }
            }
            return;
        };

        let response = match result {
            Ok(()) if self.role != Role::Active => {
                self.erase_slot(name);
                Response::Error(CxmError::NotMaster)
            }
            Ok(()) if self.mode == Mode::Panic => {
                self.erase_slot(name);
                Response::Error(CxmError::PanicEngaged)
            }
            Ok(()) => {
                info!("coordinator: node {} has joined the cluster", name);
                self.members.insert(name.clone(), ClusterMember::new(name, now));
                Response::Ok
            }
            Err(e) => {
                warn!("coordinator: cannot reserve a disk slot for {}: {}", name, e);
                Response::Error(CxmError::NodeRefused(e.to_string()))
            }
        };
        let _ = reply.send(response);
    }

    fn on_joined(&mut self, now: i64, result: CxmResult<()>) {
        if self.role != Role::Joining {
            return;
        }
        match result {
            Ok(()) => {
                let leader = self.leader.clone().unwrap_or_default();
                info!("coordinator: joined cluster {}", self.config.cluster);
                self.become_passive(now, leader);
            }
            Err(e) => {
                error!(
                    "coordinator: join to cluster {} failed: {}",
                    self.config.cluster, e
                );
                self.emit(Effect::Shutdown(Some(e)));
            }
        }
    }

    /// A follower unregisters from its leader. The active leader hands over
    /// instead: the followers get a last status without it, its slot is
    /// erased and a new election starts among them.
    fn leave(&mut self) {
        info!("coordinator: leaving cluster {}", self.config.cluster);
        let leader = match self.role {
            Role::Passive | Role::Voting | Role::Joining => {
                self.leader.clone().filter(|l| l != self.name())
            }
            _ => None,
        };
        let hand_over = self.role == Role::Active;
        self.stop_all_timers();
        if hand_over {
            let name = self.name().to_string();
            self.members.remove(&name);
            self.leader_heartbeat();
            self.call_election();
            self.erase_slot(name);
        }
        self.set_role(Role::Leaving);
        self.emit(Effect::Leave { leader });
    }

    // -------------------------------------------------------------------
    // Timers and heartbeats
    // -------------------------------------------------------------------

    fn on_timer(&mut self, now: i64, timer: Timer) {
        match timer {
            Timer::Join => self.on_join_timer(),
            Timer::Tally { election } => self.tally(now, election),
            Timer::LeaderHeartbeat => self.leader_heartbeat(),
            Timer::FollowerHeartbeat => self.follower_heartbeat(now),
            Timer::LeaderWatchdog => {
                if self.role == Role::Active && self.mode != Mode::Panic {
                    self.scan_disk();
                }
            }
            Timer::FollowerWatchdog => self.follower_watchdog(now),
        }
    }

    fn leader_heartbeat(&mut self) {
        if self.role != Role::Active {
            return;
        }
        let msg = Message::MasterHeartbeat(MasterHeartbeat {
            cluster: self.message_cluster(),
            node: self.name().to_string(),
            status: self.members.clone(),
            mode: self.mode,
        });
        self.emit(Effect::Send {
            msg,
            dest: Dest::Broadcast,
        });
    }

    fn follower_heartbeat(&mut self, now: i64) {
        if !matches!(self.role, Role::Active | Role::Passive) {
            return;
        }
        let Some(leader) = self.leader.clone() else {
            return;
        };
        let msg = Message::SlaveHeartbeat(SlaveHeartbeat {
            cluster: self.message_cluster(),
            node: self.name().to_string(),
            timestamp: now,
            vms: self.local_vms.clone(),
        });
        self.emit(Effect::Send {
            msg,
            dest: Dest::Node(leader),
        });
        self.emit(Effect::WriteDiskTimestamp { timestamp: now });
    }

    fn follower_watchdog(&mut self, now: i64) {
        if !matches!(self.role, Role::Active | Role::Passive) || self.mode == Mode::Panic {
            return;
        }
        let silence = now - self.last_leader_seen_at;
        if silence > TM_MASTER.as_secs() as i64 {
            warn!(
                "coordinator: no master heartbeat for {}s, starting an election",
                silence
            );
            let _ = self.trigger_election();
        }
    }

    fn on_disk_write_failed(&mut self, e: CxmError) {
        match self.role {
            Role::Active => self.engage_panic(&format!("cannot write disk heartbeat: {}", e)),
            Role::Passive => {
                error!(
                    "diskheartbeat: write failed ({}), stopping heartbeats so that the master notices",
                    e
                );
                self.emit(Effect::StopTimer(TimerKind::FollowerHeartbeat));
            }
            _ => debug!("diskheartbeat: write failed while {}: {}", self.role, e),
        }
    }

    fn on_send_failed(&mut self, e: CxmError) {
        if matches!(self.role, Role::Alone | Role::Leaving) {
            debug!("netheartbeat: send failed while {}: {}", self.role, e);
            return;
        }
        self.engage_panic(&format!("heartbeat send failed: {}", e));
    }

    // -------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------

    fn dispatch_message(&mut self, now: i64, msg: Message) {
        trace!("coordinator: {} from {}", msg.kind(), msg.node());
        match msg {
            Message::SlaveHeartbeat(hb) => self.update_node_status(now, hb),
            Message::MasterHeartbeat(hb) => self.update_master_status(now, hb),
            Message::VoteRequest(req) => self.on_vote_request(req),
            Message::VoteResponse(resp) => self.on_vote_response(resp),
        }
    }

    fn update_node_status(&mut self, now: i64, hb: SlaveHeartbeat) {
        if self.role != Role::Active {
            trace!("coordinator: slave heartbeat from {} ignored, not master", hb.node);
            return;
        }
        match self.members.get_mut(&hb.node) {
            Some(member) => {
                member.last_net_timestamp = now;
                member.clock_offset = now - hb.timestamp;
                member.running_vms = hb.vms.into_iter().collect();
            }
            None => warn!("coordinator: slave heartbeat from unknown node {}", hb.node),
        }
    }

    fn update_master_status(&mut self, now: i64, hb: MasterHeartbeat) {
        match self.role {
            Role::Alone => {
                if self.leader.as_deref() != Some(hb.node.as_str()) {
                    info!("coordinator: found active master {}", hb.node);
                    self.leader = Some(hb.node);
                }
            }
            Role::Joining | Role::Voting | Role::Leaving => {}
            Role::Active => {
                if hb.node == self.name() {
                    self.last_leader_seen_at = now;
                    return;
                }
                self.split_brain(&hb);
            }
            Role::Passive => {
                if self.leader.as_deref() != Some(hb.node.as_str()) {
                    self.split_brain(&hb);
                    return;
                }
                self.last_leader_seen_at = now;
                self.members = hb.status;

                // Our own panic holds until the master has taken it over;
                // after that only its operator recovery clears it.
                if hb.mode == Mode::Panic {
                    self.leader_saw_panic = true;
                    self.set_mode(Mode::Panic);
                } else if self.mode == Mode::Panic && !self.leader_saw_panic {
                    warn!("coordinator: master {} is not in panic mode yet", hb.node);
                    self.escalate_panic();
                } else {
                    self.set_mode(hb.mode);
                }
            }
        }
    }

    /// A master heartbeat from an unexpected node: re-elect.
    fn split_brain(&mut self, hb: &MasterHeartbeat) {
        warn!(
            "coordinator: master heartbeat from {} while the master is {}",
            hb.node,
            self.leader.as_deref().unwrap_or("unknown")
        );
        if hb.mode == Mode::Panic {
            self.engage_panic(&format!("conflicting master {} is in panic", hb.node));
        }
        let _ = self.trigger_election();
    }

    // -------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------

    fn local_request(&mut self, req: LocalRequest, reply: Reply) {
        let response = match req {
            LocalRequest::Ping => Response::Pong,
            LocalRequest::GetState => Response::State(self.state_info()),
            LocalRequest::GetDump => Response::Dump(Box::new(self.dump())),
            LocalRequest::ListNodes => Response::Nodes(self.members.keys().cloned().collect()),
            LocalRequest::ForceElection => Response::from(self.trigger_election()),
            LocalRequest::Panic => match (self.role, self.leader.clone()) {
                (Role::Active, _) => {
                    self.engage_panic("requested by operator");
                    Response::Ok
                }
                (Role::Passive, Some(leader)) => {
                    info!("coordinator: forwarding panic request to {}", leader);
                    self.emit(Effect::ForwardPanic { leader, reply });
                    return;
                }
                _ => Response::Error(CxmError::NotMaster),
            },
            LocalRequest::Recover => Response::from(self.recover()),
            LocalRequest::Balance { dry_run } => match self.check_mutable() {
                Ok(()) => {
                    let placement = self.placement();
                    self.emit(Effect::Balance {
                        placement,
                        dry_run,
                        reply,
                    });
                    return;
                }
                Err(e) => Response::Error(e),
            },
            LocalRequest::Quit => {
                self.leave();
                Response::Ok
            }
        };
        let _ = reply.send(response);
    }

    fn remote_request(&mut self, req: RemoteRequest, reply: Reply) {
        let response = match req {
            RemoteRequest::Register { name } => match self.register(&name) {
                Ok(()) => {
                    self.emit(Effect::MakeSlot {
                        name,
                        reply: Some(reply),
                    });
                    return;
                }
                Err(e) => Response::Error(e),
            },
            RemoteRequest::Unregister { name } => Response::from(self.unregister(&name)),
            RemoteRequest::Panic => {
                if self.role == Role::Active {
                    self.engage_panic("requested by a cluster member");
                    Response::Ok
                } else {
                    Response::Error(CxmError::NotMaster)
                }
            }
        };
        let _ = reply.send(response);
    }

    /// Mutating operations need the active leader outside of panic mode.
    fn check_mutable(&self) -> CxmResult<()> {
        if self.role != Role::Active {
            return Err(CxmError::NotMaster);
        }
        if self.mode == Mode::Panic {
            return Err(CxmError::PanicEngaged);
        }
        Ok(())
    }

    /// Admission checks of a registration; the slot is reserved afterwards.
    fn register(&mut self, name: &str) -> CxmResult<()> {
        self.check_mutable()?;
        if !self.config.is_allowed(name) {
            info!("coordinator: node {} not allowed to join, refusing", name);
            return Err(CxmError::NodeRefused(format!(
                "{} is not allowed to join cluster {}",
                name, self.config.cluster
            )));
        }
        if self.members.contains_key(name) {
            info!("coordinator: node {} already joined, refusing", name);
            return Err(CxmError::NodeRefused(format!("{} is already in the cluster", name)));
        }
        Ok(())
    }

    fn unregister(&mut self, name: &str) -> CxmResult<()> {
        self.check_mutable()?;
        if name == self.name() {
            return Err(CxmError::NodeRefused("the active master cannot unregister itself".into()));
        }
        if self.members.remove(name).is_none() {
            info!("coordinator: unknown node {} tried to quit the cluster", name);
            return Err(CxmError::NodeRefused(format!("unknown node {}", name)));
        }
        self.recovering.remove(name);
        self.erase_slot(name.to_string());
        info!("coordinator: node {} has quit the cluster", name);
        Ok(())
    }

    /// Operator recovery: back to normal mode, then re-elect.
    ///
    /// The followers are told first, so that none of them carries a stale
    /// panic into the election.
    fn recover(&mut self) -> CxmResult<()> {
        if self.role != Role::Active {
            return Err(CxmError::NotMaster);
        }
        info!("coordinator: operator recovery from {} mode", self.mode);
        self.recovering.clear();
        self.set_mode(Mode::Normal);
        self.leader_heartbeat();
        self.trigger_election()
    }

    /// Current VM placement, from the members' last heartbeats.
    fn placement(&self) -> Placement {
        self.members
            .iter()
            .map(|(name, m)| (name.clone(), m.running_vms.iter().cloned().collect()))
            .collect()
    }
}
