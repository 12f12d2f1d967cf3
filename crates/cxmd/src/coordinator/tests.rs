//! Simulated cluster.
//!
//! Several coordinators are wired through an in-memory network and a shared
//! heartbeat disk and driven by a virtual millisecond clock. Messages are
//! delivered instantly and in order; a node whose network is down neither
//! sends nor receives anything, not even its own broadcasts.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use cxm_core::loadbalancer::Placement;
use cxm_proto::cluster::{MemberStatus, Mode, Role};
use cxm_proto::defaults::{TM_HEARTBEAT, TM_JOIN_WAIT, TM_TALLY, TM_WATCHDOG};
use cxm_proto::error::{CxmError, CxmResult};
use cxm_proto::message::{MasterHeartbeat, Message};
use cxm_proto::rpc::{LocalRequest, RemoteRequest, Response};

use super::{Command, Coordinator, Dest, Effect, Input, Timer, TimerKind};
use crate::config::ClusterConfig;

const CLUSTER: &str = "testcluster";
const START_MS: i64 = 1_000_000_000;
const ALLOWED: [&str; 5] = ["n1", "n2", "n3", "n4", "n5"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskState {
    Ok,
    /// Writes are silently lost.
    Frozen,
    /// Every disk operation fails.
    Failing,
}

struct Node {
    coord: Coordinator,
    alive: bool,
    net_up: bool,
    disk: DiskState,
    timers: BTreeMap<TimerKind, (i64, Timer)>,
    shutdown: Option<Option<CxmError>>,
}

#[derive(Debug, Clone, PartialEq)]
struct RecoveryCall {
    leader: String,
    node: String,
    vms: Vec<String>,
    targets: Vec<String>,
}

struct Sim {
    seed: u64,
    now_ms: i64,
    nodes: BTreeMap<String, Node>,
    disk: BTreeMap<String, i64>,
    queue: VecDeque<(String, Input)>,
    joins: Vec<(String, oneshot::Receiver<Response>)>,
    recoveries: Vec<RecoveryCall>,
    /// Outcome reported for every recovery, none leaves them pending.
    auto_recover: Option<CxmResult<()>>,
    balances: Vec<(String, Placement, bool)>,
    check_single_active: bool,
}

fn first_delay(timer: Timer) -> i64 {
    let d = match timer {
        Timer::Join => TM_JOIN_WAIT,
        Timer::Tally { .. } => TM_TALLY,
        Timer::LeaderHeartbeat | Timer::FollowerHeartbeat => return 0,
        Timer::LeaderWatchdog | Timer::FollowerWatchdog => TM_WATCHDOG,
    };
    d.as_millis() as i64
}

fn period(timer: Timer) -> Option<i64> {
    match timer {
        Timer::Join | Timer::Tally { .. } => None,
        Timer::LeaderHeartbeat | Timer::FollowerHeartbeat => Some(TM_HEARTBEAT.as_millis() as i64),
        Timer::LeaderWatchdog | Timer::FollowerWatchdog => Some(TM_WATCHDOG.as_millis() as i64),
    }
}

impl Sim {
    fn new(seed: u64) -> Self {
        Self {
            seed,
            now_ms: START_MS,
            nodes: BTreeMap::new(),
            disk: BTreeMap::new(),
            queue: VecDeque::new(),
            joins: Vec::new(),
            recoveries: Vec::new(),
            auto_recover: None,
            balances: Vec::new(),
            check_single_active: true,
        }
    }

    fn now(&self) -> i64 {
        self.now_ms / 1000
    }

    fn add(&mut self, name: &str) {
        let suffix: u64 = name[1..].parse().unwrap();
        let config = ClusterConfig::new(CLUSTER, name, ALLOWED.iter().map(|s| s.to_string()));
        let rng = StdRng::seed_from_u64(self.seed * 100 + suffix);
        let node = Node {
            coord: Coordinator::new(Arc::new(config), suffix, rng),
            alive: true,
            net_up: true,
            disk: DiskState::Ok,
            timers: BTreeMap::new(),
            shutdown: None,
        };
        self.nodes.insert(name.to_string(), node);
    }

    fn start(&mut self, name: &str) {
        self.add(name);
        self.queue.push_back((name.to_string(), Input::Start));
        self.drain();
    }

    fn node(&self, name: &str) -> &Node {
        &self.nodes[name]
    }

    fn node_mut(&mut self, name: &str) -> &mut Node {
        self.nodes.get_mut(name).unwrap()
    }

    fn coord(&self, name: &str) -> &Coordinator {
        &self.node(name).coord
    }

    fn crash(&mut self, name: &str) {
        let node = self.node_mut(name);
        node.alive = false;
        node.timers.clear();
    }

    fn actives(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.alive && n.coord.role() == Role::Active)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The only active master, checking that every live follower agrees.
    fn leader(&self) -> String {
        let actives = self.actives();
        assert_eq!(actives.len(), 1, "active masters: {:?}", actives);
        let leader = actives[0].clone();
        for (name, node) in &self.nodes {
            if node.alive && name != &leader {
                assert_eq!(node.coord.role(), Role::Passive, "{} is not passive", name);
                assert_eq!(node.coord.leader(), Some(leader.as_str()), "{} follows another master", name);
            }
        }
        leader
    }

    fn reachable(&self, name: &str) -> bool {
        self.nodes
            .get(name)
            .map_or(false, |n| n.alive && n.net_up)
    }

    fn push(&mut self, to: &str, input: Input) {
        self.queue.push_back((to.to_string(), input));
    }

    fn deliver(&mut self, name: &str, input: Input) {
        let now = self.now();
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        if !node.alive {
            return;
        }
        let effects = node.coord.step(now, input);
        self.apply(name, effects);
    }

    fn drain(&mut self) {
        loop {
            while let Some((to, input)) = self.queue.pop_front() {
                self.deliver(&to, input);
            }
            if !self.poll_joins() {
                break;
            }
        }
        if self.check_single_active {
            let actives = self.actives();
            assert!(
                actives.len() <= 1,
                "two active masters at {}: {:?}",
                self.now_ms,
                actives
            );
        }
    }

    fn poll_joins(&mut self) -> bool {
        let mut progress = false;
        let mut pending = Vec::new();
        for (name, mut rx) in std::mem::take(&mut self.joins) {
            let result = match rx.try_recv() {
                Ok(Response::Error(e)) => Err(e),
                Ok(_) => Ok(()),
                Err(TryRecvError::Empty) => {
                    pending.push((name, rx));
                    continue;
                }
                Err(TryRecvError::Closed) => Err(CxmError::NetworkError("no reply".into())),
            };
            self.push(&name, Input::Joined(result));
            progress = true;
        }
        self.joins = pending;
        progress
    }

    fn send(&mut self, from: &str, msg: Message, dest: Dest) {
        if !self.reachable(from) {
            return;
        }
        match dest {
            Dest::Broadcast => {
                let targets: Vec<String> = self
                    .nodes
                    .keys()
                    .filter(|name| self.reachable(name))
                    .cloned()
                    .collect();
                for to in targets {
                    self.push(&to, Input::Message(msg.clone()));
                }
            }
            Dest::Node(to) => {
                if self.reachable(&to) {
                    self.push(&to, Input::Message(msg));
                }
            }
        }
    }

    fn make_slot(&mut self, from: &str, name: &str) -> CxmResult<()> {
        let state = self.node(from).disk;
        if state == DiskState::Failing {
            return Err(CxmError::Eio("write error".into()));
        }
        if self.disk.contains_key(name) {
            return Err(CxmError::SlotExists(name.to_string()));
        }
        if self.disk.len() >= 16 {
            return Err(CxmError::SlotsExhausted);
        }
        self.disk.insert(name.to_string(), 0);
        Ok(())
    }

    fn apply(&mut self, from: &str, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { msg, dest } => self.send(from, msg, dest),
                Effect::StartTimer(timer) => {
                    let due = self.now_ms + first_delay(timer);
                    self.node_mut(from).timers.insert(timer.kind(), (due, timer));
                }
                Effect::StopTimer(kind) => {
                    self.node_mut(from).timers.remove(&kind);
                }
                Effect::CheckDiskInUse => {
                    let in_use = !self.disk.is_empty();
                    self.push(from, Input::DiskInUse(in_use));
                }
                Effect::MakeSlot { name, reply } => {
                    let result = self.make_slot(from, &name);
                    self.push(
                        from,
                        Input::SlotMade {
                            name,
                            result,
                            reply,
                        },
                    );
                }
                Effect::EraseSlot { name } => {
                    self.disk.remove(&name);
                }
                Effect::WriteDiskTimestamp { timestamp } => {
                    let state = self.node(from).disk;
                    match state {
                        DiskState::Ok => match self.disk.get_mut(from) {
                            Some(ts) => *ts = timestamp,
                            None => {
                                let e = CxmError::SlotNotFound(from.to_string());
                                self.push(from, Input::DiskWriteFailed(e));
                            }
                        },
                        DiskState::Frozen => {}
                        DiskState::Failing => {
                            let e = CxmError::Eio("write error".into());
                            self.push(from, Input::DiskWriteFailed(e));
                        }
                    }
                }
                Effect::ScanDisk => {
                    let state = self.node(from).disk;
                    let result = match state {
                        DiskState::Failing => Err(CxmError::Eio("read error".into())),
                        _ => Ok(self.disk.clone()),
                    };
                    self.push(from, Input::DiskScanned(result));
                }
                Effect::Register { leader } => {
                    if self.reachable(from) && self.reachable(&leader) {
                        let (tx, rx) = oneshot::channel();
                        let command = Command::Remote(RemoteRequest::Register {
                            name: from.to_string(),
                        });
                        self.push(&leader, Input::Command { command, reply: tx });
                        self.joins.push((from.to_string(), rx));
                    } else {
                        let e = CxmError::NetworkError(format!("{} unreachable", leader));
                        self.push(from, Input::Joined(Err(e)));
                    }
                }
                Effect::ForwardPanic { leader, reply } => {
                    if self.reachable(from) && self.reachable(&leader) {
                        let command = Command::Remote(RemoteRequest::Panic);
                        self.push(&leader, Input::Command { command, reply });
                    } else {
                        let e = CxmError::NetworkError(format!("{} unreachable", leader));
                        let _ = reply.send(Response::Error(e));
                    }
                }
                Effect::EscalatePanic { leader } => {
                    if self.reachable(from) && self.reachable(&leader) {
                        let (tx, _rx) = oneshot::channel();
                        let command = Command::Remote(RemoteRequest::Panic);
                        self.push(&leader, Input::Command { command, reply: tx });
                    }
                }
                Effect::Recover { node, vms, targets } => {
                    self.recoveries.push(RecoveryCall {
                        leader: from.to_string(),
                        node: node.clone(),
                        vms,
                        targets,
                    });
                    if let Some(result) = self.auto_recover.clone() {
                        self.push(from, Input::RecoveryDone { node, result });
                    }
                }
                Effect::Balance {
                    placement,
                    dry_run,
                    reply,
                } => {
                    self.balances.push((from.to_string(), placement, dry_run));
                    let _ = reply.send(Response::Plan(None));
                }
                Effect::Leave { leader } => {
                    if let Some(leader) = leader {
                        if self.reachable(from) && self.reachable(&leader) {
                            let (tx, _rx) = oneshot::channel();
                            let command = Command::Remote(RemoteRequest::Unregister {
                                name: from.to_string(),
                            });
                            self.push(&leader, Input::Command { command, reply: tx });
                        }
                    }
                    self.crash(from);
                    self.node_mut(from).shutdown = Some(None);
                }
                Effect::Shutdown(e) => {
                    self.crash(from);
                    self.node_mut(from).shutdown = Some(e);
                }
            }
        }
    }

    /// Advance the clock by `ms`, firing every timer due on the way.
    fn run_for(&mut self, ms: i64) {
        let end = self.now_ms + ms;
        loop {
            self.drain();
            let next = self
                .nodes
                .iter()
                .filter(|(_, n)| n.alive)
                .flat_map(|(name, n)| {
                    n.timers
                        .iter()
                        .map(move |(kind, (due, _))| (*due, name.clone(), *kind))
                })
                .min();
            let Some((due, name, kind)) = next.filter(|(due, _, _)| *due <= end) else {
                break;
            };
            self.now_ms = self.now_ms.max(due);
            let node = self.node_mut(&name);
            let Some((_, timer)) = node.timers.remove(&kind) else {
                continue;
            };
            if let Some(p) = period(timer) {
                node.timers.insert(kind, (due + p, timer));
            }
            self.push(&name, Input::Timer(timer));
        }
        self.now_ms = end;
        self.drain();
    }

    fn command(&mut self, name: &str, command: Command) -> Response {
        let (tx, mut rx) = oneshot::channel();
        self.push(name, Input::Command { command, reply: tx });
        self.drain();
        match rx.try_recv() {
            Ok(resp) => resp,
            Err(e) => panic!("no reply from {}: {:?}", name, e),
        }
    }

    fn local(&mut self, name: &str, req: LocalRequest) -> Response {
        self.command(name, Command::Local(req))
    }

    fn remote(&mut self, name: &str, req: RemoteRequest) -> Response {
        self.command(name, Command::Remote(req))
    }

    fn member_names(&self, name: &str) -> Vec<String> {
        self.coord(name).members().keys().cloned().collect()
    }
}

/// n1 bootstraps the cluster, the other nodes join it.
fn cluster(seed: u64, size: usize) -> Sim {
    let mut sim = Sim::new(seed);
    sim.start("n1");
    sim.run_for(3000);
    for i in 2..=size {
        sim.start(&format!("n{}", i));
    }
    sim.run_for(3000);
    sim.run_for(2000);
    sim
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

#[test]
fn test_first_node_creates_the_cluster() {
    let mut sim = Sim::new(1);
    sim.start("n1");
    assert_eq!(sim.coord("n1").role(), Role::Alone);

    sim.run_for(3000);
    let n1 = sim.coord("n1");
    assert_eq!(n1.role(), Role::Active);
    assert_eq!(n1.mode(), Mode::Normal);
    assert_eq!(n1.leader(), Some("n1"));
    assert_eq!(sim.member_names("n1"), names(&["n1"]));
    assert!(sim.disk["n1"] > 0);
}

#[test]
fn test_creation_refused_when_disk_in_use() {
    let mut sim = Sim::new(1);
    sim.disk.insert("ghost".into(), 0);
    sim.start("n1");
    sim.run_for(3000);

    let n1 = sim.node("n1");
    assert!(!n1.alive);
    assert_eq!(n1.shutdown, Some(Some(CxmError::ClusterCreationRefused)));
    assert_eq!(n1.coord.role(), Role::Alone);
    assert!(!sim.disk.contains_key("n1"));
}

#[test]
fn test_node_outside_allow_list_cannot_create_a_cluster() {
    let mut sim = Sim::new(1);
    sim.start("n9");
    sim.run_for(3000);
    assert!(matches!(
        sim.node("n9").shutdown,
        Some(Some(CxmError::NodeRefused(_)))
    ));
    assert!(sim.disk.is_empty());
}

#[test]
fn test_nodes_join_the_existing_master() {
    let sim = cluster(1, 3);
    assert_eq!(sim.leader(), "n1");

    let all = names(&["n1", "n2", "n3"]);
    assert_eq!(sim.member_names("n1"), all);
    // Followers mirror the member list of the master.
    assert_eq!(sim.member_names("n2"), all);
    assert_eq!(sim.member_names("n3"), all);
    assert_eq!(sim.disk.keys().cloned().collect::<Vec<_>>(), all);
    assert!(sim.disk.values().all(|ts| *ts > 0));
}

#[test]
fn test_node_outside_allow_list_is_refused() {
    let mut sim = cluster(1, 1);
    sim.start("n9");
    sim.run_for(3000);

    assert_eq!(sim.coord("n9").role(), Role::Joining);
    assert!(matches!(
        sim.node("n9").shutdown,
        Some(Some(CxmError::NodeRefused(_)))
    ));
    assert_eq!(sim.member_names("n1"), names(&["n1"]));
    assert!(!sim.disk.contains_key("n9"));
}

// ---------------------------------------------------------------------------
// Election
// ---------------------------------------------------------------------------

#[test]
fn test_forced_election_elects_a_single_master() {
    let mut sim = cluster(7, 3);
    assert_eq!(sim.local("n2", LocalRequest::ForceElection), Response::Ok);
    for name in ["n1", "n2", "n3"] {
        assert_eq!(sim.coord(name).role(), Role::Voting);
    }

    sim.run_for(1500);
    let leader = sim.leader();
    for name in ["n1", "n2", "n3"] {
        assert!(sim.coord(name).state_info().last_election_at.is_some());
    }

    // The new master keeps the membership.
    sim.run_for(5000);
    assert_eq!(sim.leader(), leader);
    assert_eq!(sim.member_names(&leader), names(&["n1", "n2", "n3"]));
    assert!(sim.recoveries.is_empty());
}

#[test]
fn test_election_request_needs_a_joined_node() {
    let mut sim = Sim::new(1);
    sim.start("n1");
    assert_eq!(
        sim.local("n1", LocalRequest::ForceElection),
        Response::Error(CxmError::NotJoined)
    );
}

#[test]
fn test_at_most_one_active_master() {
    for seed in 0..16 {
        let mut sim = cluster(seed, 4);
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..25 {
            if rng.gen_bool(0.4) {
                let name = format!("n{}", rng.gen_range(1..=4));
                let resp = sim.local(&name, LocalRequest::ForceElection);
                assert_eq!(resp, Response::Ok);
            }
            sim.run_for(rng.gen_range(0..3000));
        }
        sim.run_for(10_000);
        let leader = sim.leader();
        assert_eq!(sim.member_names(&leader).len(), 4, "seed {}", seed);
        assert_eq!(sim.coord(&leader).mode(), Mode::Normal, "seed {}", seed);
    }
}

#[test]
fn test_isolated_follower_panics_then_is_recovered() {
    let mut sim = cluster(3, 3);
    sim.check_single_active = false;
    sim.node_mut("n3").net_up = false;

    sim.run_for(12_000);
    // Its own election got no ballot at all.
    let n3 = sim.coord("n3");
    assert_eq!(n3.mode(), Mode::Panic);
    assert_eq!(n3.role(), Role::Passive);
    assert_eq!(n3.leader(), None);
    // Its disk slot is still fresh, so the master only warns.
    assert_eq!(sim.coord("n1").mode(), Mode::Normal);
    assert!(sim.recoveries.is_empty());

    // Once n3 stops writing its slot, both channels are stale.
    sim.run_for(15_000);
    assert_eq!(sim.actives(), names(&["n1"]));
    assert_eq!(sim.recoveries.len(), 1);
    assert_eq!(sim.recoveries[0].node, "n3");
    assert_eq!(sim.recoveries[0].targets, names(&["n1", "n2"]));
    assert_eq!(sim.coord("n1").mode(), Mode::Recovery);
    assert_eq!(sim.coord("n2").mode(), Mode::Recovery);
}

#[test]
fn test_master_crash_fails_over() {
    let mut sim = cluster(5, 3);
    sim.auto_recover = Some(Ok(()));
    sim.push("n1", Input::LocalVms(names(&["vm2", "vm1"])));
    sim.run_for(2000);
    assert_eq!(
        sim.coord("n2").members()["n1"].running_vms.len(),
        2,
        "followers mirror the running VMs"
    );

    sim.crash("n1");
    sim.run_for(12_000);
    let leader = sim.leader();
    assert_ne!(leader, "n1");

    sim.run_for(20_000);
    assert_eq!(sim.leader(), leader);
    assert_eq!(
        sim.recoveries,
        vec![RecoveryCall {
            leader: leader.clone(),
            node: "n1".into(),
            vms: names(&["vm1", "vm2"]),
            targets: names(&["n2", "n3"]),
        }]
    );
    assert_eq!(sim.member_names(&leader), names(&["n2", "n3"]));
    assert!(!sim.disk.contains_key("n1"));
    assert_eq!(sim.coord(&leader).mode(), Mode::Normal);
}

#[test]
fn test_frozen_disk_alone_is_not_a_failure() {
    let mut sim = cluster(1, 3);
    sim.node_mut("n3").disk = DiskState::Frozen;
    sim.run_for(20_000);

    assert_eq!(sim.leader(), "n1");
    assert!(sim.recoveries.is_empty());
    assert_eq!(sim.coord("n1").mode(), Mode::Normal);
    assert_eq!(sim.member_names("n1").len(), 3);
}

#[test]
fn test_follower_disk_failure_gets_it_recovered() {
    let mut sim = cluster(1, 3);
    sim.node_mut("n2").disk = DiskState::Failing;
    sim.run_for(1500);
    assert_eq!(sim.coord("n2").role(), Role::Passive);
    assert_eq!(sim.coord("n2").mode(), Mode::Normal);

    sim.run_for(25_000);
    assert_eq!(sim.recoveries.len(), 1);
    assert_eq!(sim.recoveries[0].node, "n2");
    assert_eq!(sim.coord("n1").mode(), Mode::Recovery);
}

#[test]
fn test_failed_recovery_engages_panic() {
    let mut sim = cluster(2, 3);
    sim.auto_recover = Some(Err(CxmError::NoCapacity("n3".into())));
    sim.crash("n3");
    sim.run_for(30_000);

    assert_eq!(sim.recoveries.len(), 1);
    assert_eq!(sim.coord("n1").mode(), Mode::Panic);
    assert_eq!(sim.coord("n2").mode(), Mode::Panic);
    assert!(sim.coord("n1").members().contains_key("n3"));
}

// ---------------------------------------------------------------------------
// Panic
// ---------------------------------------------------------------------------

#[test]
fn test_split_brain_with_panicking_master() {
    let mut sim = cluster(4, 3);
    let intruder = Message::MasterHeartbeat(MasterHeartbeat {
        cluster: CLUSTER.into(),
        node: "n9".into(),
        status: MemberStatus::new(),
        mode: Mode::Panic,
    });
    sim.push("n2", Input::Message(intruder));
    sim.drain();

    assert_eq!(sim.coord("n2").mode(), Mode::Panic);
    assert_eq!(sim.coord("n2").role(), Role::Voting);

    sim.run_for(3000);
    sim.leader();
    for name in ["n1", "n2", "n3"] {
        assert_eq!(sim.coord(name).mode(), Mode::Panic, "{}", name);
    }
}

#[test]
fn test_panic_refuses_mutations() {
    let mut sim = cluster(1, 2);
    assert_eq!(sim.local("n1", LocalRequest::Panic), Response::Ok);
    sim.run_for(1500);
    assert_eq!(sim.coord("n2").mode(), Mode::Panic);

    assert_eq!(
        sim.local("n1", LocalRequest::Balance { dry_run: true }),
        Response::Error(CxmError::PanicEngaged)
    );
    assert_eq!(
        sim.remote("n1", RemoteRequest::Unregister { name: "n2".into() }),
        Response::Error(CxmError::PanicEngaged)
    );
    assert_eq!(
        sim.local("n2", LocalRequest::Recover),
        Response::Error(CxmError::NotMaster)
    );

    sim.start("n3");
    sim.run_for(3000);
    assert_eq!(sim.node("n3").shutdown, Some(Some(CxmError::PanicEngaged)));
    assert!(!sim.disk.contains_key("n3"));

    // Panic is sticky.
    sim.run_for(30_000);
    assert_eq!(sim.coord("n1").mode(), Mode::Panic);
    assert!(sim.recoveries.is_empty());
}

#[test]
fn test_operator_recovery_clears_panic() {
    let mut sim = cluster(6, 3);
    assert_eq!(sim.local("n1", LocalRequest::Panic), Response::Ok);
    sim.run_for(2000);
    for name in ["n1", "n2", "n3"] {
        assert_eq!(sim.coord(name).mode(), Mode::Panic);
    }

    assert_eq!(sim.local("n1", LocalRequest::Recover), Response::Ok);
    sim.run_for(3000);
    sim.leader();
    for name in ["n1", "n2", "n3"] {
        assert_eq!(sim.coord(name).mode(), Mode::Normal, "{}", name);
    }
}

#[test]
fn test_follower_forwards_panic_request() {
    let mut sim = cluster(1, 2);
    assert_eq!(sim.local("n2", LocalRequest::Panic), Response::Ok);
    assert_eq!(sim.coord("n1").mode(), Mode::Panic);
}

#[test]
fn test_master_disk_failure_engages_panic() {
    let mut sim = cluster(1, 2);
    sim.node_mut("n1").disk = DiskState::Failing;
    sim.run_for(2000);
    assert_eq!(sim.coord("n1").mode(), Mode::Panic);
    assert_eq!(sim.coord("n2").mode(), Mode::Panic);
}

#[test]
fn test_follower_panic_survives_a_lost_escalation() {
    let mut sim = cluster(1, 3);
    sim.node_mut("n1").net_up = false;
    sim.push("n2", Input::SendFailed(CxmError::NetworkError("unreachable".into())));
    sim.drain();
    assert_eq!(sim.coord("n2").mode(), Mode::Panic);
    assert_eq!(sim.coord("n1").mode(), Mode::Normal);

    // The master heartbeat still says Normal: n2 escalates again.
    sim.node_mut("n1").net_up = true;
    sim.run_for(1500);
    assert_eq!(sim.coord("n2").mode(), Mode::Panic);
    assert_eq!(sim.coord("n1").mode(), Mode::Panic);

    sim.run_for(1500);
    for name in ["n1", "n2", "n3"] {
        assert_eq!(sim.coord(name).mode(), Mode::Panic, "{}", name);
    }

    assert_eq!(sim.local("n1", LocalRequest::Recover), Response::Ok);
    sim.run_for(3000);
    sim.leader();
    for name in ["n1", "n2", "n3"] {
        assert_eq!(sim.coord(name).mode(), Mode::Normal, "{}", name);
    }
}

#[test]
fn test_heartbeat_send_failure_engages_panic() {
    let mut sim = cluster(1, 2);
    sim.push("n2", Input::SendFailed(CxmError::NetworkError("unreachable".into())));
    sim.drain();
    assert_eq!(sim.coord("n2").mode(), Mode::Panic);
    assert_eq!(sim.coord("n1").mode(), Mode::Panic);
}

// ---------------------------------------------------------------------------
// Membership and commands
// ---------------------------------------------------------------------------

#[test]
fn test_follower_quit_unregisters() {
    let mut sim = cluster(1, 3);
    assert_eq!(sim.local("n3", LocalRequest::Quit), Response::Ok);

    let n3 = sim.node("n3");
    assert!(!n3.alive);
    assert_eq!(n3.shutdown, Some(None));
    assert_eq!(n3.coord.role(), Role::Leaving);
    assert_eq!(sim.member_names("n1"), names(&["n1", "n2"]));
    assert!(!sim.disk.contains_key("n3"));

    sim.run_for(20_000);
    assert!(sim.recoveries.is_empty());
    assert_eq!(sim.member_names("n2"), names(&["n1", "n2"]));
}

#[test]
fn test_master_quit_leads_to_a_new_election() {
    let mut sim = cluster(1, 3);
    assert_eq!(sim.local("n1", LocalRequest::Quit), Response::Ok);
    assert!(!sim.node("n1").alive);
    assert!(!sim.disk.contains_key("n1"));
    for name in ["n2", "n3"] {
        assert_eq!(sim.coord(name).role(), Role::Voting, "{}", name);
        assert_eq!(sim.member_names(name), names(&["n2", "n3"]));
    }

    sim.run_for(1500);
    let leader = sim.leader();
    assert_ne!(leader, "n1");

    // A master that left cleanly is not recovered.
    sim.run_for(40_000);
    assert_eq!(sim.leader(), leader);
    assert!(sim.recoveries.is_empty());
    assert_eq!(sim.coord(&leader).mode(), Mode::Normal);
    assert_eq!(sim.member_names(&leader), names(&["n2", "n3"]));
}

#[test]
fn test_scan_racing_an_unregister_is_consistent() {
    let mut sim = cluster(1, 3);
    let before = sim.disk.clone();
    let now = sim.now();

    // The scan was queued on the disk before the slot of n3 was erased.
    let n1 = &mut sim.node_mut("n1").coord;
    let effects = n1.step(now, Input::Timer(Timer::LeaderWatchdog));
    assert!(effects.iter().any(|e| matches!(e, Effect::ScanDisk)));

    let (tx, mut rx) = oneshot::channel();
    let command = Command::Remote(RemoteRequest::Unregister { name: "n3".into() });
    let effects = n1.step(now, Input::Command { command, reply: tx });
    assert_eq!(rx.try_recv().unwrap(), Response::Ok);
    assert!(effects
        .iter()
        .any(|e| matches!(e, Effect::EraseSlot { name } if name == "n3")));

    n1.step(now, Input::DiskScanned(Ok(before)));
    assert_eq!(n1.mode(), Mode::Normal);

    sim.disk.remove("n3");
    sim.crash("n3");
    sim.run_for(20_000);
    assert_eq!(sim.coord("n1").mode(), Mode::Normal);
    assert!(sim.recoveries.is_empty());
    assert_eq!(sim.member_names("n1"), names(&["n1", "n2"]));
}

#[test]
fn test_registration_rules() {
    let mut sim = cluster(1, 2);
    assert!(matches!(
        sim.remote("n1", RemoteRequest::Register { name: "n2".into() }),
        Response::Error(CxmError::NodeRefused(_))
    ));
    assert_eq!(
        sim.remote("n2", RemoteRequest::Register { name: "n3".into() }),
        Response::Error(CxmError::NotMaster)
    );
    assert!(matches!(
        sim.remote("n1", RemoteRequest::Unregister { name: "n5".into() }),
        Response::Error(CxmError::NodeRefused(_))
    ));
    assert!(matches!(
        sim.remote("n1", RemoteRequest::Unregister { name: "n1".into() }),
        Response::Error(CxmError::NodeRefused(_))
    ));
    assert_eq!(
        sim.remote("n2", RemoteRequest::Panic),
        Response::Error(CxmError::NotMaster)
    );
    assert_eq!(sim.member_names("n1"), names(&["n1", "n2"]));

    // A slot left behind is refused, and not erased.
    sim.disk.insert("n3".into(), 0);
    assert!(matches!(
        sim.remote("n1", RemoteRequest::Register { name: "n3".into() }),
        Response::Error(CxmError::NodeRefused(_))
    ));
    assert!(sim.disk.contains_key("n3"));
    assert!(!sim.coord("n1").members().contains_key("n3"));
}

#[test]
fn test_balance_runs_on_the_master_only() {
    let mut sim = cluster(1, 2);
    sim.push("n2", Input::LocalVms(names(&["vm1"])));
    sim.run_for(1500);

    assert_eq!(
        sim.local("n1", LocalRequest::Balance { dry_run: true }),
        Response::Plan(None)
    );
    let (on, placement, dry_run) = &sim.balances[0];
    assert_eq!(on, "n1");
    assert!(*dry_run);
    assert_eq!(placement["n2"], names(&["vm1"]));
    assert!(placement["n1"].is_empty());

    assert_eq!(
        sim.local("n2", LocalRequest::Balance { dry_run: false }),
        Response::Error(CxmError::NotMaster)
    );
}

#[test]
fn test_local_queries() {
    let mut sim = cluster(1, 2);
    assert_eq!(sim.local("n2", LocalRequest::Ping), Response::Pong);
    assert_eq!(
        sim.local("n2", LocalRequest::ListNodes),
        Response::Nodes(names(&["n1", "n2"]))
    );

    match sim.local("n2", LocalRequest::GetState) {
        Response::State(state) => {
            assert_eq!(state.role, Role::Passive);
            assert_eq!(state.mode, Mode::Normal);
            assert_eq!(state.leader.as_deref(), Some("n1"));
            assert_eq!(state.last_election_at, None);
        }
        other => panic!("unexpected {:?}", other),
    }

    match sim.local("n1", LocalRequest::GetDump) {
        Response::Dump(dump) => {
            assert_eq!(dump.node, "n1");
            assert_eq!(dump.cluster, CLUSTER);
            assert_eq!(dump.members.len(), 2);
            assert!(dump.recovering.is_empty());
        }
        other => panic!("unexpected {:?}", other),
    }
}
