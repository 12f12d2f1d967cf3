//! Runtime of the daemon.
//!
//! One task owns the [`Coordinator`] and steps it with every input arriving
//! on the input channel. The effects it returns are carried out without
//! blocking that task: datagrams go through an ordered sender task, disk
//! operations through an ordered disk worker running on the blocking pool,
//! and RPC calls, recoveries and balancing through spawned tasks. Every
//! completion comes back as another input.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use cxm_core::diskheartbeat::DiskHeartbeat;
use cxm_core::loadbalancer::Placement;
use cxm_core::resolver::{ip_suffix, Resolver};
use cxm_proto::defaults::{DEFAULT_INPUT_CHANNEL_SIZE, TM_HEARTBEAT, TM_RPC};
use cxm_proto::error::{CxmError, CxmResult};
use cxm_proto::message::Message;
use cxm_proto::rpc::{RemoteRequest, Response};

use crate::balance;
use crate::config::ClusterConfig;
use crate::coordinator::{Coordinator, Dest, Effect, Input, Reply};
use crate::hypervisor::Hypervisor;
use crate::netheartbeat::HeartbeatTransport;
use crate::recovery::recover_node;
use crate::rpc::call_leader;
use crate::timers::Timers;

/// Current unix time, in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Disk worker
// ---------------------------------------------------------------------------

/// Heartbeat disk operation, run in submission order.
enum DiskJob {
    InUse,
    MakeSlot { name: String, reply: Option<Reply> },
    EraseSlot { name: String },
    WriteTimestamp { timestamp: i64 },
    Scan,
}

impl DiskJob {
    /// Blocking. Returns the completion to feed back, if any.
    fn run(self, disk: &DiskHeartbeat, node: &str) -> Option<Input> {
        match self {
            DiskJob::InUse => {
                // An unreadable device must not be taken for a free one.
                let in_use = match disk.nr_nodes() {
                    Ok(nr) => nr > 0,
                    Err(e) => {
                        error!("diskheartbeat: cannot read {}: {}", disk.path().display(), e);
                        true
                    }
                };
                Some(Input::DiskInUse(in_use))
            }
            DiskJob::MakeSlot { name, reply } => {
                let result = disk.make_slot(&name);
                Some(Input::SlotMade {
                    name,
                    result,
                    reply,
                })
            }
            DiskJob::EraseSlot { name } => {
                if let Err(e) = disk.erase_slot(&name) {
                    warn!("diskheartbeat: cannot erase slot of {}: {}", name, e);
                }
                None
            }
            DiskJob::WriteTimestamp { timestamp } => disk
                .write_timestamp(node, timestamp)
                .err()
                .map(Input::DiskWriteFailed),
            DiskJob::Scan => Some(Input::DiskScanned(disk.read_all_timestamps())),
        }
    }
}

fn spawn_disk_worker(
    disk: Arc<DiskHeartbeat>,
    node: String,
    inputs: mpsc::Sender<Input>,
) -> (mpsc::Sender<DiskJob>, JoinHandle<()>) {
    let (tx, mut jobs) = mpsc::channel::<DiskJob>(DEFAULT_INPUT_CHANNEL_SIZE);
    let task = tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let disk = disk.clone();
            let node = node.clone();
            match tokio::task::spawn_blocking(move || job.run(&disk, &node)).await {
                Ok(Some(input)) => {
                    if inputs.send(input).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => error!("diskheartbeat: worker task failed: {}", e),
            }
        }
        debug!("diskheartbeat: worker stopped");
    });
    (tx, task)
}

// ---------------------------------------------------------------------------
// Datagram sender
// ---------------------------------------------------------------------------

/// Datagrams leave in the order the coordinator emitted them.
fn spawn_sender(
    transport: Arc<HeartbeatTransport>,
    inputs: mpsc::Sender<Input>,
) -> (mpsc::Sender<(Message, Dest)>, JoinHandle<()>) {
    let (tx, mut queue) = mpsc::channel::<(Message, Dest)>(DEFAULT_INPUT_CHANNEL_SIZE);
    let task = tokio::spawn(async move {
        while let Some((msg, dest)) = queue.recv().await {
            if let Err(e) = transport.send(&msg, &dest).await {
                if inputs.send(Input::SendFailed(e)).await.is_err() {
                    break;
                }
            }
        }
        debug!("netheartbeat: sender stopped");
    });
    (tx, task)
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct Daemon {
    config: Arc<ClusterConfig>,
    coordinator: Coordinator,
    resolver: Arc<dyn Resolver>,
    hypervisor: Arc<dyn Hypervisor>,
    disk: Arc<DiskHeartbeat>,
    transport: Arc<HeartbeatTransport>,
    timers: Timers,
    inputs: mpsc::Sender<Input>,
    rx: mpsc::Receiver<Input>,
    shutdown: Arc<Notify>,
}

impl Daemon {
    pub fn new(
        config: Arc<ClusterConfig>,
        resolver: Arc<dyn Resolver>,
        hypervisor: Arc<dyn Hypervisor>,
        disk: Arc<DiskHeartbeat>,
        transport: Arc<HeartbeatTransport>,
        shutdown: Arc<Notify>,
    ) -> Self {
        let (inputs, rx) = mpsc::channel(DEFAULT_INPUT_CHANNEL_SIZE);
        let coordinator = Coordinator::new(
            config.clone(),
            ip_suffix(resolver.local_ip()),
            StdRng::from_entropy(),
        );
        Self {
            config,
            coordinator,
            resolver,
            hypervisor,
            disk,
            transport,
            timers: Timers::new(inputs.clone()),
            inputs,
            rx,
            shutdown,
        }
    }

    /// Sender side of the coordinator input channel, for the RPC services.
    pub fn inputs(&self) -> mpsc::Sender<Input> {
        self.inputs.clone()
    }

    /// Run until the coordinator leaves the cluster or gives up.
    pub async fn run(mut self) -> CxmResult<()> {
        let (disk, disk_task) = spawn_disk_worker(
            self.disk.clone(),
            self.config.node_name.clone(),
            self.inputs.clone(),
        );
        let (sender, sender_task) = spawn_sender(self.transport.clone(), self.inputs.clone());
        self.transport
            .spawn_listener(self.inputs.clone(), self.shutdown.clone());
        self.spawn_inventory();

        let mut input = Input::Start;
        let exit = 'run: loop {
            for effect in self.coordinator.step(unix_now(), input) {
                if let Some(exit) = self.execute(effect, &disk, &sender).await {
                    break 'run exit;
                }
            }
            input = match self.rx.recv().await {
                Some(input) => input,
                None => break Err(CxmError::Shutdown),
            };
        };
        self.timers.stop_all();

        // Last datagrams and disk writes, such as a leader's hand-over.
        drop(disk);
        drop(sender);
        let flushed = time::timeout(TM_RPC, async {
            let _ = disk_task.await;
            let _ = sender_task.await;
        })
        .await;
        if flushed.is_err() {
            warn!("daemon: pending heartbeat work dropped on exit");
        }
        exit
    }

    /// Carry out one effect. Returns the exit status when the daemon stops.
    async fn execute(
        &mut self,
        effect: Effect,
        disk: &mpsc::Sender<DiskJob>,
        sender: &mpsc::Sender<(Message, Dest)>,
    ) -> Option<CxmResult<()>> {
        match effect {
            Effect::Send { msg, dest } => {
                if sender.send((msg, dest)).await.is_err() {
                    return Some(Err(CxmError::Shutdown));
                }
            }
            Effect::StartTimer(timer) => self.timers.start(timer),
            Effect::StopTimer(kind) => self.timers.stop(kind),
            Effect::CheckDiskInUse => return self.submit(disk, DiskJob::InUse).await,
            Effect::MakeSlot { name, reply } => {
                return self.submit(disk, DiskJob::MakeSlot { name, reply }).await
            }
            Effect::EraseSlot { name } => return self.submit(disk, DiskJob::EraseSlot { name }).await,
            Effect::WriteDiskTimestamp { timestamp } => {
                return self.submit(disk, DiskJob::WriteTimestamp { timestamp }).await
            }
            Effect::ScanDisk => return self.submit(disk, DiskJob::Scan).await,
            Effect::Register { leader } => self.register(leader),
            Effect::ForwardPanic { leader, reply } => self.forward_panic(leader, Some(reply)),
            Effect::EscalatePanic { leader } => self.forward_panic(leader, None),
            Effect::Recover { node, vms, targets } => self.recover(node, vms, targets),
            Effect::Balance {
                placement,
                dry_run,
                reply,
            } => self.balance(placement, dry_run, reply),
            Effect::Leave { leader } => {
                if let Some(leader) = leader {
                    self.unregister(&leader).await;
                }
                info!("daemon: left cluster {}", self.config.cluster);
                return Some(Ok(()));
            }
            Effect::Shutdown(reason) => {
                return Some(match reason {
                    Some(e) => {
                        error!("daemon: stopping: {}", e);
                        Err(e)
                    }
                    None => Ok(()),
                });
            }
        }
        None
    }

    async fn submit(&self, disk: &mpsc::Sender<DiskJob>, job: DiskJob) -> Option<CxmResult<()>> {
        match disk.send(job).await {
            Ok(()) => None,
            Err(_) => Some(Err(CxmError::Shutdown)),
        }
    }

    fn register(&self, leader: String) {
        let resolver = self.resolver.clone();
        let inputs = self.inputs.clone();
        let port = self.config.rpc_port;
        let req = RemoteRequest::Register {
            name: self.config.node_name.clone(),
        };
        tokio::spawn(async move {
            let result = call_leader(resolver.as_ref(), port, &leader, &req)
                .await
                .and_then(Response::into_result)
                .map(|_| ());
            let _ = inputs.send(Input::Joined(result)).await;
        });
    }

    /// Relay a panic request to the leader. Without a reply channel the
    /// outcome is only logged.
    fn forward_panic(&self, leader: String, reply: Option<Reply>) {
        let resolver = self.resolver.clone();
        let port = self.config.rpc_port;
        tokio::spawn(async move {
            let response = call_leader(resolver.as_ref(), port, &leader, &RemoteRequest::Panic)
                .await
                .unwrap_or_else(Response::Error);
            match reply {
                Some(reply) => {
                    let _ = reply.send(response);
                }
                None => {
                    if let Response::Error(e) = response {
                        warn!("coordinator: cannot escalate panic to {}: {}", leader, e);
                    }
                }
            }
        });
    }

    fn recover(&self, node: String, vms: Vec<String>, targets: Vec<String>) {
        let hv = self.hypervisor.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = recover_node(hv.as_ref(), &node, &vms, &targets).await;
            let _ = inputs.send(Input::RecoveryDone { node, result }).await;
        });
    }

    fn balance(&self, placement: Placement, dry_run: bool, reply: Reply) {
        let hv = self.hypervisor.clone();
        let config = self.config.balancer;
        tokio::spawn(async move {
            let plan = match balance::plan(hv.as_ref(), config, placement).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!("balance: cannot compute a plan: {}", e);
                    let _ = reply.send(Response::Error(e));
                    return;
                }
            };
            let _ = reply.send(Response::Plan(plan.clone()));

            if let (false, Some(migrations)) = (dry_run, plan) {
                if let Err(e) = balance::execute(hv.as_ref(), &migrations).await {
                    error!("balance: plan aborted: {}", e);
                }
            }
        });
    }

    async fn unregister(&self, leader: &str) {
        let req = RemoteRequest::Unregister {
            name: self.config.node_name.clone(),
        };
        let result = call_leader(self.resolver.as_ref(), self.config.rpc_port, leader, &req)
            .await
            .and_then(Response::into_result);
        match result {
            Ok(_) => info!("daemon: unregistered from {}", leader),
            Err(e) => warn!("daemon: cannot unregister from {}: {}", leader, e),
        }
    }

    /// Report the local VMs to the coordinator every heartbeat period.
    fn spawn_inventory(&self) {
        let hv = self.hypervisor.clone();
        let inputs = self.inputs.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(TM_HEARTBEAT);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = ticker.tick() => {
                        match hv.running_vms().await {
                            Ok(vms) => {
                                if inputs.send(Input::LocalVms(vms)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("daemon: cannot list local vms: {}", e),
                        }
                    }
                }
            }
        });
    }
}
