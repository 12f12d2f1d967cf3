//! Clustered Xen Management daemon (cxmd).
//!
//! Usage:
//!   cxmd --cluster NAME --node NODE [--node NODE ...] [OPTIONS]
//!
//! The daemon runs:
//! 1. The coordinator loop (election, heartbeats, failure detection)
//! 2. The UDP heartbeat listener
//! 3. The remote RPC service (TCP), answered when this node is the leader
//! 4. The local operator service (Unix socket) used by `cxmctl`

mod balance;
mod config;
mod coordinator;
mod daemon;
mod hypervisor;
mod netheartbeat;
mod recovery;
mod rpc;
mod timers;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use cxm_core::diskheartbeat::DiskHeartbeat;
use cxm_core::loadbalancer::BalancerConfig;
use cxm_core::net::create_listen_socket;
use cxm_core::resolver::{DnsCache, Resolver};
use cxm_proto::defaults::{
    DEFAULT_HB_DISK, DEFAULT_LB_MAX_LAYERS, DEFAULT_LB_MAX_VMS_PER_NODE, DEFAULT_LB_MIN_GAIN,
    DEFAULT_LOCAL_SOCKET, DEFAULT_RPC_PORT, DEFAULT_UDP_PORT,
};
use cxm_proto::error::{CxmError, CxmResult};
use cxm_proto::rpc::LocalRequest;

use crate::config::ClusterConfig;
use crate::coordinator::Command;
use crate::daemon::Daemon;
use crate::hypervisor::DetachedHypervisor;
use crate::netheartbeat::HeartbeatTransport;

/// Clustered Xen Management daemon
#[derive(Parser, Debug)]
#[command(name = "cxmd", version, about = "Clustered Xen Management daemon")]
struct Args {
    /// Name of the cluster to join or create
    #[arg(short = 'c', long)]
    cluster: String,

    /// Node allowed in the cluster, can be specified multiple times
    #[arg(short = 'n', long = "node", value_name = "NODE", required = true)]
    nodes: Vec<String>,

    /// Name of the local node (default: system hostname)
    #[arg(long)]
    name: Option<String>,

    /// Shared heartbeat device
    #[arg(short = 'd', long, default_value = DEFAULT_HB_DISK)]
    hb_disk: PathBuf,

    /// Heartbeat UDP port
    #[arg(long, default_value_t = DEFAULT_UDP_PORT)]
    udp_port: u16,

    /// Remote RPC TCP port
    #[arg(long, default_value_t = DEFAULT_RPC_PORT)]
    rpc_port: u16,

    /// Local operator socket
    #[arg(short = 's', long, default_value = DEFAULT_LOCAL_SOCKET)]
    socket: PathBuf,

    /// Listen address
    #[arg(short = 'b', long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Broadcast address of the heartbeat segment (default: 255.255.255.255)
    #[arg(long)]
    broadcast: Option<IpAddr>,

    /// Maximum number of VMs a node may host after balancing
    #[arg(long, default_value_t = DEFAULT_LB_MAX_VMS_PER_NODE)]
    lb_max_vms_per_node: usize,

    /// Maximum number of migrations of a balancing plan
    #[arg(long, default_value_t = DEFAULT_LB_MAX_LAYERS)]
    lb_max_layers: usize,

    /// Minimum score improvement of a balancing plan, in percent
    #[arg(long, default_value_t = DEFAULT_LB_MIN_GAIN)]
    lb_min_gain: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> CxmResult<ClusterConfig> {
        let name = match self.name {
            Some(name) => name,
            None => local_hostname()?,
        };
        let mut config = ClusterConfig::new(self.cluster, name, self.nodes);
        config.hb_disk = self.hb_disk;
        config.bind_addr = self.bind_addr;
        config.udp_port = self.udp_port;
        config.rpc_port = self.rpc_port;
        config.socket = self.socket;
        config.broadcast = self.broadcast;
        config.balancer = BalancerConfig {
            max_vms_per_node: self.lb_max_vms_per_node,
            max_layers: self.lb_max_layers,
            min_gain_percent: self.lb_min_gain,
        };
        config.validate()?;
        Ok(config)
    }
}

fn local_hostname() -> CxmResult<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/hostname")?;
    let name = raw.trim();
    if name.is_empty() {
        return Err(CxmError::InvalidParms("cannot determine the hostname, use --name".into()));
    }
    Ok(name.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("cxmd v{} starting", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => {
            info!("cxmd stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("cxmd: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> CxmResult<()> {
    let config = Arc::new(args.into_config()?);
    info!(
        "node {} in cluster {} (allowed: {:?})",
        config.node_name, config.cluster, config.allowed_nodes
    );

    let resolver: Arc<dyn Resolver> =
        Arc::new(DnsCache::new(&config.node_name, config.broadcast).await?);
    let disk = Arc::new(DiskHeartbeat::open(&config.hb_disk)?);
    let transport = Arc::new(HeartbeatTransport::bind(&config, resolver.clone()).await?);
    info!(
        "heartbeats on {}, broadcast to {}",
        transport.local_addr()?,
        resolver.broadcast()
    );
    let remote = create_listen_socket(&config.bind_addr, config.rpc_port).await?;
    let local = rpc::bind_local(&config.socket)?;

    let shutdown = Arc::new(Notify::new());
    let daemon = Daemon::new(
        config.clone(),
        resolver.clone(),
        Arc::new(DetachedHypervisor),
        disk,
        transport,
        shutdown.clone(),
    );
    let inputs = daemon.inputs();

    tokio::spawn(rpc::serve_remote(
        remote,
        resolver,
        inputs.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(rpc::serve_local(local, inputs.clone(), shutdown.clone()));

    let mut coordinator = tokio::spawn(daemon.run());
    let finished = tokio::select! {
        res = &mut coordinator => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };
    let joined = match finished {
        Some(res) => res,
        None => {
            info!("SIGINT received, leaving the cluster");
            let resp = rpc::dispatch(&inputs, Command::Local(LocalRequest::Quit)).await;
            if let Err(e) = resp.into_result() {
                warn!("quit failed: {}", e);
            }
            coordinator.await
        }
    };

    shutdown.notify_waiters();
    if let Err(e) = std::fs::remove_file(&config.socket) {
        warn!("cannot remove {}: {}", config.socket.display(), e);
    }

    joined.map_err(|e| CxmError::Eio(format!("coordinator task failed: {}", e)))?
}
