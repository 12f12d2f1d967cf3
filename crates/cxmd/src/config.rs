//! Daemon configuration.
//!
//! The command line is folded into one [`ClusterConfig`], validated once and
//! then shared read-only as `Arc<ClusterConfig>` by every subsystem.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;

use cxm_core::loadbalancer::BalancerConfig;
use cxm_proto::defaults::{DEFAULT_HB_DISK, DEFAULT_LOCAL_SOCKET, DEFAULT_RPC_PORT, DEFAULT_UDP_PORT};
use cxm_proto::error::{CxmError, CxmResult};

/// Immutable configuration of one cluster member.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster tag carried by every heartbeat.
    pub cluster: String,
    /// Name of this node, as registered with the leader.
    pub node_name: String,
    /// Static allow-list of nodes that may join the cluster.
    pub allowed_nodes: BTreeSet<String>,
    /// Shared heartbeat device.
    pub hb_disk: PathBuf,
    pub bind_addr: String,
    pub udp_port: u16,
    pub rpc_port: u16,
    /// Unix socket of the local operator service.
    pub socket: PathBuf,
    /// Broadcast destination, limited broadcast when unset.
    pub broadcast: Option<IpAddr>,
    pub balancer: BalancerConfig,
}

impl ClusterConfig {
    /// Configuration with default ports and paths.
    pub fn new(
        cluster: impl Into<String>,
        node_name: impl Into<String>,
        allowed_nodes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            node_name: node_name.into(),
            allowed_nodes: allowed_nodes.into_iter().collect(),
            hb_disk: PathBuf::from(DEFAULT_HB_DISK),
            bind_addr: "0.0.0.0".to_string(),
            udp_port: DEFAULT_UDP_PORT,
            rpc_port: DEFAULT_RPC_PORT,
            socket: PathBuf::from(DEFAULT_LOCAL_SOCKET),
            broadcast: None,
            balancer: BalancerConfig::default(),
        }
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed_nodes.contains(name)
    }

    pub fn validate(&self) -> CxmResult<()> {
        if self.cluster.is_empty() {
            return Err(CxmError::InvalidParms("cluster name is empty".into()));
        }
        if self.node_name.is_empty() {
            return Err(CxmError::InvalidParms("node name is empty".into()));
        }
        if self.allowed_nodes.is_empty() {
            return Err(CxmError::InvalidParms("node allow-list is empty".into()));
        }
        if self.hb_disk.as_os_str().is_empty() {
            return Err(CxmError::InvalidParms("heartbeat disk is not set".into()));
        }
        if self.udp_port == 0 || self.rpc_port == 0 {
            return Err(CxmError::InvalidParms("ports must be non-zero".into()));
        }
        if self.balancer.max_vms_per_node == 0 || self.balancer.max_layers == 0 {
            return Err(CxmError::InvalidParms(
                "load balancer limits must be non-zero".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.balancer.min_gain_percent) {
            return Err(CxmError::InvalidParms(format!(
                "minimum gain {}% out of range",
                self.balancer.min_gain_percent
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig::new("mycluster", "node1", ["node1".to_string(), "node2".to_string()])
    }

    #[test]
    fn test_defaults() {
        let c = config();
        assert_eq!(c.udp_port, 6666);
        assert_eq!(c.rpc_port, 8800);
        assert_eq!(c.socket, PathBuf::from("/var/run/cxmd.socket"));
        assert!(c.is_allowed("node2"));
        assert!(!c.is_allowed("node3"));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut c = config();
        c.cluster.clear();
        assert!(c.validate().is_err());

        let mut c = config();
        c.allowed_nodes.clear();
        assert!(c.validate().is_err());

        let mut c = config();
        c.balancer.min_gain_percent = 150.0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.balancer.max_layers = 0;
        assert!(c.validate().is_err());
    }
}
