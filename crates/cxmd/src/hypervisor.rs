//! Hypervisor control plane seam.
//!
//! The coordinator never talks to a hypervisor directly. Inventory polling,
//! recovery and load balancing go through a [`Hypervisor`] implementation
//! handed to the daemon at startup.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::warn;

use cxm_core::loadbalancer::{NodeMetrics, VmMetrics};
use cxm_proto::error::{CxmError, CxmResult};

/// Operations the daemon needs from the virtualization layer.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// VMs running on the local node.
    async fn running_vms(&self) -> CxmResult<Vec<String>>;

    /// Load of the given VMs.
    async fn vm_metrics(&self, vms: &[String]) -> CxmResult<BTreeMap<String, VmMetrics>>;

    /// Free resources of the given nodes.
    async fn node_metrics(&self, nodes: &[String]) -> CxmResult<BTreeMap<String, NodeMetrics>>;

    /// Live-migrate one VM.
    async fn migrate(&self, vm: &str, from: &str, to: &str) -> CxmResult<()>;

    /// Move every VM of `node` onto `targets`.
    ///
    /// Fails with [`CxmError::NoCapacity`] when the targets cannot host them.
    async fn evacuate(&self, node: &str, vms: &[String], targets: &[String]) -> CxmResult<()>;

    /// Cut `node` off from shared resources.
    async fn fence(&self, node: &str) -> CxmResult<()>;

    /// Start `vms` again on `targets`.
    async fn restart(&self, vms: &[String], targets: &[String]) -> CxmResult<()>;
}

/// Hypervisor of a node that hosts no VM.
///
/// Useful to run the coordinator alone: nothing is ever reported running,
/// so there is never anything to evacuate or balance.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedHypervisor;

#[async_trait]
impl Hypervisor for DetachedHypervisor {
    async fn running_vms(&self) -> CxmResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn vm_metrics(&self, vms: &[String]) -> CxmResult<BTreeMap<String, VmMetrics>> {
        Ok(vms.iter().map(|vm| (vm.clone(), VmMetrics::default())).collect())
    }

    async fn node_metrics(&self, nodes: &[String]) -> CxmResult<BTreeMap<String, NodeMetrics>> {
        Ok(nodes
            .iter()
            .map(|node| (node.clone(), NodeMetrics::default()))
            .collect())
    }

    async fn migrate(&self, vm: &str, _from: &str, _to: &str) -> CxmResult<()> {
        Err(CxmError::InvalidParms(format!(
            "cannot migrate {}: no hypervisor attached",
            vm
        )))
    }

    async fn evacuate(&self, node: &str, vms: &[String], _targets: &[String]) -> CxmResult<()> {
        if vms.is_empty() {
            return Ok(());
        }
        Err(CxmError::NoCapacity(node.to_string()))
    }

    async fn fence(&self, node: &str) -> CxmResult<()> {
        warn!("recovery: no hypervisor attached, {} cannot be fenced", node);
        Ok(())
    }

    async fn restart(&self, vms: &[String], _targets: &[String]) -> CxmResult<()> {
        if vms.is_empty() {
            return Ok(());
        }
        Err(CxmError::InvalidParms("no hypervisor attached".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detached_hypervisor() {
        let hv = DetachedHypervisor;
        assert!(hv.running_vms().await.unwrap().is_empty());
        assert!(hv.evacuate("n1", &[], &["n2".to_string()]).await.is_ok());
        assert_eq!(
            hv.evacuate("n1", &["vm1".to_string()], &[]).await,
            Err(CxmError::NoCapacity("n1".into()))
        );
        assert!(hv.migrate("vm1", "n1", "n2").await.is_err());

        let nodes = hv.node_metrics(&["n1".to_string()]).await.unwrap();
        assert_eq!(nodes["n1"], NodeMetrics::default());
    }
}
