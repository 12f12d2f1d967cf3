//! Recovery of a failed member.
//!
//! The active master first tries to evacuate the VMs of the failed node onto
//! the healthy members. A lack of capacity is returned as-is and ends in
//! panic mode; any other failure fences the node before its last known VMs
//! are restarted elsewhere, so that they never run twice.

use tracing::{error, info, warn};

use cxm_proto::error::{CxmError, CxmResult};

use crate::hypervisor::Hypervisor;

/// Move the VMs of `node` onto `targets`.
pub async fn recover_node(
    hv: &dyn Hypervisor,
    node: &str,
    vms: &[String],
    targets: &[String],
) -> CxmResult<()> {
    info!(
        "recovery: evacuating {} vm(s) of {} onto {:?}",
        vms.len(),
        node,
        targets
    );
    if targets.is_empty() && !vms.is_empty() {
        error!("recovery: no healthy node left to host the vms of {}", node);
        return Err(CxmError::NoCapacity(node.to_string()));
    }

    match hv.evacuate(node, vms, targets).await {
        Ok(()) => {
            info!("recovery: {} evacuated", node);
            Ok(())
        }
        Err(e @ CxmError::NoCapacity(_)) => {
            error!("recovery: cannot evacuate {}: {}", node, e);
            Err(e)
        }
        Err(e) => {
            warn!("recovery: evacuation of {} failed ({}), fencing it", node, e);
            hv.fence(node).await?;
            hv.restart(vms, targets).await?;
            info!("recovery: {} fenced, {} vm(s) restarted", node, vms.len());
            Ok(())
        }
    }
}
