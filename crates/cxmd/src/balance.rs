//! Load balancing on behalf of the active leader.

use std::collections::BTreeSet;

use tracing::{debug, info};

use cxm_core::loadbalancer::{BalancerConfig, LoadBalancer, Placement};
use cxm_proto::cluster::Migration;
use cxm_proto::error::{CxmError, CxmResult};

use crate::hypervisor::Hypervisor;

/// Compute the migrations leading to a more even placement, if any.
pub async fn plan(
    hv: &dyn Hypervisor,
    config: BalancerConfig,
    placement: Placement,
) -> CxmResult<Option<Vec<Migration>>> {
    let vms: Vec<String> = placement
        .values()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let nodes: Vec<String> = placement.keys().cloned().collect();
    debug!("balance: {} vm(s) on {} node(s)", vms.len(), nodes.len());

    let vm_metrics = hv.vm_metrics(&vms).await?;
    let node_metrics = hv.node_metrics(&nodes).await?;
    let balancer = LoadBalancer::new(placement, vm_metrics, node_metrics, config)?;

    // The search is CPU bound.
    let solution = tokio::task::spawn_blocking(move || balancer.solve())
        .await
        .map_err(|e| CxmError::Eio(format!("load balancer task failed: {}", e)))?;

    match solution {
        Some(solution) => {
            info!("balance: {}", solution);
            Ok(Some(solution.into_path()))
        }
        None => {
            info!("balance: current placement is good enough");
            Ok(None)
        }
    }
}

/// Run the migrations one after the other, stopping at the first failure.
pub async fn execute(hv: &dyn Hypervisor, migrations: &[Migration]) -> CxmResult<()> {
    for (i, m) in migrations.iter().enumerate() {
        info!("balance: migration {}/{}: {}", i + 1, migrations.len(), m);
        hv.migrate(&m.vm, &m.from, &m.to).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use cxm_core::loadbalancer::{NodeMetrics, VmMetrics};

    use crate::recovery::tests::MockHypervisor;

    fn uneven() -> (MockHypervisor, Placement) {
        let vm = |cpu| VmMetrics {
            io: 0,
            cpu,
            ram: 512,
        };
        let hv = MockHypervisor {
            vm_metrics: BTreeMap::from([
                ("vm1".to_string(), vm(45)),
                ("vm2".to_string(), vm(45)),
                ("vm3".to_string(), vm(10)),
            ]),
            node_metrics: BTreeMap::from([
                ("a".to_string(), NodeMetrics { ram: 4096 }),
                ("b".to_string(), NodeMetrics { ram: 4096 }),
            ]),
            ..Default::default()
        };
        let placement = Placement::from([
            ("a".to_string(), vec!["vm1".to_string(), "vm2".to_string()]),
            ("b".to_string(), vec!["vm3".to_string()]),
        ]);
        (hv, placement)
    }

    fn config(min_gain_percent: f64) -> BalancerConfig {
        BalancerConfig {
            max_vms_per_node: 20,
            max_layers: 5,
            min_gain_percent,
        }
    }

    #[tokio::test]
    async fn test_plan_and_execute() {
        let (hv, placement) = uneven();
        let migrations = plan(&hv, config(5.0), placement).await.unwrap().unwrap();
        assert_eq!(
            migrations,
            vec![Migration {
                vm: "vm1".into(),
                from: "a".into(),
                to: "b".into(),
            }]
        );

        execute(&hv, &migrations).await.unwrap();
        assert_eq!(hv.calls(), ["migrate vm1 a b"]);
    }

    #[tokio::test]
    async fn test_no_plan_when_gain_is_out_of_reach() {
        let (hv, placement) = uneven();
        assert_eq!(plan(&hv, config(100.0), placement).await, Ok(None));
    }

    #[tokio::test]
    async fn test_missing_metrics_rejected() {
        let (hv, mut placement) = uneven();
        placement.insert("c".to_string(), vec!["vm9".to_string()]);
        assert!(matches!(
            plan(&hv, config(5.0), placement).await,
            Err(CxmError::InvalidParms(_))
        ));
    }
}
