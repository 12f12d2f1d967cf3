//! Layered, tabu-filtered search for a more even VM placement.
//!
//! Layer 0 holds the current placement. Layer `k` holds every placement
//! reachable from a layer `k - 1` placement with one more live migration,
//! minus the placements breaking a hard constraint and the ones already
//! seen. The search stops at the first layer whose best placement improves
//! the current score by at least `min_gain_percent`.
//!
//! Two placements are considered identical when their scores are equal.
//! This also prunes distinct placements of equal cost, which keeps each
//! layer small at the price of occasionally skipping a useful path.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use cxm_proto::cluster::Migration;
use cxm_proto::defaults::{DEFAULT_LB_MAX_LAYERS, DEFAULT_LB_MAX_VMS_PER_NODE, DEFAULT_LB_MIN_GAIN};
use cxm_proto::error::{CxmError, CxmResult};
use tracing::debug;

/// VMs hosted by each node, in placement order.
pub type Placement = BTreeMap<String, Vec<String>>;

/// Resource usage of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmMetrics {
    pub io: u64,
    pub cpu: u64,
    /// Memory, in the same unit as [`NodeMetrics::ram`].
    pub ram: u64,
}

/// Capacity of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMetrics {
    pub ram: u64,
}

/// Search tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalancerConfig {
    pub max_vms_per_node: usize,
    pub max_layers: usize,
    pub min_gain_percent: f64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_vms_per_node: DEFAULT_LB_MAX_VMS_PER_NODE,
            max_layers: DEFAULT_LB_MAX_LAYERS,
            min_gain_percent: DEFAULT_LB_MIN_GAIN,
        }
    }
}

/// A placement, the migrations leading to it, and its score.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    state: Placement,
    path: Vec<Migration>,
    score: f64,
}

impl Solution {
    fn new(state: Placement, path: Vec<Migration>, vm_metrics: &BTreeMap<String, VmMetrics>) -> Self {
        let score = compute_score(&state, vm_metrics);
        Self { state, path, score }
    }

    /// Placement reached after the whole path.
    pub fn state(&self) -> &Placement {
        &self.state
    }

    /// Migrations to run, in order.
    pub fn path(&self) -> &[Migration] {
        &self.path
    }

    pub fn into_path(self) -> Vec<Migration> {
        self.path
    }

    /// Lower is more even.
    pub fn score(&self) -> f64 {
        self.score
    }

    fn migrate(
        &self,
        vm: &str,
        from: &str,
        to: &str,
        vm_metrics: &BTreeMap<String, VmMetrics>,
    ) -> Solution {
        let mut state = self.state.clone();
        if let Some(vms) = state.get_mut(from) {
            vms.retain(|v| v != vm);
        }
        state.entry(to.to_string()).or_default().push(vm.to_string());

        let mut path = self.path.clone();
        path.push(Migration {
            vm: vm.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
        Solution::new(state, path, vm_metrics)
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "score {:.2}, {} migration(s)", self.score, self.path.len())
    }
}

/// Load deviation between the most and least loaded node, as a percentage
/// of the cluster total.
fn deviation(loads: &[u64]) -> f64 {
    let total: f64 = loads.iter().map(|l| *l as f64).sum();
    if total == 0.0 {
        return 0.0;
    }
    let max = loads.iter().copied().max().unwrap_or(0);
    let min = loads.iter().copied().min().unwrap_or(0);
    (max - min) as f64 * 100.0 / total
}

/// Euclidean distance of (ΔIO%, ΔCPU%) from the origin.
fn compute_score(state: &Placement, vm_metrics: &BTreeMap<String, VmMetrics>) -> f64 {
    let mut ios = Vec::with_capacity(state.len());
    let mut cpus = Vec::with_capacity(state.len());
    for vms in state.values() {
        let (io, cpu) = vms
            .iter()
            .filter_map(|vm| vm_metrics.get(vm))
            .fold((0u64, 0u64), |(io, cpu), m| {
                (io.saturating_add(m.io), cpu.saturating_add(m.cpu))
            });
        ios.push(io);
        cpus.push(cpu);
    }
    let delta_io = deviation(&ios);
    let delta_cpu = deviation(&cpus);
    (delta_io * delta_io + delta_cpu * delta_cpu).sqrt()
}

/// Search engine for one placement snapshot.
pub struct LoadBalancer {
    config: BalancerConfig,
    vm_metrics: BTreeMap<String, VmMetrics>,
    node_metrics: BTreeMap<String, NodeMetrics>,
    root: Solution,
}

impl LoadBalancer {
    /// Build a balancer; every placed VM and every node must have metrics.
    pub fn new(
        placement: Placement,
        vm_metrics: BTreeMap<String, VmMetrics>,
        node_metrics: BTreeMap<String, NodeMetrics>,
        config: BalancerConfig,
    ) -> CxmResult<Self> {
        for (node, vms) in &placement {
            if !node_metrics.contains_key(node) {
                return Err(CxmError::InvalidParms(format!("no metrics for node {}", node)));
            }
            if let Some(vm) = vms.iter().find(|vm| !vm_metrics.contains_key(*vm)) {
                return Err(CxmError::InvalidParms(format!("no metrics for vm {}", vm)));
            }
        }

        let root = Solution::new(placement, Vec::new(), &vm_metrics);
        debug!("loadbalancer: current placement scores {:.2}", root.score);
        Ok(Self {
            config,
            vm_metrics,
            node_metrics,
            root,
        })
    }

    /// The current placement.
    pub fn current(&self) -> &Solution {
        &self.root
    }

    /// Find the first layer offering enough gain.
    ///
    /// Returns `None` when no placement within `max_layers` migrations
    /// improves the current score by at least `min_gain_percent`.
    pub fn solve(&self) -> Option<Solution> {
        let mut previous = vec![self.root.clone()];
        let mut seen: HashSet<u64> = HashSet::new();
        seen.insert(self.root.score.to_bits());

        for layer in 1..=self.config.max_layers {
            let mut current: Vec<Solution> = Vec::new();

            for parent in &previous {
                // Children of the same parent are never checked against
                // each other, only against what earlier parents produced.
                let children = self.expand(parent, &seen);
                seen.extend(children.iter().map(|s| s.score.to_bits()));
                current.extend(children);
            }

            if current.is_empty() {
                debug!("loadbalancer: layer {} is empty, giving up", layer);
                return None;
            }

            current.sort_by(|a, b| a.score.total_cmp(&b.score));
            let best = &current[0];
            debug!(
                "loadbalancer: layer {} has {} solutions, best {}",
                layer,
                current.len(),
                best
            );

            if best.score < self.root.score {
                let gain = (self.root.score - best.score) * 100.0 / self.root.score;
                if gain >= self.config.min_gain_percent {
                    debug!("loadbalancer: picked {} ({:.2}% gain)", best, gain);
                    return Some(best.clone());
                }
            }

            previous = current;
        }

        None
    }

    /// All single-migration neighbours of `parent` that respect the
    /// constraints and are not tabu.
    fn expand(&self, parent: &Solution, tabu: &HashSet<u64>) -> Vec<Solution> {
        let mut children = Vec::new();
        for (node, vms) in &parent.state {
            for vm in vms {
                for target in parent.state.keys().filter(|t| *t != node) {
                    let candidate = parent.migrate(vm, node, target, &self.vm_metrics);
                    if tabu.contains(&candidate.score.to_bits()) {
                        continue;
                    }
                    if self.is_constraints_ok(&candidate) {
                        children.push(candidate);
                    }
                }
            }
        }
        children
    }

    fn is_constraints_ok(&self, solution: &Solution) -> bool {
        solution.state.iter().all(|(node, vms)| {
            if vms.len() > self.config.max_vms_per_node {
                return false;
            }
            let ram: u64 = vms
                .iter()
                .filter_map(|vm| self.vm_metrics.get(vm))
                .map(|m| m.ram)
                .sum();
            let capacity = self.node_metrics.get(node).map_or(0, |m| m.ram);
            ram <= capacity
        })
    }
}
