//! # cxm-core
//!
//! Core shared library of the cxm cluster coordinator: the shared-disk
//! heartbeat store, the load-balancing search, host resolution and the
//! async socket helpers used by the daemon and the operator tool.

pub mod diskheartbeat;
pub mod loadbalancer;
pub mod net;
pub mod resolver;

pub use diskheartbeat::DiskHeartbeat;
pub use loadbalancer::{BalancerConfig, LoadBalancer, NodeMetrics, Placement, Solution, VmMetrics};
pub use resolver::{DnsCache, Resolver, StaticResolver};
