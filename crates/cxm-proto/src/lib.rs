//! # cxm-proto
//!
//! Protocol types, constants, and data structures for the cxm cluster
//! coordinator.
//!
//! This crate defines the heartbeat wire codec, the RPC payloads, the error
//! taxonomy and the cluster data model shared by the daemon and the
//! operator tool.

pub mod cluster;
pub mod defaults;
pub mod error;
pub mod message;
pub mod rpc;

// Re-export commonly used types at the crate root
pub use cluster::{ClusterMember, CoordinatorDump, MemberStatus, Migration, Mode, Role, StateInfo};
pub use error::{CxmError, CxmResult};
pub use message::{Message, MessageCodec};
pub use rpc::{LocalRequest, RemoteRequest, Response};
