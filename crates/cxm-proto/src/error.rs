//! cxm error types.
//!
//! Errors fall in four families: refusals returned to a caller, transient
//! I/O failures that may be retried, integrity failures that must never be
//! retried, and local fatal errors.

use serde::{Deserialize, Serialize};

/// Unified error type for all cxm operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CxmError {
    // Refusals
    #[error("node refused: {0}")]
    NodeRefused(String),
    #[error("panic mode engaged, mutating operations are refused")]
    PanicEngaged,
    #[error("this node is not the active master")]
    NotMaster,
    #[error("heartbeat disk is in use, refusing to create a new cluster")]
    ClusterCreationRefused,
    #[error("this node has not joined a cluster")]
    NotJoined,

    // Transient
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("operation timed out")]
    Timeout,

    // Integrity
    #[error("{0} is not a cxm heartbeat disk")]
    NotAHeartbeatDisk(String),
    #[error("corrupted frame")]
    CorruptFrame,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("inconsistent heartbeat data: {0}")]
    Inconsistent(String),
    #[error("every member lost its heartbeats, local clock or storage is suspect")]
    AllHeartbeatsLost,

    // Disk heartbeat store
    #[error("slot already registered for {0}")]
    SlotExists(String),
    #[error("no slot found for {0}")]
    SlotNotFound(String),
    #[error("maximum number of slots reached")]
    SlotsExhausted,
    #[error("name {0} is too long for a slot")]
    NameTooLong(String),

    // Placement
    #[error("not enough capacity to evacuate {0}")]
    NoCapacity(String),

    #[error("I/O error: {0}")]
    Eio(String),
    #[error("invalid parameters: {0}")]
    InvalidParms(String),
    #[error("daemon is shutting down")]
    Shutdown,
}

impl CxmError {
    /// Expected refusals: returned to the caller, never fatal.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::NodeRefused(_)
                | Self::PanicEngaged
                | Self::NotMaster
                | Self::ClusterCreationRefused
                | Self::NotJoined
        )
    }

    /// Errors that may go away on a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::Timeout)
    }

    /// Contradictory or corrupted liveness data. Never retried.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::NotAHeartbeatDisk(_)
                | Self::CorruptFrame
                | Self::Malformed(_)
                | Self::Inconsistent(_)
                | Self::AllHeartbeatsLost
        )
    }
}

/// Result type alias for cxm operations.
pub type CxmResult<T> = Result<T, CxmError>;

impl From<std::io::Error> for CxmError {
    fn from(e: std::io::Error) -> Self {
        CxmError::Eio(e.to_string())
    }
}
