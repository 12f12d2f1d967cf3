//! Request/response types of the two RPC services.
//!
//! The remote service is exposed by the active leader to the followers,
//! the local service by every daemon to the operator tool on the same host.
//! Both travel as `[u32 length][bincode(payload)]` frames.

use serde::{Deserialize, Serialize};

use crate::cluster::{CoordinatorDump, Migration, StateInfo};
use crate::error::CxmError;

/// Operations a follower calls on the active leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRequest {
    Register { name: String },
    Unregister { name: String },
    Panic,
}

/// Operations the operator tool calls on the local daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalRequest {
    Ping,
    GetState,
    GetDump,
    ListNodes,
    ForceElection,
    Panic,
    Recover,
    Balance { dry_run: bool },
    Quit,
}

/// Reply to either kind of request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Pong,
    State(StateInfo),
    Dump(Box<CoordinatorDump>),
    Nodes(Vec<String>),
    /// `None` when no better placement was found.
    Plan(Option<Vec<Migration>>),
    Error(CxmError),
}

impl Response {
    /// Turn an `Error` response back into a `Result`.
    pub fn into_result(self) -> Result<Response, CxmError> {
        match self {
            Response::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

impl From<Result<(), CxmError>> for Response {
    fn from(r: Result<(), CxmError>) -> Self {
        match r {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Mode, Role};

    #[test]
    fn test_into_result() {
        assert_eq!(Response::Pong.into_result(), Ok(Response::Pong));
        assert_eq!(
            Response::Error(CxmError::NotMaster).into_result(),
            Err(CxmError::NotMaster)
        );
        assert_eq!(Response::from(Err(CxmError::PanicEngaged)), Response::Error(CxmError::PanicEngaged));
        assert_eq!(Response::from(Ok(())), Response::Ok);
    }

    #[test]
    fn test_bincode_frames() {
        let req = RemoteRequest::Register {
            name: "node1".into(),
        };
        let data = bincode::serialize(&req).unwrap();
        let back: RemoteRequest = bincode::deserialize(&data).unwrap();
        assert_eq!(back, req);

        let resp = Response::State(StateInfo {
            role: Role::Passive,
            mode: Mode::Normal,
            leader: Some("node2".into()),
            last_election_at: Some(1325845000),
        });
        let data = bincode::serialize(&resp).unwrap();
        let back: Response = bincode::deserialize(&data).unwrap();
        assert_eq!(back, resp);
    }
}
