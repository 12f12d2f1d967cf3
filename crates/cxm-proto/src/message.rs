//! Heartbeat and election messages exchanged over UDP.
//!
//! ## Envelope
//!
//! Each message is a keyed JSON envelope `{"type": <kind>, "data": {...}}`.
//! The `data` object always carries the `cluster` name and the emitting
//! `node`, so that clusters sharing a broadcast domain ignore each other.
//!
//! ## Frame
//!
//! ```text
//! +-----------+---------------------------+
//! | crc32 (4) | zlib(JSON envelope) ...   |
//! +-----------+---------------------------+
//! ```
//!
//! The CRC32 (big endian) covers the compressed payload. A frame whose
//! checksum or compression does not verify is dropped as corrupted instead
//! of being parsed.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::cluster::{MemberStatus, Mode};
use crate::defaults::MAX_DATAGRAM_SIZE;
use crate::error::{CxmError, CxmResult};

/// Size of the checksum prefix of a frame.
const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound of a decompressed envelope.
const MAX_ENVELOPE_SIZE: u64 = 16 * MAX_DATAGRAM_SIZE as u64;

/// Follower liveness, sent to the leader every heartbeat period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveHeartbeat {
    pub cluster: String,
    pub node: String,
    /// Follower clock (unix seconds).
    #[serde(rename = "ts")]
    pub timestamp: i64,
    pub vms: Vec<String>,
}

/// Cluster status, broadcast by the leader every heartbeat period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterHeartbeat {
    pub cluster: String,
    pub node: String,
    pub status: MemberStatus,
    #[serde(rename = "state")]
    pub mode: Mode,
}

/// Start of an election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub cluster: String,
    pub node: String,
    pub election: u64,
}

/// A ballot for a running election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub cluster: String,
    pub node: String,
    pub election: u64,
    pub ballot: u64,
}

/// The four message kinds of the heartbeat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    #[serde(rename = "slavehb")]
    SlaveHeartbeat(SlaveHeartbeat),
    #[serde(rename = "masterhb")]
    MasterHeartbeat(MasterHeartbeat),
    #[serde(rename = "voterequest")]
    VoteRequest(VoteRequest),
    #[serde(rename = "voteresponse")]
    VoteResponse(VoteResponse),
}

impl Message {
    /// Cluster tag of this message.
    pub fn cluster(&self) -> &str {
        match self {
            Message::SlaveHeartbeat(m) => &m.cluster,
            Message::MasterHeartbeat(m) => &m.cluster,
            Message::VoteRequest(m) => &m.cluster,
            Message::VoteResponse(m) => &m.cluster,
        }
    }

    /// Name of the emitting node.
    pub fn node(&self) -> &str {
        match self {
            Message::SlaveHeartbeat(m) => &m.node,
            Message::MasterHeartbeat(m) => &m.node,
            Message::VoteRequest(m) => &m.node,
            Message::VoteResponse(m) => &m.node,
        }
    }

    /// Envelope type key.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SlaveHeartbeat(_) => "slavehb",
            Message::MasterHeartbeat(_) => "masterhb",
            Message::VoteRequest(_) => "voterequest",
            Message::VoteResponse(_) => "voteresponse",
        }
    }
}

/// Encoder/decoder of heartbeat frames for one cluster.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    cluster: String,
}

impl MessageCodec {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Build the JSON envelope of a message.
    pub fn envelope(msg: &Message) -> CxmResult<Vec<u8>> {
        serde_json::to_vec(msg).map_err(|e| CxmError::Malformed(e.to_string()))
    }

    /// Encode a message into a checksummed, compressed frame.
    pub fn encode(&self, msg: &Message) -> CxmResult<Vec<u8>> {
        if msg.cluster() != self.cluster {
            return Err(CxmError::InvalidParms(format!(
                "message tagged for cluster {} sent on cluster {}",
                msg.cluster(),
                self.cluster
            )));
        }

        let json = Self::envelope(msg)?;
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len()), Compression::fast());
        encoder.write_all(&json)?;
        let payload = encoder.finish()?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
        frame.extend_from_slice(&payload);

        if frame.len() > MAX_DATAGRAM_SIZE {
            return Err(CxmError::InvalidParms(format!(
                "frame of {} bytes exceeds datagram size",
                frame.len()
            )));
        }
        Ok(frame)
    }

    /// Decode a frame.
    ///
    /// Returns `Ok(None)` for a valid message of another cluster, which is
    /// silently discarded by the caller.
    pub fn decode(&self, frame: &[u8]) -> CxmResult<Option<Message>> {
        if frame.len() <= FRAME_HEADER_SIZE {
            return Err(CxmError::CorruptFrame);
        }
        let (header, payload) = frame.split_at(FRAME_HEADER_SIZE);
        let expected = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if crc32fast::hash(payload) != expected {
            return Err(CxmError::CorruptFrame);
        }

        let mut json = Vec::new();
        ZlibDecoder::new(payload)
            .take(MAX_ENVELOPE_SIZE)
            .read_to_end(&mut json)
            .map_err(|_| CxmError::CorruptFrame)?;

        let msg: Message =
            serde_json::from_slice(&json).map_err(|e| CxmError::Malformed(e.to_string()))?;

        if msg.cluster() != self.cluster {
            return Ok(None);
        }
        if msg.node().is_empty() {
            return Err(CxmError::Malformed("empty node name".into()));
        }
        Ok(Some(msg))
    }
}
