//! Wire protocol shared by the daemon, the client library and the front-end.
//!
//! One request record per seqpacket message, one response record back. The
//! encoding is bincode with its default fixed-width integer layout, so field
//! order is the wire order and the `Request` discriminant is a little-endian
//! u32 tag. Variants are append-only: never reorder or remove them, and never
//! re-use a retired tag.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Upper bound for a single protocol record. Receive buffers are sized to
/// this; a record that does not fit is a protocol error, not a framing
/// problem (seqpacket preserves boundaries).
pub const MAX_RECORD: usize = 4096;

#[derive(Debug)]
pub enum ProtocolError {
    Encode(bincode::Error),
    Decode(bincode::Error),
    Truncated,
}

impl std::error::Error for ProtocolError {}
impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Encode(e) => write!(f, "could not encode record: {}", e),
            ProtocolError::Decode(e) => write!(f, "could not decode record: {}", e),
            ProtocolError::Truncated => write!(f, "record was truncated on receive"),
        }
    }
}

/// One process observed on a card by telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub uid: u32,
    /// GPU memory footprint in bytes.
    pub memory: u64,
}

/// A physical GPU as tracked by the daemon. The same record is used for
/// daemon state and for status/claim replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Card {
    /// Stable position in the daemon's card list, assigned at init.
    pub index: u32,
    /// Kernel minor number of the `/dev/nvidia<minor_id>` node.
    pub minor_id: u32,
    pub name: String,
    pub uuid: String,
    pub compute_percent: u8,
    pub memory_total: u64,
    pub memory_used: u64,
    pub temperature_c: u32,
    /// 0 means free; otherwise the uid owning the device node.
    pub reserved_by_uid: u32,
    /// Connected client pids sharing this reservation (co-run adds more).
    pub client_pids: Vec<i32>,
    pub processes: Vec<GpuProcess>,
    /// CLOCK_MONOTONIC milliseconds of the last time a process was seen.
    pub last_usage_ms: u64,
    /// Set after a release until the next telemetry sample lands, so the
    /// card is not re-allocated on stale state.
    pub locked_until_update: bool,
}

impl Card {
    pub fn is_free(&self) -> bool {
        self.reserved_by_uid == 0
    }
}

/// A pending claim waiting for capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uid: u32,
    pub client_pid: i32,
    pub num_gpus: u32,
    /// Carried on the wire for forward compatibility; scheduling is FIFO.
    pub priority: f32,
    /// Wall-clock milliseconds since the epoch, for display only.
    pub submitted_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub cards: Vec<Card>,
    pub queue: Vec<Job>,
    pub maintenance: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub num_gpus: u32,
    /// Carried for forward compatibility; every claim currently waits.
    pub wait: bool,
}

/// Reply for both claims and co-runs. `error` is empty on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub claimed_cards: Vec<Card>,
    pub error: String,
}

impl ClaimResponse {
    pub fn rejection(error: impl Into<String>) -> Self {
        Self {
            claimed_cards: Vec::new(),
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoRunRequest {
    pub card_indices: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub card_indices: Vec<u32>,
}

/// Accumulated per-card error lines; empty on full success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub errors: String,
}

/// Top-level request union. Tag assignment is part of the wire contract:
/// Status = 0, Claim = 1, CoRun = 2, Release = 3. Append only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Status(StatusRequest),
    Claim(ClaimRequest),
    CoRun(CoRunRequest),
    Release(ReleaseRequest),
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(msg).map_err(ProtocolError::Encode)
}

pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(buf).map_err(ProtocolError::Decode)
}
