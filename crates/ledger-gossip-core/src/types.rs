//! Core protocol types for ledger state replication
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for the wire encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

/// Domain prefix for payload digests
pub const DOMAIN_PAYLOAD: &[u8] = b"payload";

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Ledger channel identifier: an independently replicated ledger partition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Unique peer identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Bytes32);

impl PeerId {
    /// Generate a random peer identifier
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// An undecoded block-plus-private-data unit tagged with its sequence number.
///
/// Identity is `seq_num`; `data` is handed to the committer verbatim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    pub seq_num: u64,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(seq_num: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            seq_num,
            data: data.into(),
        }
    }

    /// `BLAKE3("payload" || seq_num_le || data)`
    pub fn digest(&self) -> Bytes32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN_PAYLOAD);
        hasher.update(&self.seq_num.to_le_bytes());
        hasher.update(&self.data);
        *hasher.finalize().as_bytes()
    }

    /// Short hex form of the digest for log lines
    pub fn short_digest(&self) -> String {
        hex::encode(&self.digest()[..8])
    }
}

// =============================================================================
// PULL PROTOCOL
// =============================================================================

/// Directed query for a missing sequence range. Both bounds are inclusive.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequest {
    pub channel: ChannelId,
    pub from_seq: u64,
    pub to_seq: u64,
}

impl PullRequest {
    /// Number of sequence numbers covered by the range (0 if inverted)
    pub fn len(&self) -> u64 {
        if self.to_seq < self.from_seq {
            0
        } else {
            self.to_seq - self.from_seq + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answer to a [`PullRequest`], payloads in ascending sequence order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullResponse {
    pub channel: ChannelId,
    pub payloads: Vec<Payload>,
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Wire-level gossip message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum GossipMessage {
    /// Best-effort dissemination of a newly produced block
    Payload { channel: ChannelId, payload: Payload },
    PullRequest(PullRequest),
    PullResponse(PullResponse),
}

impl GossipMessage {
    /// Channel this message is scoped to
    pub fn channel(&self) -> &ChannelId {
        match self {
            GossipMessage::Payload { channel, .. } => channel,
            GossipMessage::PullRequest(req) => &req.channel,
            GossipMessage::PullResponse(resp) => &resp.channel,
        }
    }
}

/// A channel member as reported by membership
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkMember {
    pub peer_id: PeerId,
    /// Ledger height the peer last advertised
    pub ledger_height: u64,
}
