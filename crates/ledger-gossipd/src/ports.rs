//! Ports consumed by the state engine
//!
//! The engine only talks to the ledger and the gossip layer through these
//! traits; concrete adapters (sled ledger, in-process mesh, test doubles)
//! are substituted at construction.

use ledger_gossip_core::{
    ChannelId, GossipMessage, NetworkMember, Payload, PeerId, PullRequest, PullResponse,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a [`Committer`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommitError {
    /// Transient failure; the same block may be retried
    #[error("recoverable commit failure: {0}")]
    Recoverable(String),
    /// Ledger can no longer make progress (corruption, invariant violation)
    #[error("irrecoverable commit failure: {0}")]
    Fatal(String),
}

impl CommitError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommitError::Fatal(_))
    }
}

/// Ledger commit capability of one channel
///
/// Implementations are synchronous; the engine calls them off the async
/// executor.
pub trait Committer: Send + Sync {
    /// Validate and persist the block carried by `payload`
    fn commit(&self, payload: &Payload) -> Result<(), CommitError>;

    /// Number of committed blocks (the next required sequence number)
    fn height(&self) -> Result<u64, CommitError>;

    /// Committed payloads with `from <= seq_num <= to`, ascending
    fn payloads_in_range(&self, from: u64, to: u64) -> Result<Vec<Payload>, CommitError>;
}

/// Read the height of `committer` on the blocking pool.
///
/// A panicking implementation is reported as [`CommitError::Fatal`].
pub async fn read_height(committer: &Arc<dyn Committer>) -> Result<u64, CommitError> {
    let committer = committer.clone();
    tokio::task::spawn_blocking(move || committer.height())
        .await
        .unwrap_or_else(|e| Err(CommitError::Fatal(format!("height read failed: {}", e))))
}

/// Body of a directed pull message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullBody {
    Request(PullRequest),
    Response(PullResponse),
}

/// A pull message together with the peer that sent it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullMessage {
    pub from: PeerId,
    pub body: PullBody,
}

/// Gossip capability
///
/// Methods are called directly from async tasks and must not block.
pub trait Gossip: Send + Sync {
    /// Members of `channel` with their advertised ledger heights
    fn peers_of_channel(&self, channel: &ChannelId) -> Vec<NetworkMember>;

    /// Stream of payloads disseminated on `channel`
    fn subscribe_broadcast(&self, channel: &ChannelId) -> mpsc::Receiver<Payload>;

    /// Stream of pull requests and responses directed at us on `channel`
    fn subscribe_pull(&self, channel: &ChannelId) -> mpsc::Receiver<PullMessage>;

    /// Best-effort send; delivery is not confirmed
    fn send(&self, message: GossipMessage, peers: &[PeerId]);
}
