//! In-process gossip mesh
//!
//! Every message passes through the wire codec. Broadcast deliveries are
//! dropped with a configured probability; directed pull traffic is only lost
//! when the receiver's stream is full.

use crate::ports::{Committer, Gossip, PullBody, PullMessage};
use ledger_gossip_core::{wire, ChannelId, GossipMessage, NetworkMember, Payload, PeerId};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// A peer's membership in one channel
#[derive(Default)]
struct ChannelSlot {
    /// Ledger whose height is advertised to other members
    committer: Option<Arc<dyn Committer>>,
    broadcast_tx: Option<mpsc::Sender<Payload>>,
    pull_tx: Option<mpsc::Sender<PullMessage>>,
}

struct MeshInner {
    drop_rate: f64,
    buffer_size: usize,
    slots: RwLock<HashMap<(PeerId, ChannelId), ChannelSlot>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Mesh delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshStats {
    pub delivered: u64,
    pub dropped: u64,
}

/// Shared in-process network
#[derive(Clone)]
pub struct LocalMesh {
    inner: Arc<MeshInner>,
}

impl LocalMesh {
    /// Create a mesh losing each broadcast delivery with probability `drop_rate`
    pub fn new(drop_rate: f64, buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(MeshInner {
                drop_rate: drop_rate.clamp(0.0, 1.0),
                buffer_size: buffer_size.max(1),
                slots: RwLock::new(HashMap::new()),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a peer to the mesh
    pub fn endpoint(&self, peer_id: PeerId) -> MeshEndpoint {
        MeshEndpoint {
            peer_id,
            inner: self.inner.clone(),
        }
    }

    pub fn stats(&self) -> MeshStats {
        MeshStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

/// One peer's view of the mesh
pub struct MeshEndpoint {
    peer_id: PeerId,
    inner: Arc<MeshInner>,
}

impl MeshEndpoint {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Join `channel`, advertising the height of `committer`.
    ///
    /// The height is read on every membership query, so it must be cheap.
    pub fn join(&self, channel: &ChannelId, committer: Arc<dyn Committer>) {
        self.inner
            .slots
            .write()
            .entry((self.peer_id, channel.clone()))
            .or_default()
            .committer = Some(committer);
    }

    /// Leave `channel`; its subscription streams end
    pub fn leave(&self, channel: &ChannelId) {
        self.inner
            .slots
            .write()
            .remove(&(self.peer_id, channel.clone()));
    }

    /// Send `payload` to every other member of `channel`
    pub fn disseminate(&self, channel: &ChannelId, payload: Payload) {
        let targets: Vec<PeerId> = self
            .inner
            .slots
            .read()
            .keys()
            .filter(|(peer, ch)| ch == channel && *peer != self.peer_id)
            .map(|(peer, _)| *peer)
            .collect();
        self.send(
            GossipMessage::Payload {
                channel: channel.clone(),
                payload,
            },
            &targets,
        );
    }

    fn deliver(&self, target: PeerId, message: GossipMessage) {
        let key = (target, message.channel().clone());
        let slots = self.inner.slots.read();
        let Some(slot) = slots.get(&key) else {
            trace!("{} is not on {}", target, key.1);
            return;
        };

        let delivered = match message {
            GossipMessage::Payload { payload, .. } => slot
                .broadcast_tx
                .as_ref()
                .map(|tx| tx.try_send(payload).is_ok()),
            GossipMessage::PullRequest(request) => slot.pull_tx.as_ref().map(|tx| {
                tx.try_send(PullMessage {
                    from: self.peer_id,
                    body: PullBody::Request(request),
                })
                .is_ok()
            }),
            GossipMessage::PullResponse(response) => slot.pull_tx.as_ref().map(|tx| {
                tx.try_send(PullMessage {
                    from: self.peer_id,
                    body: PullBody::Response(response),
                })
                .is_ok()
            }),
        };

        if delivered == Some(true) {
            self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Gossip for MeshEndpoint {
    fn peers_of_channel(&self, channel: &ChannelId) -> Vec<NetworkMember> {
        let committers: Vec<(PeerId, Arc<dyn Committer>)> = self
            .inner
            .slots
            .read()
            .iter()
            .filter(|((peer, ch), _)| ch == channel && *peer != self.peer_id)
            .filter_map(|((peer, _), slot)| slot.committer.clone().map(|c| (*peer, c)))
            .collect();

        committers
            .into_iter()
            .filter_map(|(peer_id, committer)| {
                committer.height().ok().map(|ledger_height| NetworkMember {
                    peer_id,
                    ledger_height,
                })
            })
            .collect()
    }

    fn subscribe_broadcast(&self, channel: &ChannelId) -> mpsc::Receiver<Payload> {
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        self.inner
            .slots
            .write()
            .entry((self.peer_id, channel.clone()))
            .or_default()
            .broadcast_tx = Some(tx);
        rx
    }

    fn subscribe_pull(&self, channel: &ChannelId) -> mpsc::Receiver<PullMessage> {
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        self.inner
            .slots
            .write()
            .entry((self.peer_id, channel.clone()))
            .or_default()
            .pull_tx = Some(tx);
        rx
    }

    fn send(&self, message: GossipMessage, peers: &[PeerId]) {
        let bytes = match wire::encode(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode message on {}: {}", message.channel(), e);
                return;
            }
        };

        let lossy = matches!(message, GossipMessage::Payload { .. });
        let mut rng = rand::thread_rng();
        for target in peers {
            if *target == self.peer_id {
                continue;
            }
            if lossy && rng.gen_bool(self.inner.drop_rate) {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match wire::decode(&bytes) {
                Ok(message) => self.deliver(*target, message),
                Err(e) => warn!("Dropping undecodable message to {}: {}", target, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use ledger_gossip_core::PullRequest;

    fn channel() -> ChannelId {
        ChannelId::from("testchainid")
    }

    #[tokio::test]
    async fn test_payload_reaches_subscribers() {
        let mesh = LocalMesh::new(0.0, 8);
        let a = mesh.endpoint(PeerId([1; 32]));
        let b = mesh.endpoint(PeerId([2; 32]));
        let mut rx = b.subscribe_broadcast(&channel());

        a.disseminate(&channel(), Payload::new(3, b"x".to_vec()));
        assert_eq!(rx.recv().await.unwrap(), Payload::new(3, b"x".to_vec()));
        assert_eq!(mesh.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_pull_messages_carry_sender() {
        let mesh = LocalMesh::new(0.0, 8);
        let a = mesh.endpoint(PeerId([1; 32]));
        let b = mesh.endpoint(PeerId([2; 32]));
        let mut rx = b.subscribe_pull(&channel());

        let request = PullRequest {
            channel: channel(),
            from_seq: 4,
            to_seq: 8,
        };
        a.send(GossipMessage::PullRequest(request.clone()), &[b.peer_id()]);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.from, a.peer_id());
        assert_eq!(message.body, PullBody::Request(request));
    }

    #[test]
    fn test_membership_reports_heights_of_others() {
        let mesh = LocalMesh::new(0.0, 8);
        let a = mesh.endpoint(PeerId([1; 32]));
        let b = mesh.endpoint(PeerId([2; 32]));
        a.join(&channel(), Arc::new(MemoryLedger::with_height(4)));
        b.join(&channel(), Arc::new(MemoryLedger::with_height(9)));
        b.join(&ChannelId::from("other"), Arc::new(MemoryLedger::new()));

        let members = a.peers_of_channel(&channel());
        assert_eq!(
            members,
            vec![NetworkMember {
                peer_id: b.peer_id(),
                ledger_height: 9
            }]
        );

        b.leave(&channel());
        assert!(a.peers_of_channel(&channel()).is_empty());
    }

    #[test]
    fn test_full_drop_rate_loses_everything() {
        let mesh = LocalMesh::new(1.0, 8);
        let a = mesh.endpoint(PeerId([1; 32]));
        let b = mesh.endpoint(PeerId([2; 32]));
        let mut rx = b.subscribe_broadcast(&channel());

        for seq in 0..5 {
            a.disseminate(&channel(), Payload::new(seq, vec![]));
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(
            mesh.stats(),
            MeshStats {
                delivered: 0,
                dropped: 5
            }
        );
    }
}
