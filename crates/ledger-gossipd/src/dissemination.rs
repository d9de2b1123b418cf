//! Dissemination handler: feeds broadcast deliveries into the buffer

use crate::buffer::PayloadBuffer;
use ledger_gossip_core::{ChannelId, Payload};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub struct DisseminationHandler {
    channel: ChannelId,
    buffer: Arc<PayloadBuffer>,
    /// Payloads this far or further ahead of the height are not buffered
    max_block_distance: u64,
}

impl DisseminationHandler {
    pub fn new(channel: ChannelId, buffer: Arc<PayloadBuffer>, max_block_distance: u64) -> Self {
        Self {
            channel,
            buffer,
            max_block_distance,
        }
    }

    pub async fn run(self, mut stream: mpsc::Receiver<Payload>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivery = stream.recv() => match delivery {
                    Some(payload) => {
                        self.handle(payload);
                    }
                    None => {
                        debug!("Broadcast stream of {} closed", self.channel);
                        break;
                    }
                },
            }
        }
    }

    /// Push one delivered payload. Rejections are expected in a best-effort
    /// protocol and never reach the sender.
    pub fn handle(&self, payload: Payload) -> bool {
        let seq_num = payload.seq_num;
        let height = self.buffer.height();
        if seq_num >= height.saturating_add(self.max_block_distance) {
            debug!(
                "Dropping block {} on {}: too far ahead of height {}",
                seq_num, self.channel, height
            );
            return false;
        }

        match self.buffer.push(payload) {
            Ok(size) => {
                trace!(
                    "Buffered block {} on {} ({} buffered)",
                    seq_num,
                    self.channel,
                    size
                );
                true
            }
            Err(e) => {
                debug!("Ignoring block {} on {}: {}", seq_num, self.channel, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ChannelMetrics;
    use std::time::Duration;

    fn handler(height: u64, capacity: usize) -> DisseminationHandler {
        let channel = ChannelId::from("testchainid");
        let metrics = ChannelMetrics::detached(&channel).unwrap();
        let buffer = Arc::new(PayloadBuffer::new(capacity, height, metrics));
        DisseminationHandler::new(channel, buffer, 20)
    }

    #[test]
    fn test_rejections_are_swallowed() {
        let h = handler(10, 2);
        assert!(h.handle(Payload::new(11, vec![])));
        assert!(!h.handle(Payload::new(11, vec![])));
        assert!(!h.handle(Payload::new(9, vec![])));
        assert!(h.handle(Payload::new(12, vec![])));
        assert!(!h.handle(Payload::new(13, vec![])));
        assert_eq!(h.buffer.size(), 2);
    }

    #[test]
    fn test_far_future_dropped() {
        let h = handler(10, 100);
        assert!(h.handle(Payload::new(29, vec![])));
        assert!(!h.handle(Payload::new(30, vec![])));
    }

    #[tokio::test]
    async fn test_run_pushes_until_stream_ends() {
        let h = handler(0, 10);
        let buffer = h.buffer.clone();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(h.run(rx, CancellationToken::new()));

        tx.send(Payload::new(2, vec![])).await.unwrap();
        tx.send(Payload::new(1, vec![])).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buffer.size(), 2);
    }

    #[tokio::test]
    async fn test_run_exits_on_cancel() {
        let h = handler(0, 10);
        let (_tx, rx) = mpsc::channel::<Payload>(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.run(rx, cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
