//! Commit loop: drains the payload buffer into the ledger in strict order

use crate::buffer::PayloadBuffer;
use crate::engine::EngineError;
use crate::metrics::ChannelMetrics;
use crate::ports::{read_height, CommitError, Committer};
use ledger_gossip_core::{ChannelId, Payload};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Single committer of one channel. Exactly one commit is in flight at a time.
pub struct CommitLoop {
    channel: ChannelId,
    committer: Arc<dyn Committer>,
    buffer: Arc<PayloadBuffer>,
    metrics: ChannelMetrics,
    /// Committed height published after every successful commit
    height_tx: Arc<watch::Sender<u64>>,
    tick: Duration,
}

impl CommitLoop {
    pub fn new(
        channel: ChannelId,
        committer: Arc<dyn Committer>,
        buffer: Arc<PayloadBuffer>,
        metrics: ChannelMetrics,
        height_tx: Arc<watch::Sender<u64>>,
        tick: Duration,
    ) -> Self {
        Self {
            channel,
            committer,
            buffer,
            metrics,
            height_tx,
            tick,
        }
    }

    /// Run until cancelled or until the committer reports an irrecoverable failure
    pub async fn run(self, cancel: CancellationToken) -> Result<(), EngineError> {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Commit loop for {} running", self.channel);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.buffer.ready() => {}
                _ = ticker.tick() => {}
            }

            let committed = self.drain(&cancel).await?;
            if committed > 0 {
                debug!(
                    "Committed {} blocks on {} (height {})",
                    committed,
                    self.channel,
                    *self.height_tx.borrow()
                );
            }
        }

        info!("Commit loop for {} stopped", self.channel);
        Ok(())
    }

    /// Commit every contiguous buffered payload starting at the current height.
    ///
    /// Returns the number of blocks committed. A recoverable failure ends the
    /// drain with the payload still buffered.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<usize, EngineError> {
        let mut committed = 0;

        while !cancel.is_cancelled() {
            let height = match read_height(&self.committer).await {
                Ok(height) => height,
                Err(CommitError::Fatal(reason)) => return Err(self.fatal(reason)),
                Err(e) => {
                    warn!("Failed to read height of {}: {}", self.channel, e);
                    break;
                }
            };
            self.buffer.observe_height(height);
            self.publish_external(height);

            let Some(payload) = self.buffer.peek_next(height) else {
                break;
            };

            let started = Instant::now();
            match self.commit(payload).await {
                Ok(()) => {
                    self.metrics
                        .commit_duration
                        .observe(started.elapsed().as_secs_f64());
                    self.buffer.remove(height);

                    let new_height = height + 1;
                    self.metrics.height.set(new_height as f64);
                    self.buffer.observe_height(new_height);
                    self.height_tx.send_replace(new_height);
                    committed += 1;
                }
                Err(CommitError::Fatal(reason)) => return Err(self.fatal(reason)),
                Err(e) => {
                    warn!(
                        "Commit of block {} on {} failed, will retry: {}",
                        height, self.channel, e
                    );
                    break;
                }
            }
        }

        Ok(committed)
    }

    /// Publish a height the ledger reached without this loop committing
    fn publish_external(&self, height: u64) {
        let advanced = self.height_tx.send_if_modified(|current| {
            if *current < height {
                *current = height;
                true
            } else {
                false
            }
        });
        if advanced {
            self.metrics.height.set(height as f64);
        }
    }

    async fn commit(&self, payload: Payload) -> Result<(), CommitError> {
        let committer = self.committer.clone();
        let seq_num = payload.seq_num;
        debug!(
            "Committing block {} ({}) on {}",
            seq_num,
            payload.short_digest(),
            self.channel
        );

        match tokio::task::spawn_blocking(move || committer.commit(&payload)).await {
            Ok(result) => result,
            Err(e) => Err(CommitError::Fatal(format!(
                "commit of block {} aborted: {}",
                seq_num, e
            ))),
        }
    }

    fn fatal(&self, reason: String) -> EngineError {
        error!("Irrecoverable ledger failure on {}: {}", self.channel, reason);
        EngineError::CommitFatal {
            channel: self.channel.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use prometheus::Registry;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        buffer: Arc<PayloadBuffer>,
        metrics: ChannelMetrics,
        commit: CommitLoop,
        height_rx: watch::Receiver<u64>,
    }

    fn fixture(height: u64) -> Fixture {
        let channel = ChannelId::from("testchainid");
        let registry = Registry::new();
        let metrics = crate::metrics::StateMetrics::new(&registry)
            .unwrap()
            .channel(&channel);
        let ledger = Arc::new(MemoryLedger::with_height(height));
        let buffer = Arc::new(PayloadBuffer::new(100, height, metrics.clone()));
        let (height_tx, height_rx) = watch::channel(height);
        let commit = CommitLoop::new(
            channel,
            ledger.clone(),
            buffer.clone(),
            metrics.clone(),
            Arc::new(height_tx),
            Duration::from_millis(20),
        );
        Fixture {
            ledger,
            buffer,
            metrics,
            commit,
            height_rx,
        }
    }

    fn payload(seq_num: u64) -> Payload {
        Payload::new(seq_num, format!("block-{}", seq_num).into_bytes())
    }

    #[tokio::test]
    async fn test_single_commit_updates_metrics() {
        let f = fixture(100);
        f.buffer.push(payload(100)).unwrap();
        assert_eq!(f.metrics.payload_buffer_size.get(), 1.0);

        let committed = f.commit.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(committed, 1);
        assert_eq!(f.ledger.committed_seqs(), vec![100]);
        assert_eq!(f.metrics.height.get(), 101.0);
        assert_eq!(f.metrics.commit_duration.get_sample_count(), 1);
        assert_eq!(f.metrics.payload_buffer_size.get(), 0.0);
        assert_eq!(*f.height_rx.borrow(), 101);
    }

    #[tokio::test]
    async fn test_out_of_order_pushes_commit_in_order() {
        let f = fixture(101);
        for seq in [105, 101, 110, 103, 102, 108, 104, 107, 109, 106] {
            f.buffer.push(payload(seq)).unwrap();
        }

        let committed = f.commit.drain(&CancellationToken::new()).await.unwrap();
        assert_eq!(committed, 10);
        assert_eq!(f.ledger.committed_seqs(), (101..=110).collect::<Vec<_>>());
        assert_eq!(f.ledger.height().unwrap(), 111);
        assert!(f.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_drain_stops_at_gap() {
        let f = fixture(0);
        for seq in [0, 1, 3, 4] {
            f.buffer.push(payload(seq)).unwrap();
        }
        assert_eq!(f.commit.drain(&CancellationToken::new()).await.unwrap(), 2);
        assert_eq!(f.buffer.size(), 2);

        f.buffer.push(payload(2)).unwrap();
        assert_eq!(f.commit.drain(&CancellationToken::new()).await.unwrap(), 3);
        assert_eq!(f.ledger.committed_seqs(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_recoverable_failure_retains_payload() {
        let f = fixture(5);
        f.ledger.fail_next(1);
        f.buffer.push(payload(5)).unwrap();

        assert_eq!(f.commit.drain(&CancellationToken::new()).await.unwrap(), 0);
        assert!(f.buffer.contains(5));
        assert_eq!(f.metrics.commit_duration.get_sample_count(), 0);

        assert_eq!(f.commit.drain(&CancellationToken::new()).await.unwrap(), 1);
        assert_eq!(f.ledger.committed_seqs(), vec![5]);
        assert!(f.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_failure_escalates() {
        let f = fixture(0);
        f.ledger.fail_fatally("disk corrupted");
        f.buffer.push(payload(0)).unwrap();

        let err = f.commit.drain(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::CommitFatal { .. }));
        assert!(f.ledger.committed_seqs().is_empty());
    }

    #[tokio::test]
    async fn test_run_commits_on_readiness_and_stops_on_cancel() {
        let f = fixture(0);
        let cancel = CancellationToken::new();
        let buffer = f.buffer.clone();
        let ledger = f.ledger.clone();
        let mut height_rx = f.height_rx.clone();
        let handle = tokio::spawn(f.commit.run(cancel.clone()));

        buffer.push(payload(1)).unwrap();
        buffer.push(payload(0)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), height_rx.wait_for(|h| *h == 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ledger.committed_seqs(), vec![0, 1]);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
