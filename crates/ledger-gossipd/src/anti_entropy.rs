//! Anti-entropy: lag and gap detection with pull-based recovery

use crate::buffer::PayloadBuffer;
use crate::config::StateConfig;
use crate::engine::EngineError;
use crate::ports::{read_height, Committer, Gossip};
use ledger_gossip_core::{ChannelId, GossipMessage, NetworkMember, PeerId, PullRequest};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a pull was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullTrigger {
    /// Best peer is at least `lag_threshold` blocks ahead
    Lag { target: u64, lag: u64 },
    /// Next-needed payload has been missing for at least `gap_timeout`
    Gap { waited: Duration },
}

/// Anti-entropy sync state for a peer
#[derive(Debug, Default)]
pub struct PeerSyncState {
    /// Last successful pull
    pub last_sync: Option<Instant>,
    /// Number of successful pulls
    pub sync_count: u64,
    /// Consecutive failures
    pub failures: u32,
}

/// Result of one anti-entropy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Up to date, or behind by less than the thresholds
    Idle,
    /// A pull was sent and the requested block arrived in time
    Recovered { peer: PeerId, request: PullRequest },
    /// A pull was sent but nothing arrived within `pull_timeout`
    TimedOut { peer: PeerId, request: PullRequest },
    Cancelled,
}

/// Anti-entropy loop of one channel. All peer bookkeeping is task-local.
pub struct AntiEntropy {
    channel: ChannelId,
    committer: Arc<dyn Committer>,
    gossip: Arc<dyn Gossip>,
    buffer: Arc<PayloadBuffer>,
    config: StateConfig,
    peers: HashMap<PeerId, PeerSyncState>,
    /// Height at which the next-needed payload was first seen missing
    gap: Option<(u64, Instant)>,
}

impl AntiEntropy {
    pub fn new(
        channel: ChannelId,
        committer: Arc<dyn Committer>,
        gossip: Arc<dyn Gossip>,
        buffer: Arc<PayloadBuffer>,
        config: StateConfig,
    ) -> Self {
        Self {
            channel,
            committer,
            gossip,
            buffer,
            config,
            peers: HashMap::new(),
            gap: None,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut lag_ticker = interval(self.config.anti_entropy_interval);
        lag_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let gap_period = (self.config.gap_timeout / 2).max(Duration::from_millis(1));
        let mut gap_ticker = interval(gap_period);
        gap_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let check_lag = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = lag_ticker.tick() => true,
                _ = gap_ticker.tick() => false,
            };

            if self.cycle(check_lag, &cancel).await == CycleOutcome::Cancelled {
                break;
            }
        }

        let stats = self.stats();
        info!(
            "Anti-entropy for {} stopped ({} peers, {} pulls served in time)",
            self.channel, stats.peer_count, stats.total_syncs
        );
    }

    /// Evaluate lag and gap once and pull if needed.
    ///
    /// With `check_lag == false` only the gap timeout is considered.
    pub async fn cycle(&mut self, check_lag: bool, cancel: &CancellationToken) -> CycleOutcome {
        let local = match read_height(&self.committer).await {
            Ok(height) => height,
            Err(e) => {
                warn!("Anti-entropy cannot read height of {}: {}", self.channel, e);
                return CycleOutcome::Idle;
            }
        };

        let members = self.gossip.peers_of_channel(&self.channel);
        self.forget_departed(&members);
        let Some(target) = members.iter().map(|m| m.ledger_height).max() else {
            self.gap = None;
            return CycleOutcome::Idle;
        };

        let Some(trigger) = self.evaluate(local, target, check_lag, Instant::now()) else {
            return CycleOutcome::Idle;
        };
        let Some(peer) = self.select_peer(&members, local) else {
            return CycleOutcome::Idle;
        };
        let request = self.request_for(local, target);
        if self.buffer.contains(request.from_seq) {
            debug!(
                "Block {} of {} already buffered, not pulling",
                request.from_seq, self.channel
            );
            return CycleOutcome::Idle;
        }
        debug!(
            "Pulling {}..={} of {} from {} ({:?})",
            request.from_seq, request.to_seq, self.channel, peer, trigger
        );

        let outcome = match self.pull(peer, request.clone(), cancel).await {
            Ok(true) => {
                self.record_success(&peer);
                CycleOutcome::Recovered { peer, request }
            }
            Ok(false) => CycleOutcome::Cancelled,
            Err(e) => {
                warn!("{} on {}", e, self.channel);
                self.record_failure(&peer);
                CycleOutcome::TimedOut { peer, request }
            }
        };

        // space out gap-triggered retries
        if let Some((height, _)) = self.gap {
            self.gap = Some((height, Instant::now()));
        }
        outcome
    }

    /// Decide whether a pull is due.
    pub fn evaluate(
        &mut self,
        local: u64,
        target: u64,
        check_lag: bool,
        now: Instant,
    ) -> Option<PullTrigger> {
        if target <= local {
            self.gap = None;
            return None;
        }

        let waited = if self.buffer.contains(local) {
            self.gap = None;
            Duration::ZERO
        } else {
            match self.gap {
                Some((height, since)) if height == local => now.saturating_duration_since(since),
                _ => {
                    self.gap = Some((local, now));
                    Duration::ZERO
                }
            }
        };

        let lag = target - local;
        if check_lag && lag >= self.config.lag_threshold {
            return Some(PullTrigger::Lag { target, lag });
        }
        if waited >= self.config.gap_timeout {
            return Some(PullTrigger::Gap { waited });
        }
        None
    }

    /// Prefer the highest-reporting peer; after `max_retries` consecutive
    /// failures against it, pick a random other peer that is ahead of us.
    pub fn select_peer(&mut self, members: &[NetworkMember], local: u64) -> Option<PeerId> {
        let ahead: Vec<&NetworkMember> = members.iter().filter(|m| m.ledger_height > local).collect();
        let best = ahead.iter().max_by_key(|m| m.ledger_height)?.peer_id;

        let best_failures = self.peers.get(&best).map(|s| s.failures).unwrap_or(0);
        if best_failures < self.config.max_retries || ahead.len() < 2 {
            return Some(best);
        }

        let others: Vec<PeerId> = ahead
            .iter()
            .map(|m| m.peer_id)
            .filter(|id| *id != best)
            .collect();
        let fallback = *others.choose(&mut rand::thread_rng())?;
        debug!(
            "Best peer {} failed {} times, falling back to {}",
            best, best_failures, fallback
        );
        // give the best peer another chance on the next cycle
        if let Some(state) = self.peers.get_mut(&best) {
            state.failures = 0;
        }
        Some(fallback)
    }

    /// `[local, min(local + batch_size, target) - 1]`
    pub fn request_for(&self, local: u64, target: u64) -> PullRequest {
        let end = local.saturating_add(self.config.batch_size).min(target);
        PullRequest {
            channel: self.channel.clone(),
            from_seq: local,
            to_seq: end.saturating_sub(1).max(local),
        }
    }

    /// Send a request and wait, bounded by `pull_timeout`, until the first
    /// requested block is buffered or committed.
    ///
    /// Only buffer changes made after the request was sent count.
    ///
    /// `Ok(false)` means the wait was cancelled.
    async fn pull(
        &self,
        peer: PeerId,
        request: PullRequest,
        cancel: &CancellationToken,
    ) -> Result<bool, EngineError> {
        let from_seq = request.from_seq;
        let mut changes = self.buffer.subscribe();
        self.gossip
            .send(GossipMessage::PullRequest(request), &[peer]);

        let buffer = self.buffer.clone();
        let progress = async move {
            loop {
                if changes.changed().await.is_err() {
                    return false;
                }
                if buffer.height() > from_seq || buffer.contains(from_seq) {
                    return true;
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(false),
            result = tokio::time::timeout(self.config.pull_timeout, progress) => match result {
                Ok(true) => Ok(true),
                _ => Err(EngineError::PullTimeout { peer, from_seq }),
            },
        }
    }

    fn forget_departed(&mut self, members: &[NetworkMember]) {
        self.peers
            .retain(|id, _| members.iter().any(|m| m.peer_id == *id));
    }

    fn record_success(&mut self, peer: &PeerId) {
        let state = self.peers.entry(*peer).or_default();
        state.last_sync = Some(Instant::now());
        state.sync_count += 1;
        state.failures = 0;
    }

    fn record_failure(&mut self, peer: &PeerId) {
        self.peers.entry(*peer).or_default().failures += 1;
    }

    /// Get sync statistics
    pub fn stats(&self) -> AntiEntropyStats {
        AntiEntropyStats {
            peer_count: self.peers.len(),
            total_syncs: self.peers.values().map(|s| s.sync_count).sum(),
            failing_peers: self.peers.values().filter(|s| s.failures > 0).count(),
        }
    }
}

/// Anti-entropy statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiEntropyStats {
    pub peer_count: usize,
    pub total_syncs: u64,
    pub failing_peers: usize,
}
