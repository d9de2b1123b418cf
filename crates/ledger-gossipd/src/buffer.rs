//! Sequence-ordered staging buffer for not-yet-committed payloads

use crate::metrics::ChannelMetrics;
use ledger_gossip_core::Payload;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::{watch, Notify};

/// Buffer insertion errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Stale payload {seq_num} (height {height})")]
    StalePayload { seq_num: u64, height: u64 },
    #[error("Duplicate payload {0}")]
    DuplicatePayload(u64),
    #[error("Buffer full ({0} payloads)")]
    BufferFull(usize),
    #[error("Buffer closed")]
    Closed,
}

#[derive(Debug, Default)]
struct BufferState {
    payloads: BTreeMap<u64, Payload>,
    /// Last committed height observed; sequence numbers below it are stale
    height: u64,
    closed: bool,
}

/// Concurrency-safe payload buffer shared by the tasks of one channel.
///
/// Invariants:
/// - every key is `>= height` at insertion time
/// - at most one payload per sequence number
/// - `len() <= capacity`, except that the payload for `height` itself is
///   always admitted so a full buffer can never block the next commit
pub struct PayloadBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    /// Fired when the next-needed payload becomes available
    ready: Notify,
    /// Bumped on every insertion and height change
    changes: watch::Sender<u64>,
    metrics: ChannelMetrics,
}

impl PayloadBuffer {
    pub fn new(capacity: usize, height: u64, metrics: ChannelMetrics) -> Self {
        let (changes, _) = watch::channel(0);
        metrics.payload_buffer_size.set(0.0);
        Self {
            state: Mutex::new(BufferState {
                height,
                ..Default::default()
            }),
            capacity,
            ready: Notify::new(),
            changes,
            metrics,
        }
    }

    /// Insert a payload, returning the new buffer size
    pub fn push(&self, payload: Payload) -> Result<usize, BufferError> {
        let seq_num = payload.seq_num;
        let (size, is_next) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(BufferError::Closed);
            }
            if seq_num < state.height {
                return Err(BufferError::StalePayload {
                    seq_num,
                    height: state.height,
                });
            }
            if state.payloads.contains_key(&seq_num) {
                return Err(BufferError::DuplicatePayload(seq_num));
            }
            let is_next = seq_num == state.height;
            if state.payloads.len() >= self.capacity && !is_next {
                return Err(BufferError::BufferFull(state.payloads.len()));
            }

            state.payloads.insert(seq_num, payload);
            let size = state.payloads.len();
            self.metrics.payload_buffer_size.set(size as f64);
            (size, is_next)
        };

        if is_next {
            self.ready.notify_one();
        }
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
        Ok(size)
    }

    /// Payload whose sequence number equals `height`, left in place
    pub fn peek_next(&self, height: u64) -> Option<Payload> {
        self.state.lock().payloads.get(&height).cloned()
    }

    /// Remove a payload after its commit was confirmed
    pub fn remove(&self, seq_num: u64) -> Option<Payload> {
        let mut state = self.state.lock();
        let removed = state.payloads.remove(&seq_num);
        if removed.is_some() {
            self.metrics
                .payload_buffer_size
                .set(state.payloads.len() as f64);
        }
        removed
    }

    /// Record a newly observed committed height and drop entries it made stale
    pub fn observe_height(&self, height: u64) {
        let next_present = {
            let mut state = self.state.lock();
            if height <= state.height {
                return;
            }
            state.height = height;
            let before = state.payloads.len();
            state.payloads = state.payloads.split_off(&height);
            if state.payloads.len() != before {
                self.metrics
                    .payload_buffer_size
                    .set(state.payloads.len() as f64);
            }
            state.payloads.contains_key(&height)
        };

        if next_present {
            self.ready.notify_one();
        }
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Wait until a push makes the next-needed payload available.
    ///
    /// A notification sent while nobody waits is kept for the next caller.
    pub async fn ready(&self) {
        self.ready.notified().await
    }

    /// Receiver that changes whenever the buffer accepts a payload or the height moves
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Reject further pushes and drop everything buffered
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.payloads.clear();
        self.metrics.payload_buffer_size.set(0.0);
    }

    pub fn contains(&self, seq_num: u64) -> bool {
        self.state.lock().payloads.contains_key(&seq_num)
    }

    /// Last committed height observed by the buffer
    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    pub fn size(&self) -> usize {
        self.state.lock().payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Bound on buffered payloads. The payload at the current height is
    /// admitted even when full, so `size()` can reach `capacity() + 1`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
