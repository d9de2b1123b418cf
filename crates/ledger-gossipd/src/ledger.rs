//! Committer implementations: a persistent sled ledger and an in-memory one

use crate::ports::{CommitError, Committer};
use ledger_gossip_core::{Bytes32, Payload};
use parking_lot::Mutex;
use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const KEY_HEIGHT: &[u8] = b"meta/height";
const KEY_TIP: &[u8] = b"meta/tip";
const BLOCK_PREFIX: &[u8] = b"b/";

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Ledger corrupted: {0}")]
    Corrupted(String),
}

impl From<LedgerError> for CommitError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Sled(e) => CommitError::Recoverable(e.to_string()),
            other => CommitError::Fatal(other.to_string()),
        }
    }
}

fn block_key(seq_num: u64) -> Vec<u8> {
    let mut key = BLOCK_PREFIX.to_vec();
    key.extend_from_slice(&seq_num.to_be_bytes());
    key
}

/// Hash chain over committed payload digests
fn chain(tip: &Bytes32, payload: &Payload) -> Bytes32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tip);
    hasher.update(&payload.digest());
    *hasher.finalize().as_bytes()
}

/// Persistent ledger of one channel backed by sled
///
/// Blocks live under `b/<seq_be>`; the height and a hash chain tip over all
/// committed blocks are kept under `meta/`. Every commit writes block, height
/// and tip in one atomic batch.
pub struct SledLedger {
    db: Db,
    /// Height and tip, serialised across commits
    state: Mutex<(u64, Bytes32)>,
    /// Height published after each applied batch; read without the commit lock
    height: AtomicU64,
}

impl SledLedger {
    /// Open the ledger at `path`, verifying the stored chain
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let db = sled::open(path)?;

        let height = match db.get(KEY_HEIGHT)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| LedgerError::Corrupted("malformed height".into()))?;
                u64::from_be_bytes(raw)
            }
            None => 0,
        };
        let stored_tip: Bytes32 = match db.get(KEY_TIP)? {
            Some(bytes) => bytes
                .as_ref()
                .try_into()
                .map_err(|_| LedgerError::Corrupted("malformed tip".into()))?,
            None => [0; 32],
        };

        let mut tip = [0; 32];
        for seq_num in 0..height {
            let bytes = db
                .get(block_key(seq_num))?
                .ok_or_else(|| LedgerError::Corrupted(format!("block {} missing", seq_num)))?;
            let payload: Payload = postcard::from_bytes(&bytes)?;
            if payload.seq_num != seq_num {
                return Err(LedgerError::Corrupted(format!(
                    "block {} stored under {}",
                    payload.seq_num, seq_num
                )));
            }
            tip = chain(&tip, &payload);
        }
        if tip != stored_tip {
            return Err(LedgerError::Corrupted("hash chain mismatch".into()));
        }

        Ok(Self {
            db,
            state: Mutex::new((height, tip)),
            height: AtomicU64::new(height),
        })
    }

    /// Get a committed block
    pub fn get(&self, seq_num: u64) -> Result<Option<Payload>, LedgerError> {
        match self.db.get(block_key(seq_num))? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Hash chain tip over all committed blocks
    pub fn tip(&self) -> Bytes32 {
        self.state.lock().1
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), LedgerError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Committer for SledLedger {
    fn commit(&self, payload: &Payload) -> Result<(), CommitError> {
        let mut state = self.state.lock();
        let (height, tip) = *state;
        if payload.seq_num != height {
            return Err(CommitError::Recoverable(format!(
                "block {} does not extend height {}",
                payload.seq_num, height
            )));
        }
        if self
            .db
            .contains_key(block_key(height))
            .map_err(LedgerError::from)?
        {
            return Err(CommitError::Fatal(format!(
                "block {} already stored above height",
                height
            )));
        }

        let value = postcard::to_allocvec(payload).map_err(LedgerError::from)?;
        let new_tip = chain(&tip, payload);
        let mut batch = sled::Batch::default();
        batch.insert(block_key(height), value);
        batch.insert(KEY_HEIGHT, (height + 1).to_be_bytes().to_vec());
        batch.insert(KEY_TIP, new_tip.to_vec());
        self.db.apply_batch(batch).map_err(LedgerError::from)?;

        *state = (height + 1, new_tip);
        self.height.store(height + 1, Ordering::Release);
        Ok(())
    }

    fn height(&self) -> Result<u64, CommitError> {
        Ok(self.height.load(Ordering::Acquire))
    }

    fn payloads_in_range(&self, from: u64, to: u64) -> Result<Vec<Payload>, CommitError> {
        if from > to {
            return Ok(Vec::new());
        }
        self.db
            .range(block_key(from)..=block_key(to))
            .map(|entry| -> Result<Payload, CommitError> {
                let (_, bytes) = entry.map_err(LedgerError::from)?;
                postcard::from_bytes(&bytes).map_err(|e| LedgerError::from(e).into())
            })
            .collect()
    }
}

#[derive(Default)]
struct MemoryState {
    height: u64,
    blocks: BTreeMap<u64, Payload>,
    failures_left: u32,
    fatal: Option<String>,
}

/// In-memory ledger with failure injection
///
/// A ledger created with [`MemoryLedger::with_height`] holds no blocks below
/// its starting height.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_height(height: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                height,
                ..MemoryState::default()
            }),
        }
    }

    /// Fail the next `n` commits with a recoverable error
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures_left = n;
    }

    /// Fail every following call with an irrecoverable error
    pub fn fail_fatally(&self, reason: &str) {
        self.state.lock().fatal = Some(reason.to_string());
    }

    /// Sequence numbers committed through this ledger, ascending
    pub fn committed_seqs(&self) -> Vec<u64> {
        self.state.lock().blocks.keys().copied().collect()
    }
}

impl Committer for MemoryLedger {
    fn commit(&self, payload: &Payload) -> Result<(), CommitError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.fatal {
            return Err(CommitError::Fatal(reason.clone()));
        }
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(CommitError::Recoverable("injected failure".into()));
        }
        if payload.seq_num != state.height {
            return Err(CommitError::Recoverable(format!(
                "block {} does not extend height {}",
                payload.seq_num, state.height
            )));
        }
        state.blocks.insert(payload.seq_num, payload.clone());
        state.height += 1;
        Ok(())
    }

    fn height(&self) -> Result<u64, CommitError> {
        let state = self.state.lock();
        match &state.fatal {
            Some(reason) => Err(CommitError::Fatal(reason.clone())),
            None => Ok(state.height),
        }
    }

    fn payloads_in_range(&self, from: u64, to: u64) -> Result<Vec<Payload>, CommitError> {
        if from > to {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        Ok(state.blocks.range(from..=to).map(|(_, p)| p.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(seq_num: u64) -> Payload {
        Payload::new(seq_num, format!("block-{}", seq_num).into_bytes())
    }

    #[test]
    fn test_sled_commit_and_read() {
        let dir = tempdir().unwrap();
        let ledger = SledLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.height().unwrap(), 0);

        for seq in 0..5 {
            ledger.commit(&payload(seq)).unwrap();
        }
        assert_eq!(ledger.height().unwrap(), 5);
        assert_eq!(ledger.get(3).unwrap(), Some(payload(3)));

        let range = ledger.payloads_in_range(1, 3).unwrap();
        assert_eq!(range, vec![payload(1), payload(2), payload(3)]);
        assert_eq!(ledger.payloads_in_range(4, 9).unwrap(), vec![payload(4)]);
    }

    #[test]
    fn test_sled_rejects_out_of_order() {
        let dir = tempdir().unwrap();
        let ledger = SledLedger::open(dir.path()).unwrap();
        let err = ledger.commit(&payload(1)).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(ledger.height().unwrap(), 0);
    }

    #[test]
    fn test_sled_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let tip = {
            let ledger = SledLedger::open(dir.path()).unwrap();
            for seq in 0..3 {
                ledger.commit(&payload(seq)).unwrap();
            }
            ledger.flush().unwrap();
            ledger.tip()
        };

        let ledger = SledLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.height().unwrap(), 3);
        assert_eq!(ledger.tip(), tip);
        ledger.commit(&payload(3)).unwrap();
    }

    #[test]
    fn test_sled_detects_tampered_block() {
        let dir = tempdir().unwrap();
        {
            let ledger = SledLedger::open(dir.path()).unwrap();
            for seq in 0..3 {
                ledger.commit(&payload(seq)).unwrap();
            }
            ledger.flush().unwrap();
        }
        {
            let db = sled::open(dir.path()).unwrap();
            let forged = postcard::to_allocvec(&Payload::new(1, b"forged".to_vec())).unwrap();
            db.insert(block_key(1), forged).unwrap();
            db.flush().unwrap();
        }

        assert!(matches!(
            SledLedger::open(dir.path()),
            Err(LedgerError::Corrupted(_))
        ));
    }

    #[test]
    fn test_sled_height_readable_during_commit() {
        let dir = tempdir().unwrap();
        let ledger = SledLedger::open(dir.path()).unwrap();
        ledger.commit(&payload(0)).unwrap();

        // a commit in progress holds the state lock
        let _guard = ledger.state.lock();
        assert_eq!(ledger.height().unwrap(), 1);
    }

    #[test]
    fn test_memory_failure_injection() {
        let ledger = MemoryLedger::with_height(7);
        ledger.fail_next(2);
        assert!(!ledger.commit(&payload(7)).unwrap_err().is_fatal());
        assert!(!ledger.commit(&payload(7)).unwrap_err().is_fatal());
        ledger.commit(&payload(7)).unwrap();
        assert_eq!(ledger.committed_seqs(), vec![7]);
        assert!(ledger.payloads_in_range(0, 6).unwrap().is_empty());

        ledger.fail_fatally("broken");
        assert!(ledger.commit(&payload(8)).unwrap_err().is_fatal());
        assert!(ledger.height().unwrap_err().is_fatal());
    }
}
