//! Error types for ledger gossip

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger gossip error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Wire version byte not understood
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Empty input where a message was expected
    #[error("empty message")]
    Empty,

    /// Bytes left over after decoding a message
    #[error("trailing bytes after message: {0}")]
    TrailingBytes(usize),

    /// Pull range with `from_seq > to_seq`
    #[error("invalid range: {from_seq}..={to_seq}")]
    InvalidRange { from_seq: u64, to_seq: u64 },
}
