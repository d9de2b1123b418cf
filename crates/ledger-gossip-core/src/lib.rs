//! Ledger Gossip Core Library
//!
//! This crate provides the core types and wire encoding shared by the
//! gossip-driven ledger state replication engine.
//!
//! # Modules
//!
//! - [`types`]: Core protocol types (ChannelId, Payload, PullRequest, etc.)
//! - [`wire`]: Versioned postcard encoding of gossip messages
//! - [`error`]: Error types

pub mod error;
pub mod types;
pub mod wire;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;
