//! ledger-gossipd - gossip-driven ledger state replication
//!
//! Per channel, the engine provides:
//! - A bounded payload buffer ordering out-of-order deliveries
//! - A single in-order commit loop over a [`ports::Committer`]
//! - Dissemination and pull request/response handling over a [`ports::Gossip`]
//! - Anti-entropy recovery from lag and gaps
//! - Prometheus metrics per channel

pub mod anti_entropy;
pub mod buffer;
pub mod commit;
pub mod config;
pub mod dissemination;
pub mod engine;
pub mod ledger;
pub mod mesh;
pub mod metrics;
pub mod ports;
pub mod pull;
pub mod server;
pub mod simulation;

pub use buffer::{BufferError, PayloadBuffer};
pub use config::{Config, StateConfig};
pub use engine::{ChannelEngine, ChannelHandle, ChannelStatus, EngineError, Task};
pub use ledger::{MemoryLedger, SledLedger};
pub use mesh::LocalMesh;
pub use metrics::StateMetrics;
pub use ports::{CommitError, Committer, Gossip};
pub use server::Server;
