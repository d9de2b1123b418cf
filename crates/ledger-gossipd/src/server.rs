//! Peer-level host of channel engines

use crate::config::StateConfig;
use crate::engine::{ChannelEngine, ChannelHandle, ChannelStatus, EngineError};
use crate::metrics::StateMetrics;
use crate::ports::{Committer, Gossip};
use ledger_gossip_core::ChannelId;
use parking_lot::RwLock;
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Runs one independent state engine per joined channel
pub struct Server {
    config: StateConfig,
    gossip: Arc<dyn Gossip>,
    metrics: StateMetrics,
    channels: RwLock<HashMap<ChannelId, ChannelHandle>>,
}

impl Server {
    /// Create a server whose metrics are registered into `registry`
    pub fn new(
        config: StateConfig,
        gossip: Arc<dyn Gossip>,
        registry: &Registry,
    ) -> Result<Self, ServerError> {
        Ok(Self {
            config,
            gossip,
            metrics: StateMetrics::new(registry)?,
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// Start the engine of `channel` on top of `committer`.
    ///
    /// A channel whose previous engine has stopped may be joined again.
    pub fn join_channel(
        &self,
        channel: ChannelId,
        committer: Arc<dyn Committer>,
    ) -> Result<ChannelHandle, ServerError> {
        let mut channels = self.channels.write();
        if let Some(existing) = channels.get(&channel) {
            if existing.status() != ChannelStatus::Stopped {
                return Err(EngineError::AlreadyRunning(channel).into());
            }
        }

        let handle = ChannelEngine::start(
            channel.clone(),
            &self.config,
            committer,
            self.gossip.clone(),
            &self.metrics,
        )?;
        channels.insert(channel, handle.clone());
        Ok(handle)
    }

    pub fn channel(&self, channel: &ChannelId) -> Option<ChannelHandle> {
        self.channels.read().get(channel).cloned()
    }

    /// Joined channels, sorted
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop the engine of `channel` and forget it
    pub async fn leave_channel(&self, channel: &ChannelId) -> bool {
        let handle = self.channels.write().remove(channel);
        match handle {
            Some(handle) => {
                handle.shutdown().await;
                info!("Left channel {}", channel);
                true
            }
            None => false,
        }
    }

    /// Stop every channel engine
    pub async fn shutdown(&self) {
        let handles: Vec<ChannelHandle> = self.channels.read().values().cloned().collect();
        for handle in handles {
            handle.shutdown().await;
        }
        info!("Server stopped");
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        let channels = self.channels.read();
        let mut stats = ServerStats {
            channel_count: channels.len(),
            running: 0,
            failed: 0,
            buffered: 0,
            heights: Vec::with_capacity(channels.len()),
        };
        for (id, handle) in channels.iter() {
            match handle.status() {
                ChannelStatus::Running => stats.running += 1,
                ChannelStatus::Stopped if handle.error().is_some() => stats.failed += 1,
                _ => {}
            }
            stats.buffered += handle.buffer_len();
            stats.heights.push((id.clone(), handle.height()));
        }
        stats.heights.sort();
        stats
    }
}

/// Server statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub channel_count: usize,
    pub running: usize,
    pub failed: usize,
    /// Payloads buffered across all channels
    pub buffered: usize,
    pub heights: Vec<(ChannelId, u64)>,
}
