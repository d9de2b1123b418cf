//! Local multi-peer replication run over a lossy in-process mesh
//!
//! Peer 0 produces blocks: it commits them to its own ledger and
//! disseminates them. Every other peer must reach the same height through
//! dissemination and pull-based recovery alone.

use crate::config::{Config, StateConfig};
use crate::ledger::{MemoryLedger, SledLedger};
use crate::mesh::{LocalMesh, MeshEndpoint, MeshStats};
use crate::metrics;
use crate::ports::Committer;
use crate::server::{Server, ServerError};
use ledger_gossip_core::{ChannelId, Payload, PeerId};
use prometheus::Registry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Simulation errors
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::ledger::LedgerError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("Producer commit of block {seq_num} on {channel} failed: {reason}")]
    Produce {
        channel: ChannelId,
        seq_num: u64,
        reason: String,
    },
}

struct SimPeer {
    endpoint: Arc<MeshEndpoint>,
    server: Server,
    registry: Registry,
    /// Ledgers by channel, in `Config::channels` order
    ledgers: Vec<Arc<dyn Committer>>,
    sled: Vec<Arc<SledLedger>>,
}

/// Final heights of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel: ChannelId,
    /// Committed height of every peer, producer first
    pub heights: Vec<u64>,
    pub converged: bool,
}

/// Outcome of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub channels: Vec<ChannelReport>,
    pub mesh: MeshStats,
    pub elapsed: Duration,
}

impl SimulationReport {
    pub fn converged(&self) -> bool {
        self.channels.iter().all(|c| c.converged)
    }
}

pub struct Simulation {
    config: Config,
    channels: Vec<ChannelId>,
    mesh: LocalMesh,
    peers: Vec<SimPeer>,
}

impl Simulation {
    /// Build every peer and start its channel engines
    pub fn start(config: Config, state: StateConfig) -> Result<Self, SimulationError> {
        let channels: Vec<ChannelId> = config.channels.iter().map(ChannelId::new).collect();
        let mesh = LocalMesh::new(config.drop_rate, state.channel_buffer_size);

        let mut peers = Vec::with_capacity(config.peers);
        for index in 0..config.peers {
            let endpoint = Arc::new(mesh.endpoint(PeerId::random()));
            let registry = Registry::new();
            let server = Server::new(state.clone(), endpoint.clone(), &registry)?;

            let mut ledgers = Vec::with_capacity(channels.len());
            let mut sled = Vec::new();
            for channel in &channels {
                let ledger: Arc<dyn Committer> = match &config.data_dir {
                    Some(dir) => {
                        let path = dir.join(format!("peer-{}", index)).join(channel.as_str());
                        let ledger = Arc::new(SledLedger::open(&path)?);
                        sled.push(ledger.clone());
                        ledger
                    }
                    None => Arc::new(MemoryLedger::new()),
                };
                endpoint.join(channel, ledger.clone());
                server.join_channel(channel.clone(), ledger.clone())?;
                ledgers.push(ledger);
            }

            debug!("Peer {} is {}", index, endpoint.peer_id());
            peers.push(SimPeer {
                endpoint,
                server,
                registry,
                ledgers,
                sled,
            });
        }

        info!(
            "Started {} peers on {} channel(s), drop rate {}",
            peers.len(),
            channels.len(),
            config.drop_rate
        );
        Ok(Self {
            config,
            channels,
            mesh,
            peers,
        })
    }

    /// Produce blocks, wait for replication, then stop every peer
    pub async fn run(self) -> Result<SimulationReport, SimulationError> {
        let started = Instant::now();
        self.produce().await?;

        let deadline = started + Duration::from_secs(self.config.timeout_secs);
        let channels = self.await_replication(deadline).await;
        let report = SimulationReport {
            channels,
            mesh: self.mesh.stats(),
            elapsed: started.elapsed(),
        };

        for peer in &self.peers {
            peer.server.shutdown().await;
            for ledger in &peer.sled {
                if let Err(e) = ledger.flush() {
                    warn!("Failed to flush ledger: {}", e);
                }
            }
        }
        Ok(report)
    }

    /// Height of the producer's ledger of the channel at `index`
    fn target(&self, index: usize) -> u64 {
        self.peers
            .first()
            .and_then(|p| p.ledgers[index].height().ok())
            .unwrap_or(0)
    }

    async fn produce(&self) -> Result<(), SimulationError> {
        let Some(producer) = self.peers.first() else {
            return Ok(());
        };
        let interval = Duration::from_millis(self.config.block_interval_ms);

        for _ in 0..self.config.blocks {
            for (channel, ledger) in self.channels.iter().zip(&producer.ledgers) {
                let seq_num = ledger.height().map_err(|e| produce_error(channel, 0, e))?;
                let payload = Payload::new(
                    seq_num,
                    format!("{}:block-{}", channel, seq_num).into_bytes(),
                );
                ledger
                    .commit(&payload)
                    .map_err(|e| produce_error(channel, seq_num, e))?;
                producer.endpoint.disseminate(channel, payload);
            }
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }

        info!("Produced {} blocks per channel", self.config.blocks);
        Ok(())
    }

    async fn await_replication(&self, deadline: Instant) -> Vec<ChannelReport> {
        let mut reports = Vec::with_capacity(self.channels.len());
        for (index, channel) in self.channels.iter().enumerate() {
            let target = self.target(index);
            let mut heights = Vec::with_capacity(self.peers.len());
            for peer in &self.peers {
                if let Some(handle) = peer.server.channel(channel) {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !handle.wait_for_height(target, remaining).await {
                        warn!(
                            "{} on {} stuck at {} of {}",
                            peer.endpoint.peer_id(),
                            channel,
                            handle.height(),
                            target
                        );
                    }
                }
                heights.push(peer.ledgers[index].height().unwrap_or(0));
            }

            let converged = heights.iter().all(|h| *h == target);
            info!("Channel {} heights {:?} (target {})", channel, heights, target);
            reports.push(ChannelReport {
                channel: channel.clone(),
                heights,
                converged,
            });
        }
        reports
    }

    /// Prometheus text exposition of one peer's metrics; empty for an unknown peer
    pub fn metrics(&self, peer: usize) -> Result<Vec<u8>, prometheus::Error> {
        match self.peers.get(peer) {
            Some(p) => metrics::gather(&p.registry),
            None => Ok(Vec::new()),
        }
    }

    /// Registry of one peer; it stays readable after the run
    pub fn registry(&self, peer: usize) -> Option<Registry> {
        self.peers.get(peer).map(|p| p.registry.clone())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

fn produce_error(
    channel: &ChannelId,
    seq_num: u64,
    e: crate::ports::CommitError,
) -> SimulationError {
    SimulationError::Produce {
        channel: channel.clone(),
        seq_num,
        reason: e.to_string(),
    }
}
