//! Prometheus metrics for state replication
//!
//! Metrics are registered into a caller-supplied [`Registry`] and handed to
//! each channel engine at construction; nothing here is process-global.

use ledger_gossip_core::ChannelId;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Metric families shared by all channels of one registry
#[derive(Clone)]
pub struct StateMetrics {
    payload_buffer_size: GaugeVec,
    height: GaugeVec,
    commit_duration: HistogramVec,
}

impl StateMetrics {
    /// Create the metric families and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let payload_buffer_size = GaugeVec::new(
            Opts::new("payload_buffer_size", "Number of payloads waiting to be committed"),
            &["channel"],
        )?;
        let height = GaugeVec::new(
            Opts::new("ledger_height", "Committed ledger height"),
            &["channel"],
        )?;
        let commit_duration = HistogramVec::new(
            HistogramOpts::new("commit_duration_seconds", "Time spent committing a block")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["channel"],
        )?;

        registry.register(Box::new(payload_buffer_size.clone()))?;
        registry.register(Box::new(height.clone()))?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            payload_buffer_size,
            height,
            commit_duration,
        })
    }

    /// Metric handles labelled for one channel
    pub fn channel(&self, channel: &ChannelId) -> ChannelMetrics {
        let label = [channel.as_str()];
        ChannelMetrics {
            payload_buffer_size: self.payload_buffer_size.with_label_values(&label),
            height: self.height.with_label_values(&label),
            commit_duration: self.commit_duration.with_label_values(&label),
        }
    }
}

/// Per-channel metric handles
#[derive(Clone)]
pub struct ChannelMetrics {
    pub payload_buffer_size: Gauge,
    pub height: Gauge,
    pub commit_duration: Histogram,
}

impl ChannelMetrics {
    /// Handles bound to a private registry, for components built in isolation
    pub fn detached(channel: &ChannelId) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        Ok(StateMetrics::new(&registry)?.channel(channel))
    }
}

/// Gathers all metrics of `registry` in Prometheus text format.
pub fn gather(registry: &Registry) -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}
