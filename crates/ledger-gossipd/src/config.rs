//! Configuration for ledger-gossipd

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// ledger-gossipd - local multi-peer ledger replication simulation
#[derive(Parser, Debug, Clone)]
#[command(name = "ledger-gossipd")]
#[command(about = "Gossip-driven ledger state replication daemon")]
pub struct Config {
    /// Data directory for sled-backed ledgers (in-memory ledgers if omitted)
    #[arg(short, long, env = "LEDGER_GOSSIP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Ledger channels to replicate (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "testchainid")]
    pub channels: Vec<String>,

    /// Number of simulated peers per channel (peer 0 produces blocks)
    #[arg(long, default_value = "4")]
    pub peers: usize,

    /// Number of blocks the producer disseminates per channel
    #[arg(long, default_value = "200")]
    pub blocks: u64,

    /// Delay between produced blocks in milliseconds
    #[arg(long, default_value = "10")]
    pub block_interval_ms: u64,

    /// Probability that a broadcast delivery is dropped (0.0-1.0)
    #[arg(long, default_value = "0.2")]
    pub drop_rate: f64,

    /// Give up waiting for replication after this many seconds
    #[arg(long, default_value = "120")]
    pub timeout_secs: u64,

    /// JSON file with engine settings (see `StateConfig`)
    #[arg(long, env = "LEDGER_GOSSIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override: maximum buffered payloads per channel
    #[arg(long)]
    pub buffer_capacity: Option<usize>,

    /// Override: anti-entropy interval in milliseconds
    #[arg(long)]
    pub anti_entropy_interval_ms: Option<u64>,

    /// Override: pull request timeout in milliseconds
    #[arg(long)]
    pub pull_timeout_ms: Option<u64>,

    /// Override: height gap that triggers a pull
    #[arg(long)]
    pub lag_threshold: Option<u64>,

    /// Override: maximum range of a single pull request
    #[arg(long)]
    pub batch_size: Option<u64>,

    /// Override: max wait for the next-needed payload in milliseconds
    #[arg(long)]
    pub gap_timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() || self.channels.iter().any(|c| c.trim().is_empty()) {
            anyhow::bail!("Channel names cannot be empty");
        }
        if self.peers < 2 {
            anyhow::bail!("Simulation needs at least 2 peers");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("Timeout must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.drop_rate) {
            anyhow::bail!("Drop rate must be within 0.0..=1.0");
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("Log format must be json or pretty");
        }
        Ok(())
    }

    /// Build the engine settings: file (if any), then command-line overrides.
    pub fn state_config(&self) -> anyhow::Result<StateConfig> {
        let mut state = match &self.config {
            Some(path) => StateConfig::from_file(path)?,
            None => StateConfig::default(),
        };

        if let Some(v) = self.buffer_capacity {
            state.buffer_capacity = v;
        }
        if let Some(v) = self.anti_entropy_interval_ms {
            state.anti_entropy_interval = Duration::from_millis(v);
        }
        if let Some(v) = self.pull_timeout_ms {
            state.pull_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.lag_threshold {
            state.lag_threshold = v;
        }
        if let Some(v) = self.batch_size {
            state.batch_size = v;
        }
        if let Some(v) = self.gap_timeout_ms {
            state.gap_timeout = Duration::from_millis(v);
        }

        state.validate()?;
        Ok(state)
    }
}

/// Per-channel engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Max buffered payloads before new ones are rejected
    pub buffer_capacity: usize,
    /// Period of the anti-entropy lag check
    #[serde(rename = "anti_entropy_interval_ms", with = "duration_ms")]
    pub anti_entropy_interval: Duration,
    /// Bound on waiting for a pull response
    #[serde(rename = "pull_timeout_ms", with = "duration_ms")]
    pub pull_timeout: Duration,
    /// Height gap to the best peer that triggers a pull
    pub lag_threshold: u64,
    /// Max sequence numbers per pull request
    pub batch_size: u64,
    /// Max wait for the next-needed payload before forcing a pull
    #[serde(rename = "gap_timeout_ms", with = "duration_ms")]
    pub gap_timeout: Duration,
    /// Consecutive failures against the best peer before falling back to a random one
    pub max_retries: u32,
    /// Commit loop wake-up period when no readiness signal arrives
    #[serde(rename = "commit_tick_ms", with = "duration_ms")]
    pub commit_tick: Duration,
    /// Broadcast payloads further than this ahead of the height are dropped
    pub max_block_distance: u64,
    /// Depth of the subscription streams created by gossip adapters
    pub channel_buffer_size: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 200,
            anti_entropy_interval: Duration::from_secs(10),
            pull_timeout: Duration::from_secs(10),
            lag_threshold: 1,
            batch_size: 10,
            gap_timeout: Duration::from_secs(5),
            max_retries: 3,
            commit_tick: Duration::from_secs(1),
            max_block_distance: 100,
            channel_buffer_size: 100,
        }
    }
}

impl StateConfig {
    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Validate settings
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_capacity == 0 {
            anyhow::bail!("buffer_capacity must be positive");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.lag_threshold == 0 {
            anyhow::bail!("lag_threshold must be positive");
        }
        if self.anti_entropy_interval.is_zero()
            || self.pull_timeout.is_zero()
            || self.gap_timeout.is_zero()
            || self.commit_tick.is_zero()
        {
            anyhow::bail!("Intervals and timeouts must be non-zero");
        }
        if self.channel_buffer_size == 0 {
            anyhow::bail!("channel_buffer_size must be positive");
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
