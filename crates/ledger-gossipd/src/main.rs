//! ledger-gossipd - local ledger replication simulation
//!
//! Runs a set of peers over a lossy in-process mesh: one peer produces
//! blocks, the others replicate them through dissemination and pulls.
//! Prints the final heights and the Prometheus metrics of the last peer.

use clap::Parser;
use ledger_gossipd::config::Config;
use ledger_gossipd::simulation::Simulation;
use std::io::Write;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let default_level = if config.verbose {
        "ledger_gossipd=debug"
    } else {
        "ledger_gossipd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<bool> {
    let state = config.state_config()?;
    let sim = Simulation::start(config, state)?;
    let observer = sim.peer_count().saturating_sub(1);
    let registry = sim.registry(observer);

    let report = sim.run().await?;
    for channel in &report.channels {
        info!(
            "{}: heights {:?}, converged: {}",
            channel.channel, channel.heights, channel.converged
        );
    }
    info!(
        "Mesh delivered {} and dropped {} messages in {:.2?}",
        report.mesh.delivered, report.mesh.dropped, report.elapsed
    );

    if let Some(registry) = registry {
        let text = ledger_gossipd::metrics::gather(&registry)?;
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&text)?;
        stdout.flush()?;
    }

    Ok(report.converged())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config);

    info!(
        "ledger-gossipd v{} - gossip ledger replication",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("Replication did not converge");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Simulation failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
