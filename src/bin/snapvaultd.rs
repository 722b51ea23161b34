use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use snapvault::config::{NodeConfig, DEFAULT_CONFIG_PATH};
use snapvault::logging::{init_logging, LogFormat};
use snapvault::server::{shutdown_signal, Daemon};
use snapvault::streaming::ShutdownSignal;
use snapvault::transport;

/// snapvault daemon: serves pushes, pulls and recoveries from configured remotes.
#[derive(Parser, Debug)]
#[command(name = "snapvaultd", version, about)]
struct Cli {
    /// Node configuration file
    #[arg(short, long, env = "SNAPVAULT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    // The daemon logs sessions at info by default.
    init_logging(cli.verbose.saturating_add(1), format)?;

    let config = NodeConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let (trigger, shutdown) = ShutdownSignal::new();
    let ctx = config.session_context(&config.responder_state_dir(), shutdown)?;
    let listener = transport::bind(config.bind_addr).await?;
    let daemon = Daemon::new(ctx, listener, config.timeouts.shutdown_grace());

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = trigger.send(true);
    });

    daemon.run().await
}
