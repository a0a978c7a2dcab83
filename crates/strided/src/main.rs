//! strided — the Stride daemon binary.
//!
//! # Usage
//!
//! ```text
//! strided run --config /etc/stride/strided.toml
//! strided standalone --port 8443 --data-dir /var/lib/stride
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use stride_plugin::PluginRegistry;
use strided::config::{DaemonConfig, PluginConfig, PluginKind};
use strided::daemon::{self, STANDALONE_PLUGIN};

#[derive(Parser)]
#[command(name = "strided", about = "Stride progressive rollout daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run with a strided.toml configuration.
    Run {
        #[arg(long, default_value = "strided.toml")]
        config: PathBuf,
    },
    /// Run single-node with an in-memory workload plugin.
    Standalone {
        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/stride")]
        data_dir: PathBuf,

        /// Optional configuration for controller tuning and plugins.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,strided=debug,stride=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => {
            let config = DaemonConfig::from_file(&config)?;
            info!("Stride daemon starting");
            run(config).await
        }
        Command::Standalone {
            port,
            data_dir,
            config,
        } => {
            let mut config = match config {
                Some(path) => DaemonConfig::from_file(&path)?,
                None => DaemonConfig::default(),
            };
            config.server.port = port;
            config.server.data_dir = data_dir;
            if config.plugins.is_empty() {
                config.plugins.push(PluginConfig {
                    name: STANDALONE_PLUGIN.to_string(),
                    kind: PluginKind::Memory,
                    command: None,
                    args: vec![],
                    workloads: vec![],
                });
            }
            info!("Stride daemon starting in standalone mode");
            run(config).await
        }
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let store = daemon::open_store(&config)?;

    let registry = PluginRegistry::global();
    daemon::register_plugins(&registry, &config.plugins)?;
    if config.plugins.is_empty() {
        warn!("no resource plugins configured; every rollout will fail plugin lookup");
    }

    daemon::serve(config, store, Arc::clone(&registry), shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c; shutting down");
    }
}
