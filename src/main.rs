use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use switchboard::config::SwitchboardConfig;
use switchboard::store::CallStore;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version, about = "Call processing orchestrator")]
pub struct Cli {
    /// Path to the config file (defaults to switchboard.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator service
    Serve {
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind all interfaces and enable permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// Print aggregate metrics from the call store
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| Some(PathBuf::from("switchboard.toml")));
    let mut config = SwitchboardConfig::load(config_path.as_deref())?;

    match cli.command {
        Commands::Serve { port, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if dev {
                config.server.dev_mode = true;
            }
            switchboard::server::start_server(config).await
        }
        Commands::Status => {
            let store = CallStore::new(&config.server.db_path)
                .context("Failed to open call store")?;
            let metrics = store.metrics()?;
            println!("calls: {}", metrics.total_calls);
            println!("awaiting approval: {}", metrics.awaiting_approval);
            println!("dispatched effects: {}", metrics.dispatched_effects);
            let mut statuses: Vec<_> = metrics.by_status.iter().collect();
            statuses.sort();
            for (status, count) in statuses {
                println!("  {}: {}", status, count);
            }
            if let Some(avg) = metrics.avg_time_to_decision_secs {
                println!("avg time to decision: {:.1}s", avg);
            }
            Ok(())
        }
    }
}
