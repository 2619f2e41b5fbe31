//! Coordinator binary

use clap::{Parser, Subcommand};
use rangeshift::{common::Config, Coordinator};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rangeshift-coord")]
#[command(about = "rangeshift migration coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and its in-process shards
    Serve {
        /// Config file (TOML); `rangeshift.toml` when omitted
        #[arg(long)]
        config: Option<String>,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for the admin API
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Metadata and shard data directory; in-memory when unset
        #[arg(long)]
        db: Option<PathBuf>,

        /// Shard ids hosted in-process (comma-separated)
        #[arg(long, value_delimiter = ',')]
        shards: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            db,
            shards,
        } => {
            // File and environment first, flags win
            let mut config = match config {
                Some(path) => Config::load_from(&path)?,
                None => Config::load(),
            };
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.coordinator.bind_addr = bind;
            }
            if db.is_some() {
                config.coordinator.db_path = db;
            }
            if !shards.is_empty() {
                config.cluster.shards = shards;
            }
            config.validate()?;

            Coordinator::new(config).serve().await?;
        }
    }

    Ok(())
}
