//! slicedd: the sliced daemon.
//!
//! Single binary that assembles the membership and slot-ownership
//! engine:
//! - State store and Raft log (redb)
//! - Metadata Raft group (openraft)
//! - Member status reporter
//! - Segment roller and provisioner
//! - Rebalancer
//!
//! # Usage
//!
//! ```text
//! slicedd init --id node-1 --host 10.0.0.1 > sliced.toml
//! slicedd run --config sliced.toml
//! ```

mod node;
mod tasks;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sliced_core::NodeConfig;

const DEFAULT_FILTER: &str = "info,slicedd=debug,sliced=debug";

#[derive(Parser)]
#[command(name = "slicedd", about = "sliced cluster daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node.
    Run {
        /// Node configuration file.
        #[arg(long, default_value = "sliced.toml")]
        config: PathBuf,

        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Bootstrap a new cluster from this node.
        #[arg(long)]
        bootstrap: bool,
    },
    /// Print a minimal single-node configuration.
    Init {
        #[arg(long)]
        id: String,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
}

fn init_tracing(config: Option<&NodeConfig>) {
    let logging = config.and_then(|c| c.logging.as_ref());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = logging
            .and_then(|l| l.filter.as_deref())
            .unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    });

    if logging.and_then(|l| l.json).unwrap_or(false) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            bootstrap,
        } => {
            let mut config = NodeConfig::from_file(&config)?;
            if let Some(dir) = data_dir {
                config.storage.get_or_insert_with(Default::default).data_dir = Some(dir);
            }
            if bootstrap {
                config.node.bootstrap = Some(true);
            }
            init_tracing(Some(&config));
            node::run(config).await
        }
        Command::Init { id, host } => {
            init_tracing(None);
            print!("{}", NodeConfig::scaffold(&id, &host).to_toml_string()?);
            Ok(())
        }
    }
}
