//! TSS CLI
//!
//! Drives keygen and keysign across a set of TSS nodes and checks that
//! every node reports the same result.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

/// TSS CLI - run threshold keygen and keysign against a node set.
#[derive(Parser, Debug)]
#[command(name = "tss-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TSS API URL of a node. Repeat once per node.
    #[arg(long = "node", global = true, default_value = "http://localhost:8080")]
    nodes: Vec<String>,

    /// Request timeout in seconds.
    #[arg(long, default_value = "120", global = true)]
    timeout: u64,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a pool key on every node.
    Keygen {
        /// Participant public key (hex). Repeat once per participant.
        #[arg(short, long = "key", required = true)]
        keys: Vec<String>,
    },

    /// Sign a message on every node.
    Keysign {
        /// Pool public key returned by keygen.
        #[arg(short, long)]
        pool_pub_key: String,

        /// Message digest, hex-encoded.
        #[arg(short, long)]
        message: String,

        /// Signer public key (hex). Repeat once per signer.
        #[arg(short, long = "signer", required = true)]
        signers: Vec<String>,
    },

    /// Ping nodes on their info port.
    Ping {
        /// Info URL of a node. Repeat once per node.
        #[arg(long = "info", required = true)]
        info: Vec<String>,
    },

    /// Show live and recent sessions of a node.
    Sessions {
        /// Info URL of the node.
        #[arg(long)]
        info: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose {
        Level::TRACE
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .init();

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(cli.timeout))
        .build()?;

    match cli.command {
        Commands::Keygen { keys } => {
            commands::keygen(&client, &cli.nodes, keys).await?;
        }
        Commands::Keysign {
            pool_pub_key,
            message,
            signers,
        } => {
            commands::keysign(&client, &cli.nodes, pool_pub_key, &message, signers).await?;
        }
        Commands::Ping { info } => {
            commands::ping(&client, &info).await?;
        }
        Commands::Sessions { info } => {
            commands::sessions(&client, &info).await?;
        }
    }

    Ok(())
}
