//! chainpeer CLI Application
//!
//! Runs a header-syncing node and inspects its stored state.

use chainpeer::cli::{self, StartOptions, DEFAULT_DATA_DIR};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chainpeer")]
#[command(version)]
#[command(about = "A header-syncing Bitcoin-family P2P node", long_about = None)]
struct Cli {
    /// Data directory for peers and headers
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Start {
        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Network preset (bch, btc)
        #[arg(short, long)]
        network: Option<String>,

        /// Comma-separated peers to connect to
        #[arg(long)]
        peers: Option<String>,

        /// Resolve the network's DNS seeds at startup
        #[arg(long)]
        dns_seeds: bool,

        /// Our public IP, used to avoid connecting to ourselves
        #[arg(long)]
        external_ip: Option<String>,

        /// Block hash that must never enter the chain (repeatable)
        #[arg(long = "exclude-hash")]
        exclude_hashes: Vec<String>,

        /// Do not accept inbound connections
        #[arg(long)]
        no_listen: bool,

        /// Outbound connections to maintain
        #[arg(long)]
        max_outbound: Option<usize>,
    },

    /// Show stored sync state
    Info,

    /// List recent headers
    Headers {
        /// Number of headers to show
        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    /// List known peer addresses
    Peers {
        /// Number of peers to show
        #[arg(short, long, default_value = "20")]
        count: usize,
    },

    /// Hash a raw 80-byte header given as hex
    HeaderHash { hex: String },
}

fn main() -> cli::CliResult<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    match cli.command {
        Commands::Start {
            config,
            port,
            network,
            peers,
            dns_seeds,
            external_ip,
            exclude_hashes,
            no_listen,
            max_outbound,
        } => {
            let opts = StartOptions {
                config,
                data_dir: cli.data_dir,
                port,
                network,
                peers,
                dns_seeds,
                external_ip,
                exclude_hashes,
                no_listen,
                max_outbound,
            };
            let config = cli::node_config(&opts)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_start(config))?;
        }

        Commands::Info => {
            cli::cmd_info(&data_dir)?;
        }

        Commands::Headers { count } => {
            cli::cmd_headers(&data_dir, count)?;
        }

        Commands::Peers { count } => {
            cli::cmd_peers(&data_dir, count)?;
        }

        Commands::HeaderHash { hex } => {
            cli::cmd_header_hash(&hex)?;
        }
    }

    Ok(())
}
