//! UTXO chain-state CLI Application
//!
//! A command-line interface for building and inspecting a chain state.

use clap::{Parser, Subcommand};
use utxo_chainstate::cli::{self, AppState, EngineOptions};
use utxo_chainstate::consensus::Network;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "chainstate")]
#[command(version = "0.1.0")]
#[command(about = "UTXO chain-state engine", long_about = None)]
struct Cli {
    /// Data directory for chain state storage
    #[arg(short, long, default_value = ".chainstate_data", global = true)]
    data_dir: PathBuf,

    /// Validation and look-ahead worker threads
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Skip script verification
    #[arg(long, global = true)]
    skip_scripts: bool,

    /// Log failed scripts instead of rejecting blocks
    #[arg(long, global = true)]
    ignore_script_errors: bool,

    /// Prune spent transactions, keeping this many blocks rollback-able
    #[arg(long, value_name = "KEEP_BLOCKS", global = true)]
    prune: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new chain state
    Init {
        /// Network parameters (regtest or mainnet)
        #[arg(short, long, default_value = "regtest")]
        network: Network,
    },

    /// Process blocks from a JSON file
    Import {
        /// JSON array of blocks
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Display chain state information
    Info,

    /// List unspent transactions
    Utxo {
        /// Maximum number of transactions to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Disconnect blocks from the tip
    Rollback {
        /// Number of blocks to disconnect
        #[arg(short, long, default_value = "1")]
        count: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let options = EngineOptions {
        workers: cli.workers,
        skip_scripts: cli.skip_scripts,
        ignore_script_errors: cli.ignore_script_errors,
        prune_keep_blocks: cli.prune,
    };

    // Handle init command separately (doesn't need loaded state)
    if let Commands::Init { network } = cli.command {
        return cli::cmd_init(&cli.data_dir, network, &options);
    }

    let mut state = AppState::load(cli.data_dir.clone(), &options)?;

    match cli.command {
        Commands::Init { .. } => unreachable!(),

        Commands::Import { file } => {
            // Ctrl-C cancels the block in progress and stops the import
            let rt = tokio::runtime::Runtime::new()?;
            let cancel = state.chain_state.cancel_token();
            rt.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupt received, cancelling import");
                    cancel.cancel();
                }
            });
            cli::cmd_import(&mut state, &file)?;
            rt.shutdown_background();
        }

        Commands::Info => {
            cli::cmd_info(&state)?;
        }

        Commands::Utxo { limit } => {
            cli::cmd_utxo(&state, limit)?;
        }

        Commands::Rollback { count } => {
            cli::cmd_rollback(&mut state, count)?;
        }
    }

    Ok(())
}
