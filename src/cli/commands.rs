//! CLI commands for the chain state
//!
//! Implements all command handlers for the CLI interface.

use crate::chainstate::{ChainStateConfig, MemoryChainState, ValidationConfig};
use crate::consensus::{ChainParams, Network, COIN};
use crate::core::{Block, BlockStatus, StandardScriptVerifier};
use crate::storage::{PrunerConfig, SnapshotStorage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Engine flags shared by every command
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub workers: Option<usize>,
    pub skip_scripts: bool,
    pub ignore_script_errors: bool,
    pub prune_keep_blocks: Option<u32>,
}

impl EngineOptions {
    pub fn config(&self) -> ChainStateConfig {
        let mut validation = ValidationConfig {
            validate_scripts: !self.skip_scripts,
            ignore_script_errors: self.ignore_script_errors,
            ..Default::default()
        };
        let mut config = ChainStateConfig::default();
        if let Some(workers) = self.workers {
            validation.worker_threads = workers;
            config = config.with_lookahead_workers(workers);
        }
        config = config.with_validation(validation);
        if let Some(keep) = self.prune_keep_blocks {
            config = config.with_pruning(PrunerConfig::keep(keep));
        }
        config
    }
}

/// Application state
pub struct AppState {
    pub chain_state: MemoryChainState,
    pub storage: SnapshotStorage,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Load the chain state saved in `data_dir`
    pub fn load(data_dir: PathBuf, options: &EngineOptions) -> CliResult<Self> {
        let storage = SnapshotStorage::in_dir(&data_dir)?;
        if !storage.exists() {
            return Err(format!(
                "No chain state at {:?}. Run `chainstate init` first",
                data_dir
            )
            .into());
        }

        println!("📂 Loading chain state...");
        let snapshot = storage.load()?;
        let params = ChainParams::for_network(snapshot.network);
        let chain_state = MemoryChainState::from_snapshot(
            params,
            options.config(),
            Arc::new(StandardScriptVerifier),
            snapshot,
        )?;

        Ok(Self {
            chain_state,
            storage,
            data_dir,
        })
    }

    /// Save the current state
    pub fn save(&self) -> CliResult<()> {
        self.storage.save(&self.chain_state.snapshot())?;
        Ok(())
    }
}

/// Initialize a new chain state
pub fn cmd_init(data_dir: &Path, network: Network, options: &EngineOptions) -> CliResult<()> {
    let storage = SnapshotStorage::in_dir(data_dir)?;

    if storage.exists() {
        println!("⚠️  Chain state already exists at {:?}", data_dir);
        println!("   Delete the directory to reinitialize");
        return Ok(());
    }

    let chain_state = MemoryChainState::new(
        ChainParams::for_network(network),
        options.config(),
        Arc::new(StandardScriptVerifier),
    )?;
    storage.save(&chain_state.snapshot())?;

    println!("✅ Chain state initialized!");
    println!("   📁 Data directory: {:?}", data_dir);
    println!("   🌐 Network: {}", network);
    println!("   🧱 Genesis block hash: {}", chain_state.tip().hash);

    Ok(())
}

/// Process a JSON array of blocks, then save
pub fn cmd_import(state: &mut AppState, file: &Path) -> CliResult<()> {
    let content = fs::read_to_string(file)?;
    let blocks: Vec<Block> = serde_json::from_str(&content)?;

    println!("📥 Importing {} block(s) from {:?}", blocks.len(), file);

    let mut connected = 0usize;
    let mut side = 0usize;
    let mut orphaned = 0usize;
    let mut duplicates = 0usize;
    let mut rejected = 0usize;
    let mut cancelled = false;

    for block in blocks {
        let hash = block.hash();
        match state.chain_state.process_block(block) {
            Ok(BlockStatus::AddedToMainChain) => connected += 1,
            Ok(BlockStatus::AddedToSideChain) => side += 1,
            Ok(BlockStatus::AddedAsOrphan) => orphaned += 1,
            Ok(BlockStatus::Duplicate) => duplicates += 1,
            Ok(BlockStatus::CausedReorg {
                disconnected,
                connected: reconnected,
            }) => {
                println!(
                    "   🔀 Reorganization at {}: -{} +{}",
                    hash, disconnected, reconnected
                );
                connected += 1;
            }
            Err(e) if e.is_cancelled() => {
                cancelled = true;
                break;
            }
            Err(e) if e.is_validation() || e.is_malformed_body() => {
                println!("   ❌ Rejected {}: {}", hash, e);
                rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    state.save()?;

    if cancelled {
        println!("\n⏹️  Import cancelled, committed blocks were saved");
    } else {
        println!("\n✅ Import complete");
    }
    println!("   ├─ Main chain: {}", connected);
    println!("   ├─ Side chain: {}", side);
    println!("   ├─ Orphans: {}", orphaned);
    println!("   ├─ Duplicates: {}", duplicates);
    println!("   ├─ Rejected: {}", rejected);
    println!("   └─ Height: {}", state.chain_state.height());

    Ok(())
}

/// Show chain state information
pub fn cmd_info(state: &AppState) -> CliResult<()> {
    let engine = &state.chain_state;
    let tip = engine.tip();
    let counters = engine.counters()?;

    println!("⛓️  Chain State Information");
    println!("   ├─ Network: {}", engine.params().network);
    println!("   ├─ Height: {}", engine.height());
    println!("   ├─ Tip: {}", tip.hash);
    println!("   ├─ Tip time: {}", tip.header.time);
    println!("   ├─ Total work: {}", tip.total_work);
    println!("   ├─ Unspent transactions: {}", counters.unspent_tx_count);
    println!("   ├─ Unspent outputs: {}", counters.unspent_output_count);
    println!("   ├─ Transactions: {}", counters.total_tx_count);
    println!("   ├─ Inputs: {}", counters.total_input_count);
    println!("   ├─ Outputs: {}", counters.total_output_count);
    match engine.prune_state().pruned_to {
        Some(height) => println!("   └─ Pruned to: {}", height),
        None => println!("   └─ Pruned to: -"),
    }

    Ok(())
}

/// List unspent transactions
pub fn cmd_utxo(state: &AppState, limit: usize) -> CliResult<()> {
    let unspent = state.chain_state.unspent_transactions(limit)?;

    if unspent.is_empty() {
        println!("📭 No unspent transactions");
        return Ok(());
    }

    println!("💰 Unspent transactions:");
    for tx in &unspent {
        let kind = if tx.is_coinbase { " (coinbase)" } else { "" };
        println!(
            "   └─ {} @ {}:{} - {}/{} unspent{}",
            tx.tx_hash,
            tx.block_index,
            tx.tx_index,
            tx.output_states.unspent_count(),
            tx.output_count(),
            kind
        );
        if let Some(outputs) = &tx.tx_outputs {
            for (index, output) in outputs.iter().enumerate() {
                println!(
                    "      {}: {}.{:08} coins",
                    index,
                    output.value / COIN,
                    output.value % COIN
                );
            }
        }
    }
    if unspent.len() == limit {
        println!("   ... limited to {}", limit);
    }

    Ok(())
}

/// Disconnect blocks from the tip
pub fn cmd_rollback(state: &mut AppState, count: u32) -> CliResult<()> {
    println!("⏪ Rolling back {} block(s)", count);

    for _ in 0..count {
        match state.chain_state.disconnect_tip() {
            Ok(header) => println!("   └─ Disconnected {} at {}", header.hash, header.height),
            Err(e) => {
                state.save()?;
                return Err(e.into());
            }
        }
    }

    state.save()?;
    println!("✅ Height is now {}", state.chain_state.height());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChainedHeader, Transaction};
    use crate::test_util::mine_block;
    use chrono::Utc;
    use tempfile::TempDir;

    fn options() -> EngineOptions {
        EngineOptions {
            workers: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_options_map_to_config() {
        let config = EngineOptions {
            workers: Some(3),
            skip_scripts: true,
            ignore_script_errors: true,
            prune_keep_blocks: Some(10),
        }
        .config();

        assert!(config.validation.validate_transactions);
        assert!(!config.validation.validate_scripts);
        assert!(config.validation.ignore_script_errors);
        assert_eq!(config.validation.worker_threads, 3);
        assert_eq!(config.lookahead_workers, 3);
        assert!(config.pruning.enabled);
        assert_eq!(config.pruning.keep_blocks, 10);
    }

    #[test]
    fn test_load_requires_init() {
        let dir = TempDir::new().unwrap();
        assert!(AppState::load(dir.path().to_path_buf(), &options()).is_err());
    }

    #[test]
    fn test_init_import_rollback() {
        let dir = TempDir::new().unwrap();
        cmd_init(dir.path(), Network::Regtest, &options()).unwrap();

        let mut state = AppState::load(dir.path().to_path_buf(), &options()).unwrap();
        let mut parent = state.chain_state.tip().clone();
        let mut blocks = Vec::new();
        for height in 1..=3 {
            let coinbase = Transaction::coinbase(height, 50 * COIN, vec![]);
            let block = mine_block(&parent, vec![coinbase]);
            parent = ChainedHeader::from_parent(&parent, block.header.clone(), Utc::now());
            blocks.push(block);
        }

        let file = dir.path().join("blocks.json");
        fs::write(&file, serde_json::to_string(&blocks).unwrap()).unwrap();
        cmd_import(&mut state, &file).unwrap();
        assert_eq!(state.chain_state.height(), 3);

        cmd_rollback(&mut state, 2).unwrap();
        let reloaded = AppState::load(dir.path().to_path_buf(), &options()).unwrap();
        assert_eq!(reloaded.chain_state.height(), 1);
        assert_eq!(reloaded.chain_state.counters().unwrap().unspent_tx_count, 1);
    }
}
