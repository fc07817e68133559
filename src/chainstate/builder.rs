//! Chain state engine
//!
//! Owns the chain-state cursor, the header index and the orphan pool. Every
//! block apply or rollback runs inside one cursor transaction that is
//! committed whole or rolled back whole; the rest of the engine only moves
//! once that transaction has committed.

use crate::chainstate::config::ChainStateConfig;
use crate::chainstate::error::{collapse_results, ChainStateError, MissingData};
use crate::chainstate::lookahead::warm_transactions;
use crate::chainstate::tx_loader::{LoadingTx, TxLoader};
use crate::chainstate::utxo_builder::UtxoBuilder;
use crate::chainstate::validator::BlockValidator;
use crate::consensus::params::ChainParams;
use crate::core::block::Block;
use crate::core::chain::{Chain, ChainError, Direction};
use crate::core::chain_builder::ChainBuilder;
use crate::core::chain_state::{BlockStatus, BlockTreeSnapshot, HeaderIndex, OrphanPool};
use crate::core::chained_header::ChainedHeader;
use crate::core::script::ScriptVerifier;
use crate::core::unspent::UnspentTx;
use crate::crypto::Hash256;
use crate::merkle::merkle_root_from_nodes;
use crate::storage::block_txes::{BlockTxesStorage, MemoryBlockTxesStorage};
use crate::storage::cursor::{ChainStateCounters, ChainStateCursor, StorageError};
use crate::storage::memory::{MemoryChainStateCursor, MemoryChainStateStorage};
use crate::storage::persistence::ChainStateSnapshot;
use crate::storage::pool::CursorPool;
use crate::storage::pruning::{prune_block, PruneState, Pruner};
use chrono::Utc;
use crossbeam_channel::bounded;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;

/// A chain-state backend that hands out cursors
pub trait ChainStateStorage: Send + Sync {
    type Cursor: ChainStateCursor + 'static;

    fn open_cursor(&self) -> Self::Cursor;
}

impl ChainStateStorage for MemoryChainStateStorage {
    type Cursor = MemoryChainStateCursor;

    fn open_cursor(&self) -> MemoryChainStateCursor {
        self.cursor()
    }
}

/// Blocks moved while following the best chain
#[derive(Debug, Default)]
struct SyncOutcome {
    disconnected: u32,
    connected: u32,
    rejected: Vec<(Hash256, ChainStateError)>,
}

pub struct ChainStateBuilder<S: ChainStateStorage> {
    params: Arc<ChainParams>,
    config: ChainStateConfig,
    storage: S,
    cursor: S::Cursor,
    pool: CursorPool<S::Cursor>,
    block_txes: Arc<dyn BlockTxesStorage>,
    validator: BlockValidator,
    chain: ChainBuilder,
    header_index: Arc<RwLock<HeaderIndex>>,
    orphans: OrphanPool,
    pruner: Pruner,
    cancel: CancellationToken,
}

impl<S: ChainStateStorage> ChainStateBuilder<S> {
    /// Open the chain state in `storage`, writing the genesis block if it is empty
    pub fn open(
        params: ChainParams,
        config: ChainStateConfig,
        storage: S,
        block_txes: Arc<dyn BlockTxesStorage>,
        script_verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self, ChainStateError> {
        let params = Arc::new(params);
        let mut cursor = storage.open_cursor();

        cursor.begin_transaction(true)?;
        let stored = cursor.chain_tip().and_then(|tip| Ok((tip, cursor.read_headers()?)));
        cursor.rollback_transaction()?;
        let (tip, headers) = stored?;

        let chain = match tip {
            Some(tip) => Self::rebuild_chain(&params, tip, headers)?,
            None => Self::initialize(&params, &mut cursor, block_txes.as_ref())?,
        };

        let mut index = HeaderIndex::new(chain.genesis_header().clone());
        for header in chain.headers().iter().skip(1) {
            index.insert(header.clone());
        }

        let pool = CursorPool::new(config.cursor_pool_size, || storage.open_cursor());
        let validator = BlockValidator::new(
            Arc::clone(&params),
            config.validation.clone(),
            script_verifier,
        )?;

        log::info!(
            "Opened {} chain state at height {} ({})",
            params.network,
            chain.height(),
            chain.tip().hash
        );

        Ok(Self {
            orphans: OrphanPool::new(config.max_orphan_blocks),
            pruner: Pruner::new(config.pruning.clone()),
            params,
            config,
            storage,
            cursor,
            pool,
            block_txes,
            validator,
            chain: ChainBuilder::from_chain(&chain),
            header_index: Arc::new(RwLock::new(index)),
            cancel: CancellationToken::new(),
        })
    }

    fn initialize(
        params: &ChainParams,
        cursor: &mut S::Cursor,
        block_txes: &dyn BlockTxesStorage,
    ) -> Result<Chain, ChainStateError> {
        let genesis_block = &params.genesis_block;
        let genesis = ChainedHeader::genesis(&genesis_block.header, Utc::now());

        block_txes.try_add_block_transactions(genesis.hash, &genesis_block.transactions)?;

        cursor.begin_transaction(false)?;
        let written = cursor
            .try_add_header(genesis.clone())
            .and_then(|_| cursor.set_chain_tip(genesis.clone()));
        match written {
            Ok(()) => cursor.commit_transaction()?,
            Err(e) => {
                cursor.rollback_transaction()?;
                return Err(e.into());
            }
        }

        log::info!("Initialized chain state with genesis {}", genesis.hash);
        Ok(Chain::genesis(genesis))
    }

    fn rebuild_chain(
        params: &ChainParams,
        tip: ChainedHeader,
        headers: Vec<ChainedHeader>,
    ) -> Result<Chain, ChainStateError> {
        let by_hash: HashMap<Hash256, ChainedHeader> =
            headers.into_iter().map(|header| (header.hash, header)).collect();

        let mut path = Vec::new();
        let mut current = tip;
        while !current.is_genesis() {
            let parent = by_hash.get(&current.previous_hash()).cloned().ok_or_else(|| {
                ChainStateError::StorageCorrupt(format!(
                    "header {} has no stored parent",
                    current.hash
                ))
            })?;
            path.push(current);
            if path.len() > by_hash.len() {
                return Err(ChainStateError::StorageCorrupt("header chain has a cycle".into()));
            }
            current = parent;
        }
        path.push(current);
        path.reverse();

        if path[0].hash != params.genesis_hash() {
            return Err(ChainStateError::StorageCorrupt(format!(
                "stored genesis {} is not the {} genesis",
                path[0].hash, params.network
            )));
        }
        Chain::new(path).map_err(|e| ChainStateError::StorageCorrupt(e.to_string()))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ChainStateConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn block_txes(&self) -> &Arc<dyn BlockTxesStorage> {
        &self.block_txes
    }

    pub fn chain(&self) -> Chain {
        self.chain.to_immutable()
    }

    pub fn tip(&self) -> &ChainedHeader {
        self.chain.tip()
    }

    pub fn height(&self) -> u32 {
        self.chain.height()
    }

    pub fn header_index(&self) -> &Arc<RwLock<HeaderIndex>> {
        &self.header_index
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn prune_state(&self) -> &PruneState {
        &self.pruner.state
    }

    pub fn restore_prune_state(&mut self, state: PruneState) {
        self.pruner = Pruner::with_state(self.config.pruning.clone(), state);
    }

    /// Known headers, invalid and unreachable marks, and pending orphans
    pub fn block_tree_snapshot(&self) -> BlockTreeSnapshot {
        let mut tree = self.header_index.read().to_tree();
        tree.orphans = self.orphans.orphans();
        tree
    }

    /// Replace the header index and orphan pool with a saved block tree.
    ///
    /// An empty tree keeps the index rebuilt from the connected chain.
    pub fn restore_block_tree(&mut self, tree: BlockTreeSnapshot) -> Result<(), ChainStateError> {
        if tree.headers.is_empty() {
            return Ok(());
        }
        let mut index = HeaderIndex::restore(&tree)
            .map_err(|e| ChainStateError::StorageCorrupt(format!("saved block tree: {}", e)))?;

        let chain = self.chain.to_immutable();
        if !index.contains(&chain.genesis_header().hash) {
            return Err(ChainStateError::StorageCorrupt(format!(
                "saved block tree does not start at genesis {}",
                chain.genesis_header().hash
            )));
        }
        for header in chain.headers() {
            if index.is_invalid(&header.hash) {
                return Err(ChainStateError::StorageCorrupt(format!(
                    "connected block {} is marked invalid",
                    header.hash
                )));
            }
            index.insert(header.clone());
        }

        let mut orphans = OrphanPool::new(self.config.max_orphan_blocks);
        for orphan in tree.orphans {
            if let Err(e) = self.validator.check_body(&orphan.block) {
                log::warn!("Dropping saved orphan: {}", e);
                continue;
            }
            orphans.add(orphan.block, orphan.received_at);
        }

        log::info!(
            "Restored {} headers and {} orphans",
            index.len(),
            orphans.len()
        );
        *self.header_index.write() = index;
        self.orphans = orphans;
        Ok(())
    }

    /// Recompute the merkle root of every stored body and compare it with its header
    pub fn verify_block_bodies(&self) -> Result<(), ChainStateError> {
        let headers: Vec<(Hash256, Hash256)> = self
            .header_index
            .read()
            .to_tree()
            .headers
            .iter()
            .map(|header| (header.hash, header.header.merkle_root))
            .collect();

        for (hash, merkle_root) in headers {
            let Some(nodes) = self.block_txes.try_read_block_transactions(&hash)? else {
                continue;
            };
            let root = merkle_root_from_nodes(nodes).map_err(|e| {
                ChainStateError::StorageCorrupt(format!("body of block {}: {}", hash, e))
            })?;
            if root != merkle_root {
                return Err(ChainStateError::StorageCorrupt(format!(
                    "body of block {} does not match its merkle root",
                    hash
                )));
            }
        }
        Ok(())
    }

    /// Token that cancels in-flight and future work of this engine
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `read` against a pooled cursor inside a read-only transaction
    pub fn read<T, F>(&self, read: F) -> Result<T, ChainStateError>
    where
        F: FnOnce(&S::Cursor) -> Result<T, StorageError>,
    {
        let mut cursor = self.pool.acquire(self.config.cursor_timeout)?;
        cursor.begin_transaction(true)?;
        let result = read(&*cursor);
        cursor.rollback_transaction()?;
        Ok(result?)
    }

    pub fn counters(&self) -> Result<ChainStateCounters, ChainStateError> {
        self.read(|cursor| cursor.counters())
    }

    pub fn unspent_transactions(&self, limit: usize) -> Result<Vec<UnspentTx>, ChainStateError> {
        self.read(|cursor| Ok(cursor.read_unspent_transactions()?.take(limit).collect()))
    }

    /// Reassemble a stored block; fails with missing data once any body is pruned
    pub fn load_block(&self, hash: &Hash256) -> Result<Block, ChainStateError> {
        let header = self
            .header_index
            .read()
            .get(hash)
            .map(|header| header.header.clone())
            .ok_or(MissingData::Header(*hash))?;
        let nodes = self
            .block_txes
            .try_read_block_transactions(hash)?
            .ok_or(MissingData::BlockTransactions(*hash))?;

        let mut transactions = Vec::with_capacity(nodes.len());
        for (position, node) in nodes.iter().enumerate() {
            if !node.is_leaf() || node.index as usize != position {
                return Err(MissingData::BlockTransactions(*hash).into());
            }
            let tx = node
                .transaction()
                .ok_or(MissingData::BlockTransactions(*hash))?
                .map_err(StorageError::from)?;
            transactions.push(tx);
        }
        Ok(Block::new(header, transactions))
    }

    // =========================================================================
    // Connect / disconnect
    // =========================================================================

    /// Connect `block` on top of the current tip
    pub fn add_block(&mut self, block: &Block) -> Result<ChainedHeader, ChainStateError> {
        let parent = self.chain.tip().clone();
        if block.header.previous_hash != parent.hash {
            return Err(ChainError::NotExtendingTip {
                hash: block.hash(),
                height: parent.height + 1,
                tip: parent.hash,
            }
            .into());
        }
        self.validator.check_header(block)?;
        self.validator.check_body(block)?;

        let hash = block.hash();
        self.block_txes
            .try_add_block_transactions(hash, &block.transactions)?;
        self.header_index.write().insert(ChainedHeader::from_parent(
            &parent,
            block.header.clone(),
            Utc::now(),
        ));

        let connected = self.connect_block(block);
        if matches!(&connected, Err(e) if e.is_validation()) {
            self.reject_branch(&hash);
        }
        connected
    }

    /// Mark `hash` and its descendants invalid and drop their bodies
    fn reject_branch(&mut self, hash: &Hash256) {
        let invalidated = self.header_index.write().mark_invalid(hash);
        for hash in invalidated {
            if let Err(e) = self.block_txes.try_remove_block_transactions(&hash) {
                log::warn!("Failed to drop body of invalid block {}: {}", hash, e);
            }
        }
    }

    fn connect_block(&mut self, block: &Block) -> Result<ChainedHeader, ChainStateError> {
        let hash = block.hash();
        let parent = self.chain.to_immutable();
        let header = match self.header_index.read().get(&hash) {
            Some(header) => header.clone(),
            None => ChainedHeader::from_parent(parent.tip(), block.header.clone(), Utc::now()),
        };

        let mut extended = self.chain.clone();
        extended.add_block(header.clone())?;
        let chain = extended.to_immutable();

        let block_cancel = self.cancel.child_token();
        self.cursor.begin_transaction(false)?;
        match self.apply_block(&parent, &chain, block, &block_cancel) {
            Ok(()) => self.cursor.commit_transaction()?,
            Err(e) => {
                if let Err(rollback) = self.cursor.rollback_transaction() {
                    log::error!("Failed to roll back block {}: {}", hash, rollback);
                }
                log::warn!("Rejected block {} at height {}: {}", hash, header.height, e);
                return Err(e);
            }
        }

        self.chain = extended;
        log::info!(
            "Connected block {} at height {} ({} transactions)",
            hash,
            header.height,
            block.transactions.len()
        );

        // The block is committed; a failed prune is retried on a later block
        if let Err(e) = self.prune_if_due() {
            log::error!("Pruning after block {} failed: {}", hash, e);
        }
        Ok(header)
    }

    /// Validate and apply `block` at the tip of `chain` inside the open write transaction
    fn apply_block(
        &mut self,
        parent: &Chain,
        chain: &Chain,
        block: &Block,
        cancel: &CancellationToken,
    ) -> Result<(), ChainStateError> {
        let block_hash = chain.tip().hash;
        let height = chain.tip().height;
        let workers = self.config.lookahead_workers;
        let capacity = self.config.lookahead_capacity;
        let validate_transactions = self.validator.config().validate_transactions;

        let (loading_tx, loading_rx) = bounded::<LoadingTx>(capacity.max(1));
        let loader = TxLoader::new(
            block_hash,
            Arc::new(block.transactions.clone()),
            Arc::clone(&self.block_txes),
        );
        let validator = &self.validator;
        let pool = self.pool.clone();
        let cursor_timeout = self.config.cursor_timeout;
        let inline = self.config.inline_unspent_outputs;
        let cursor = &mut self.cursor;

        let changes = thread::scope(|scope| {
            let validation_cancel = cancel.clone();
            let validation = thread::Builder::new()
                .name("block-validator".into())
                .spawn_scoped(scope, move || {
                    let result = if validate_transactions {
                        loader
                            .load_all(loading_rx, workers, capacity, validation_cancel.clone())
                            .and_then(|loaded| {
                                validator.validate_block(parent, block, loaded, &validation_cancel)
                            })
                    } else {
                        drop(loading_rx);
                        validator.validate_block(parent, block, std::iter::empty(), &validation_cancel)
                    };
                    if result.is_err() {
                        validation_cancel.cancel();
                    }
                    result
                })
                .map_err(|e| ChainStateError::Pipeline(format!("failed to spawn validator: {}", e)))?;

            let changes = warm_transactions(
                block.transactions.clone(),
                pool,
                workers,
                capacity,
                cursor_timeout,
                cancel.clone(),
            )
            .and_then(|warmed| {
                UtxoBuilder::new(cursor, inline).calculate_utxo(
                    chain,
                    warmed,
                    validate_transactions.then_some(&loading_tx),
                    cancel,
                )
            });
            if changes.is_err() {
                cancel.cancel();
            }
            drop(loading_tx);

            let validated = validation
                .join()
                .unwrap_or_else(|_| Err(ChainStateError::Pipeline("validator thread panicked".into())));
            collapse_results(changes, validated)
        })?;

        let spent_count = changes.spent_txes.len();
        if !self.cursor.try_add_block_spent_txes(height, changes.spent_txes)? {
            return Err(ChainStateError::StorageCorrupt(format!(
                "spent-tx log of height {} already exists",
                height
            )));
        }
        if !self
            .cursor
            .try_add_block_unminted_txes(block_hash, changes.unminted_txes)?
        {
            return Err(ChainStateError::StorageCorrupt(format!(
                "unminted-tx log of block {} already exists",
                block_hash
            )));
        }
        if !self.cursor.try_add_header(chain.tip().clone())? {
            return Err(ChainStateError::StorageCorrupt(format!(
                "header {} is already stored",
                block_hash
            )));
        }
        self.cursor.set_chain_tip(chain.tip().clone())?;

        log::debug!(
            "Applied block {}: {} transactions, {} fully spent",
            block_hash,
            block.transactions.len(),
            spent_count
        );
        Ok(())
    }

    /// Roll back the current tip
    pub fn disconnect_tip(&mut self) -> Result<ChainedHeader, ChainStateError> {
        let chain = self.chain.to_immutable();
        let tip = chain.tip().clone();
        if tip.is_genesis() {
            return Err(ChainError::RemoveGenesis.into());
        }
        if self.pruner.state.is_pruned(tip.height) {
            return Err(MissingData::RollbackData { height: tip.height }.into());
        }
        let block = self.load_block(&tip.hash)?;

        self.cursor.begin_transaction(false)?;
        match self.rollback_block(&chain, &block) {
            Ok(()) => self.cursor.commit_transaction()?,
            Err(e) => {
                if let Err(rollback) = self.cursor.rollback_transaction() {
                    log::error!("Failed to roll back disconnect of {}: {}", tip.hash, rollback);
                }
                log::warn!("Failed to disconnect block {}: {}", tip.hash, e);
                return Err(e);
            }
        }

        self.chain.remove_block()?;
        log::info!("Disconnected block {} at height {}", tip.hash, tip.height);
        Ok(tip)
    }

    fn rollback_block(&mut self, chain: &Chain, block: &Block) -> Result<(), ChainStateError> {
        let tip = chain.tip();
        let height = tip.height;
        let missing = || -> ChainStateError {
            ChainStateError::StorageCorrupt(format!("rollback data of block {} is missing", tip.hash))
        };

        let spent_txes = self
            .cursor
            .try_get_block_spent_txes(height)?
            .ok_or_else(missing)?;
        let unminted_txes = self
            .cursor
            .try_get_block_unminted_txes(&tip.hash)?
            .ok_or_else(missing)?;

        UtxoBuilder::new(&mut self.cursor, self.config.inline_unspent_outputs).rollback_utxo(
            chain,
            &block.transactions,
            &spent_txes,
            &unminted_txes,
            self.block_txes.as_ref(),
        )?;

        self.cursor.try_remove_block_spent_txes(height)?;
        self.cursor.try_remove_block_unminted_txes(&tip.hash)?;
        self.cursor.try_remove_header(&tip.hash)?;
        let parent = chain.get(height - 1).ok_or_else(missing)?;
        self.cursor.set_chain_tip(parent.clone())?;
        Ok(())
    }

    fn prune_if_due(&mut self) -> Result<(), ChainStateError> {
        let Some(range) = self.pruner.on_new_block(self.chain.height()) else {
            return Ok(());
        };
        let chain = self.chain.to_immutable();
        for height in range.iter() {
            self.cursor.begin_transaction(false)?;
            match prune_block(&mut self.cursor, self.block_txes.as_ref(), &chain, height) {
                Ok(pruned) => {
                    self.cursor.commit_transaction()?;
                    self.pruner.record_prune(height, pruned);
                }
                Err(e) => {
                    self.cursor.rollback_transaction()?;
                    return Err(e.into());
                }
            }
        }
        log::info!(
            "Pruned rollback data of {} blocks (heights {}..{})",
            range.count(),
            range.start,
            range.end
        );
        Ok(())
    }

    // =========================================================================
    // Block processing
    // =========================================================================

    /// Accept a block from anywhere in the tree and follow the best chain
    pub fn process_block(&mut self, block: Block) -> Result<BlockStatus, ChainStateError> {
        let hash = block.hash();
        {
            let index = self.header_index.read();
            if index.is_invalid(&hash) {
                return Err(ChainStateError::validation(hash, "Block was previously rejected"));
            }
            if index.contains(&hash) {
                return Ok(BlockStatus::Duplicate);
            }
        }
        self.validator.check_body(&block).inspect_err(|e| {
            log::warn!("Dropped block {}: {}", hash, e);
        })?;
        if self.orphans.contains(&hash) {
            return Ok(BlockStatus::Duplicate);
        }

        let parent = block.header.previous_hash;
        if !self.header_index.read().contains(&parent) {
            log::debug!("Holding orphan block {} until {} arrives", hash, parent);
            self.orphans.add(block, now_secs());
            return Ok(BlockStatus::AddedAsOrphan);
        }

        let status = self.accept_block(block)?;
        self.process_orphans(hash)?;
        Ok(status)
    }

    fn accept_block(&mut self, block: Block) -> Result<BlockStatus, ChainStateError> {
        let hash = block.hash();
        self.validator.check_header(&block).inspect_err(|e| {
            log::warn!("Rejected block {}: {}", hash, e);
        })?;

        let parent = {
            let index = self.header_index.read();
            let parent_hash = block.header.previous_hash;
            if index.is_invalid(&parent_hash) {
                return Err(ChainStateError::validation(hash, "Block descends from an invalid block"));
            }
            index
                .get(&parent_hash)
                .cloned()
                .ok_or(MissingData::Header(parent_hash))?
        };
        self.block_txes
            .try_add_block_transactions(hash, &block.transactions)?;
        self.header_index
            .write()
            .insert(ChainedHeader::from_parent(&parent, block.header, Utc::now()));

        let outcome = self.sync_to_best()?;
        if let Some((_, error)) = outcome.rejected.into_iter().find(|(rejected, _)| *rejected == hash) {
            return Err(error);
        }
        if self.header_index.read().is_invalid(&hash) {
            return Err(ChainStateError::validation(hash, "Block descends from an invalid block"));
        }

        if !self.chain.contains_hash(&hash) {
            log::debug!("Stored block {} on a side chain", hash);
            return Ok(BlockStatus::AddedToSideChain);
        }
        if outcome.disconnected > 0 {
            log::info!(
                "Reorganized: disconnected {} blocks, connected {}",
                outcome.disconnected,
                outcome.connected
            );
            return Ok(BlockStatus::CausedReorg {
                disconnected: outcome.disconnected,
                connected: outcome.connected,
            });
        }
        Ok(BlockStatus::AddedToMainChain)
    }

    /// Walk the connected chain to the best valid chain in the header index.
    ///
    /// A block failing validation is marked invalid and the walk restarts
    /// towards the new best chain. A best chain that forks below the pruned
    /// horizon cannot be reached; its branch is set aside and the walk
    /// restarts without touching the connected chain.
    fn sync_to_best(&mut self) -> Result<SyncOutcome, ChainStateError> {
        let mut outcome = SyncOutcome::default();
        'restart: loop {
            if let Some(branch) = self.fork_below_pruned_horizon()? {
                log::warn!(
                    "Best chain forks at height {} below the pruned horizon; setting aside branch {}",
                    branch.height - 1,
                    branch.hash
                );
                self.header_index.write().mark_unreachable(&branch.hash);
                continue 'restart;
            }

            let index = Arc::clone(&self.header_index);
            let steps = self
                .chain
                .to_immutable()
                .navigate_towards(move || index.read().best_chain())
                .with_cancellation(self.cancel.clone());

            for step in steps {
                let step = step?;
                match step.direction {
                    Direction::Rewind => {
                        self.disconnect_tip()?;
                        outcome.disconnected += 1;
                    }
                    Direction::Advance => {
                        let block = self.load_block(&step.header.hash)?;
                        match self.connect_block(&block) {
                            Ok(_) => outcome.connected += 1,
                            Err(e) if e.is_validation() => {
                                self.reject_branch(&step.header.hash);
                                outcome.rejected.push((step.header.hash, e));
                                continue 'restart;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
            return Ok(outcome);
        }
    }

    /// First header of the best branch, when that branch forks off below
    /// the lowest height that can still be disconnected
    fn fork_below_pruned_horizon(&self) -> Result<Option<ChainedHeader>, ChainStateError> {
        let Some(pruned_to) = self.pruner.state.pruned_to else {
            return Ok(None);
        };
        let Some(best) = self.header_index.read().best_chain() else {
            return Ok(None);
        };
        let current = self.chain.to_immutable();
        let fork = current.find_fork_point(&best)?;
        if fork.height >= pruned_to {
            return Ok(None);
        }
        Ok(best.get(fork.height + 1).cloned())
    }

    fn process_orphans(&mut self, parent: Hash256) -> Result<(), ChainStateError> {
        let mut parents = vec![parent];
        while let Some(parent) = parents.pop() {
            for orphan in self.orphans.take_children(&parent) {
                let hash = orphan.hash();
                match self.accept_block(orphan) {
                    Ok(status) => {
                        log::debug!("Orphan block {} processed: {:?}", hash, status);
                        parents.push(hash);
                    }
                    Err(e) if e.is_validation() || e.is_malformed_body() => {
                        log::warn!("Orphan block {} rejected: {}", hash, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

// =============================================================================
// In-memory engine
// =============================================================================

/// Engine over the in-memory backends, with snapshot support
pub struct MemoryChainState {
    engine: ChainStateBuilder<MemoryChainStateStorage>,
    blocks: Arc<MemoryBlockTxesStorage>,
}

impl MemoryChainState {
    pub fn new(
        params: ChainParams,
        config: ChainStateConfig,
        script_verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self, ChainStateError> {
        Self::open(
            params,
            config,
            script_verifier,
            MemoryChainStateStorage::new(),
            Arc::new(MemoryBlockTxesStorage::new()),
        )
    }

    pub fn from_snapshot(
        params: ChainParams,
        config: ChainStateConfig,
        script_verifier: Arc<dyn ScriptVerifier>,
        snapshot: ChainStateSnapshot,
    ) -> Result<Self, ChainStateError> {
        if snapshot.network != params.network {
            return Err(ChainStateError::StorageCorrupt(format!(
                "snapshot is for {}, not {}",
                snapshot.network, params.network
            )));
        }
        let mut state = Self::open(
            params,
            config,
            script_verifier,
            MemoryChainStateStorage::from_data(snapshot.chain_state),
            Arc::new(MemoryBlockTxesStorage::from_blocks(snapshot.blocks)),
        )?;
        state.engine.restore_block_tree(snapshot.block_tree)?;
        state.engine.verify_block_bodies()?;
        state.engine.restore_prune_state(snapshot.prune_state);
        Ok(state)
    }

    fn open(
        params: ChainParams,
        config: ChainStateConfig,
        script_verifier: Arc<dyn ScriptVerifier>,
        storage: MemoryChainStateStorage,
        blocks: Arc<MemoryBlockTxesStorage>,
    ) -> Result<Self, ChainStateError> {
        let block_txes: Arc<dyn BlockTxesStorage> = blocks.clone();
        let engine = ChainStateBuilder::open(params, config, storage, block_txes, script_verifier)?;
        Ok(Self { engine, blocks })
    }

    /// Committed chain state and block bodies as one snapshot
    pub fn snapshot(&self) -> ChainStateSnapshot {
        ChainStateSnapshot {
            network: self.engine.params().network,
            saved_at: Utc::now(),
            chain_state: (*self.engine.storage().committed()).clone(),
            blocks: self.blocks.snapshot(),
            prune_state: self.engine.prune_state().clone(),
            block_tree: self.engine.block_tree_snapshot(),
        }
    }
}

impl Deref for MemoryChainState {
    type Target = ChainStateBuilder<MemoryChainStateStorage>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl DerefMut for MemoryChainState {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}
