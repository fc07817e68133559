//! Chain State Management
//!
//! Tracks every known header across competing branches, picks the best tip
//! by cumulative work, and holds orphan blocks until their parent arrives.

use crate::core::block::Block;
use crate::core::chain::{Chain, ChainError};
use crate::core::chained_header::ChainedHeader;
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Maximum number of orphan blocks to keep in memory
pub const MAX_ORPHAN_BLOCKS: usize = 100;

/// Maximum time (in seconds) an orphan block can stay in the pool
pub const ORPHAN_BLOCK_EXPIRE_TIME: u64 = 3600; // 1 hour

// =============================================================================
// Header Index
// =============================================================================

#[derive(Debug, Clone)]
struct IndexEntry {
    header: ChainedHeader,
    /// Arrival order, breaks ties between equal-work tips
    seen_order: u64,
}

/// All known headers, main chain and side branches
#[derive(Debug, Default)]
pub struct HeaderIndex {
    entries: HashMap<Hash256, IndexEntry>,
    children: HashMap<Hash256, Vec<Hash256>>,
    invalid: HashSet<Hash256>,
    /// Branches forking below the pruned horizon; kept, never selected
    unreachable: HashSet<Hash256>,
    best: Option<Hash256>,
    /// Materialized chain to `best`
    best_chain: Option<Chain>,
    next_order: u64,
}

impl HeaderIndex {
    pub fn new(genesis: ChainedHeader) -> Self {
        let mut index = Self::default();
        index.insert(genesis);
        index
    }

    /// Rebuild an index from a saved block tree.
    ///
    /// Headers must come parents first, starting with a single genesis.
    pub fn restore(tree: &BlockTreeSnapshot) -> Result<Self, ChainError> {
        let mut index = Self::default();
        for header in &tree.headers {
            if header.is_genesis() {
                if !index.is_empty() {
                    return Err(ChainError::NoCommonAncestor);
                }
            } else if !index.contains(&header.previous_hash()) {
                return Err(ChainError::UnknownHeader(header.previous_hash()));
            }
            index.insert(header.clone());
        }
        if index.is_empty() {
            return Err(ChainError::Empty);
        }

        for hash in &tree.invalid {
            for descendant in index.branch_from(hash) {
                index.invalid.insert(descendant);
            }
        }
        for hash in &tree.unreachable {
            for descendant in index.branch_from(hash) {
                index.unreachable.insert(descendant);
            }
        }
        index.reselect_best();
        Ok(index)
    }

    /// Headers, invalid marks and unreachable marks in a saveable form
    pub fn to_tree(&self) -> BlockTreeSnapshot {
        let mut entries: Vec<&IndexEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seen_order);

        let mut invalid: Vec<Hash256> = self.invalid.iter().copied().collect();
        invalid.sort();
        let mut unreachable: Vec<Hash256> = self.unreachable.iter().copied().collect();
        unreachable.sort();

        BlockTreeSnapshot {
            headers: entries.into_iter().map(|entry| entry.header.clone()).collect(),
            invalid,
            unreachable,
            orphans: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&ChainedHeader> {
        self.entries.get(hash).map(|entry| &entry.header)
    }

    pub fn is_invalid(&self, hash: &Hash256) -> bool {
        self.invalid.contains(hash)
    }

    pub fn is_unreachable(&self, hash: &Hash256) -> bool {
        self.unreachable.contains(hash)
    }

    fn is_excluded(&self, hash: &Hash256) -> bool {
        self.invalid.contains(hash) || self.unreachable.contains(hash)
    }

    /// Add a header. Returns false if it was already known.
    ///
    /// A header whose parent is invalid is invalid too; the same goes for
    /// unreachable parents.
    pub fn insert(&mut self, header: ChainedHeader) -> bool {
        if self.entries.contains_key(&header.hash) {
            return false;
        }

        let hash = header.hash;
        let parent = header.previous_hash();
        if !header.is_genesis() {
            self.children.entry(parent).or_default().push(hash);
        }
        if self.invalid.contains(&parent) {
            self.invalid.insert(hash);
        }
        if self.unreachable.contains(&parent) {
            self.unreachable.insert(hash);
        }

        let seen_order = self.next_order;
        self.next_order += 1;
        self.entries.insert(hash, IndexEntry { header, seen_order });

        if !self.is_excluded(&hash) && self.beats_best(&hash) {
            self.best = Some(hash);
            self.refresh_best_chain();
        }
        true
    }

    fn beats_best(&self, hash: &Hash256) -> bool {
        let Some(candidate) = self.entries.get(hash) else {
            return false;
        };
        match self.best.and_then(|best| self.entries.get(&best)) {
            None => true,
            Some(best) => candidate.header.total_work > best.header.total_work,
        }
    }

    /// `hash` and every known descendant
    fn branch_from(&self, hash: &Hash256) -> Vec<Hash256> {
        if !self.entries.contains_key(hash) {
            return Vec::new();
        }
        let mut branch = Vec::new();
        let mut pending = vec![*hash];
        while let Some(next) = pending.pop() {
            branch.push(next);
            if let Some(children) = self.children.get(&next) {
                pending.extend(children.iter().copied());
            }
        }
        branch
    }

    /// Mark a header and all of its descendants invalid, then reselect the best tip.
    ///
    /// Returns the hashes that were not invalid before.
    pub fn mark_invalid(&mut self, hash: &Hash256) -> Vec<Hash256> {
        let newly: Vec<Hash256> = self
            .branch_from(hash)
            .into_iter()
            .filter(|h| self.invalid.insert(*h))
            .collect();
        self.reselect_best();
        newly
    }

    /// Take a branch out of best-tip selection without calling it invalid
    pub fn mark_unreachable(&mut self, hash: &Hash256) {
        for descendant in self.branch_from(hash) {
            self.unreachable.insert(descendant);
        }
        self.reselect_best();
    }

    fn reselect_best(&mut self) {
        self.best = self
            .entries
            .iter()
            .filter(|(hash, _)| !self.is_excluded(hash))
            .max_by(|(_, a), (_, b)| {
                a.header
                    .total_work
                    .cmp(&b.header.total_work)
                    .then(b.seen_order.cmp(&a.seen_order))
            })
            .map(|(hash, _)| *hash);
        self.refresh_best_chain();
    }

    /// Bring the cached best chain up to `best`, extending it when possible
    fn refresh_best_chain(&mut self) {
        let Some(best) = self.best else {
            self.best_chain = None;
            return;
        };
        if let (Some(chain), Some(entry)) = (self.best_chain.as_mut(), self.entries.get(&best)) {
            if chain.tip().hash == best {
                return;
            }
            if chain.tip().hash == entry.header.previous_hash()
                && chain.push(entry.header.clone()).is_ok()
            {
                return;
            }
        }
        let rebuilt = self.chain_to(&best).ok();
        self.best_chain = rebuilt;
    }

    /// Valid header with the most work; on equal work the one seen first
    pub fn best_tip(&self) -> Option<&ChainedHeader> {
        self.best.and_then(|hash| self.get(&hash))
    }

    /// Materialize the chain from genesis up to `hash`
    pub fn chain_to(&self, hash: &Hash256) -> Result<Chain, ChainError> {
        let mut headers = Vec::new();
        let mut current = self.get(hash).ok_or(ChainError::UnknownHeader(*hash))?;
        loop {
            headers.push(current.clone());
            if current.is_genesis() {
                break;
            }
            let parent = current.previous_hash();
            current = self.get(&parent).ok_or(ChainError::UnknownHeader(parent))?;
        }
        headers.reverse();
        Chain::new(headers)
    }

    /// Chain to the best tip. Clones share storage with the cached chain.
    pub fn best_chain(&self) -> Option<Chain> {
        self.best_chain.clone()
    }
}

/// The header tree and pending orphans as written to a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockTreeSnapshot {
    /// Every known header, in the order it was first seen
    pub headers: Vec<ChainedHeader>,
    pub invalid: Vec<Hash256>,
    #[serde(default)]
    pub unreachable: Vec<Hash256>,
    #[serde(default)]
    pub orphans: Vec<OrphanBlock>,
}

// =============================================================================
// Orphan Pool
// =============================================================================

/// An orphan block waiting for its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanBlock {
    pub block: Block,
    /// Hash of the parent block we're waiting for
    pub parent_hash: Hash256,
    /// Timestamp when this orphan was received
    pub received_at: u64,
}

impl OrphanBlock {
    pub fn new(block: Block, received_at: u64) -> Self {
        let parent_hash = block.header.previous_hash;
        Self {
            block,
            parent_hash,
            received_at,
        }
    }

    /// Check if this orphan has expired
    pub fn is_expired(&self, current_time: u64) -> bool {
        current_time.saturating_sub(self.received_at) > ORPHAN_BLOCK_EXPIRE_TIME
    }
}

/// Blocks whose parent is not known yet
#[derive(Debug, Clone)]
pub struct OrphanPool {
    max_blocks: usize,
    orphans: HashMap<Hash256, OrphanBlock>,
    /// Parent hash to orphan hashes, for lookup when the parent arrives
    by_parent: HashMap<Hash256, Vec<Hash256>>,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(MAX_ORPHAN_BLOCKS)
    }
}

impl OrphanPool {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            max_blocks,
            orphans: HashMap::new(),
            by_parent: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Pending orphans, oldest first
    pub fn orphans(&self) -> Vec<OrphanBlock> {
        let mut orphans: Vec<OrphanBlock> = self.orphans.values().cloned().collect();
        orphans.sort_by_key(|orphan| orphan.received_at);
        orphans
    }

    /// Add an orphan block, evicting the oldest when full. Returns false for duplicates.
    pub fn add(&mut self, block: Block, current_time: u64) -> bool {
        let block_hash = block.hash();
        if self.max_blocks == 0 || self.orphans.contains_key(&block_hash) {
            return false;
        }

        if self.orphans.len() >= self.max_blocks {
            self.prune_expired(current_time);
        }
        if self.orphans.len() >= self.max_blocks {
            self.evict_oldest();
        }

        let orphan = OrphanBlock::new(block, current_time);
        self.by_parent
            .entry(orphan.parent_hash)
            .or_default()
            .push(block_hash);
        self.orphans.insert(block_hash, orphan);
        true
    }

    /// Remove and return the orphans waiting on `parent_hash`
    pub fn take_children(&mut self, parent_hash: &Hash256) -> Vec<Block> {
        let hashes = self.by_parent.remove(parent_hash).unwrap_or_default();
        hashes
            .iter()
            .filter_map(|hash| self.orphans.remove(hash))
            .map(|orphan| orphan.block)
            .collect()
    }

    pub fn remove(&mut self, block_hash: &Hash256) {
        if let Some(orphan) = self.orphans.remove(block_hash) {
            if let Some(siblings) = self.by_parent.get_mut(&orphan.parent_hash) {
                siblings.retain(|h| h != block_hash);
                if siblings.is_empty() {
                    self.by_parent.remove(&orphan.parent_hash);
                }
            }
        }
    }

    /// Remove expired orphans
    pub fn prune_expired(&mut self, current_time: u64) {
        let expired: Vec<Hash256> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.is_expired(current_time))
            .map(|(hash, _)| *hash)
            .collect();

        for hash in expired {
            self.remove(&hash);
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .orphans
            .iter()
            .min_by_key(|(_, orphan)| orphan.received_at)
            .map(|(hash, _)| *hash);
        if let Some(hash) = oldest {
            log::debug!("Orphan pool full, evicting {}", hash);
            self.remove(&hash);
        }
    }
}

// =============================================================================
// Block Status
// =============================================================================

/// Result of attempting to add a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    /// Block was added to the main chain
    AddedToMainChain,
    /// Block is valid as far as known but sits on a branch with less work
    AddedToSideChain,
    /// Block was added as an orphan (waiting for parent)
    AddedAsOrphan,
    /// Block caused a chain reorganization
    CausedReorg { disconnected: u32, connected: u32 },
    /// Block is a duplicate
    Duplicate,
}
