//! Block Pruning Support
//!
//! Keeps only the most recent blocks rollback-able:
//! - Spent transaction bodies of older blocks are pruned from block storage
//! - Their spent-tx and unminted-tx logs are dropped
//! - The pruned horizon is tracked so rollbacks past it fail cleanly

use crate::core::chain::Chain;
use crate::storage::block_txes::BlockTxesStorage;
use crate::storage::cursor::{ChainStateCursor, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Constants
// =============================================================================

/// Minimum blocks to keep rollback-able
pub const MIN_KEEP_BLOCKS: u32 = 2;

/// Default keep window (~2 days of 10 minute blocks)
pub const DEFAULT_KEEP_BLOCKS: u32 = 288;

// =============================================================================
// Prune State
// =============================================================================

/// Tracks what has been pruned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneState {
    /// Highest height whose rollback data has been pruned
    pub pruned_to: Option<u32>,
    /// Total blocks pruned
    pub total_pruned_blocks: u64,
    /// Total transaction bodies pruned
    pub total_pruned_txes: u64,
}

impl PruneState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pruned block
    pub fn record_prune(&mut self, height: u32, pruned_txes: usize) {
        self.total_pruned_blocks += 1;
        self.total_pruned_txes += pruned_txes as u64;
        if self.pruned_to.map_or(true, |to| height > to) {
            self.pruned_to = Some(height);
        }
    }

    /// Whether the rollback data of `height` is gone
    pub fn is_pruned(&self, height: u32) -> bool {
        self.pruned_to.map_or(false, |to| height <= to)
    }

    /// First height whose rollback data is still kept
    pub fn lowest_rollback_height(&self) -> u32 {
        self.pruned_to.map_or(1, |to| to + 1)
    }
}

// =============================================================================
// Pruner Configuration
// =============================================================================

/// Configuration for the pruner
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    /// Whether pruning is enabled
    pub enabled: bool,
    /// Number of blocks below the tip to keep rollback-able
    pub keep_blocks: u32,
    /// Prune every N connected blocks
    pub prune_interval: u32,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            keep_blocks: DEFAULT_KEEP_BLOCKS,
            prune_interval: 1,
        }
    }
}

impl PrunerConfig {
    /// Pruning enabled with the given window
    pub fn keep(keep_blocks: u32) -> Self {
        Self {
            enabled: true,
            keep_blocks: keep_blocks.max(MIN_KEEP_BLOCKS),
            prune_interval: 1,
        }
    }
}

// =============================================================================
// Pruner
// =============================================================================

/// Decides when and what to prune
#[derive(Debug)]
pub struct Pruner {
    pub config: PrunerConfig,
    pub state: PruneState,
    /// Blocks since last prune
    blocks_since_prune: u32,
}

impl Pruner {
    pub fn new(config: PrunerConfig) -> Self {
        Self::with_state(config, PruneState::new())
    }

    pub fn with_state(config: PrunerConfig, state: PruneState) -> Self {
        Self {
            config,
            state,
            blocks_since_prune: 0,
        }
    }

    /// Heights that have fallen out of the keep window
    pub fn calculate_prune_range(&self, tip_height: u32) -> Option<PruneRange> {
        if !self.config.enabled {
            return None;
        }

        let keep_from = tip_height.saturating_sub(self.config.keep_blocks);
        let start = self.state.lowest_rollback_height();

        if keep_from > start {
            Some(PruneRange {
                start,
                end: keep_from,
            })
        } else {
            None
        }
    }

    /// Record a connected block; returns the range to prune now, if any
    pub fn on_new_block(&mut self, tip_height: u32) -> Option<PruneRange> {
        if !self.config.enabled {
            return None;
        }

        self.blocks_since_prune += 1;
        if self.blocks_since_prune < self.config.prune_interval.max(1) {
            return None;
        }
        self.blocks_since_prune = 0;
        self.calculate_prune_range(tip_height)
    }

    pub fn record_prune(&mut self, height: u32, pruned_txes: usize) {
        self.state.record_prune(height, pruned_txes);
    }
}

// =============================================================================
// Prune Range
// =============================================================================

/// Range of heights to prune
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneRange {
    /// First height to prune (inclusive)
    pub start: u32,
    /// Last height to prune (exclusive)
    pub end: u32,
}

impl PruneRange {
    pub fn count(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> {
        self.start..self.end
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Drop the rollback data of the block at `height` on `chain`.
///
/// Every transaction that block fully spent loses its body in block storage,
/// then the block's spent-tx and unminted-tx logs are removed. The cursor
/// must hold an open write transaction. Returns the number of pruned bodies.
pub fn prune_block<C: ChainStateCursor + ?Sized>(
    cursor: &mut C,
    block_txes: &dyn BlockTxesStorage,
    chain: &Chain,
    height: u32,
) -> Result<usize, StorageError> {
    let block = chain
        .get(height)
        .ok_or_else(|| StorageError::InvalidData(format!("no block at height {}", height)))?;

    let mut pruned = 0;
    if let Some(spent_txes) = cursor.try_get_block_spent_txes(height)? {
        let mut by_block: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for spent in spent_txes.iter() {
            by_block
                .entry(spent.confirmed_block_index)
                .or_default()
                .push(spent.tx_index);
        }

        for (block_index, tx_indices) in by_block {
            let confirming = chain.get(block_index).ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "spent-tx log of height {} references height {}",
                    height, block_index
                ))
            })?;
            block_txes.prune_elements(&confirming.hash, &tx_indices)?;
            pruned += tx_indices.len();
        }
        cursor.try_remove_block_spent_txes(height)?;
    }
    cursor.try_remove_block_unminted_txes(&block.hash)?;

    log::debug!(
        "Pruned block {} at height {}: {} transaction bodies",
        block.hash,
        height,
        pruned
    );
    Ok(pruned)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_calculation() {
        let pruner = Pruner::new(PrunerConfig::keep(1));
        assert_eq!(pruner.config.keep_blocks, MIN_KEEP_BLOCKS);

        let range = pruner.calculate_prune_range(10).unwrap();
        assert_eq!(range, PruneRange { start: 1, end: 8 });
        assert_eq!(range.count(), 7);

        let pruner = Pruner::new(PrunerConfig::keep(20));
        assert!(pruner.calculate_prune_range(10).is_none());
        assert!(Pruner::new(PrunerConfig::default())
            .calculate_prune_range(1000)
            .is_none());
    }

    #[test]
    fn test_prune_state() {
        let mut state = PruneState::new();
        assert!(!state.is_pruned(1));

        state.record_prune(1, 3);
        state.record_prune(2, 0);

        assert!(state.is_pruned(1));
        assert!(state.is_pruned(2));
        assert!(!state.is_pruned(3));
        assert_eq!(state.lowest_rollback_height(), 3);
        assert_eq!(state.total_pruned_blocks, 2);
        assert_eq!(state.total_pruned_txes, 3);
    }

    #[test]
    fn test_range_resumes_after_prune() {
        let mut pruner = Pruner::new(PrunerConfig::keep(2));
        for height in pruner.calculate_prune_range(6).unwrap().iter() {
            pruner.record_prune(height, 0);
        }
        assert_eq!(pruner.state.pruned_to, Some(3));
        assert!(pruner.calculate_prune_range(6).is_none());
        assert_eq!(
            pruner.calculate_prune_range(7),
            Some(PruneRange { start: 4, end: 5 })
        );
    }

    #[test]
    fn test_prune_interval() {
        let mut pruner = Pruner::new(PrunerConfig {
            enabled: true,
            keep_blocks: 2,
            prune_interval: 3,
        });

        assert!(pruner.on_new_block(10).is_none());
        assert!(pruner.on_new_block(11).is_none());
        assert!(pruner.on_new_block(12).is_some());
    }
}
