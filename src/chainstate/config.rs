//! Engine configuration

use crate::core::chain_state::MAX_ORPHAN_BLOCKS;
use crate::storage::pruning::PrunerConfig;
use std::time::Duration;

/// What block validation checks, and how it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    /// Check input/output sums, fees and the coinbase reward
    pub validate_transactions: bool,
    /// Ask the script verifier about every input
    pub validate_scripts: bool,
    /// Log failed scripts instead of rejecting the block (diagnostics only)
    pub ignore_script_errors: bool,
    /// Keep validating after the first failure to surface the worst one
    pub continue_on_error: bool,
    /// Validation threads; 0 uses one per CPU
    pub worker_threads: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            validate_transactions: true,
            validate_scripts: true,
            ignore_script_errors: false,
            continue_on_error: false,
            worker_threads: 0,
        }
    }
}

impl ValidationConfig {
    /// Structural checks only: merkle root, proof of work, coinbase position
    pub fn structural_only() -> Self {
        Self {
            validate_transactions: false,
            validate_scripts: false,
            ..Default::default()
        }
    }
}

/// Chain state engine configuration
#[derive(Debug, Clone)]
pub struct ChainStateConfig {
    pub validation: ValidationConfig,
    /// Threads per look-ahead stage
    pub lookahead_workers: usize,
    /// Items queued ahead of the look-ahead workers
    pub lookahead_capacity: usize,
    /// Read cursors shared by the look-ahead stages
    pub cursor_pool_size: usize,
    /// How long a look-ahead worker waits for a pooled cursor
    pub cursor_timeout: Duration,
    /// Keep each unspent transaction's outputs in the UTXO record
    pub inline_unspent_outputs: bool,
    pub pruning: PrunerConfig,
    pub max_orphan_blocks: usize,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            lookahead_workers: 4,
            lookahead_capacity: 256,
            cursor_pool_size: 4,
            cursor_timeout: Duration::from_secs(30),
            inline_unspent_outputs: false,
            pruning: PrunerConfig::default(),
            max_orphan_blocks: MAX_ORPHAN_BLOCKS,
        }
    }
}

impl ChainStateConfig {
    pub fn with_validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_lookahead_workers(mut self, workers: usize) -> Self {
        self.lookahead_workers = workers.max(1);
        self
    }

    pub fn with_cursor_pool_size(mut self, size: usize) -> Self {
        self.cursor_pool_size = size.max(1);
        self
    }

    pub fn with_inline_unspent_outputs(mut self, inline: bool) -> Self {
        self.inline_unspent_outputs = inline;
        self
    }

    pub fn with_pruning(mut self, pruning: PrunerConfig) -> Self {
        self.pruning = pruning;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate_everything() {
        let config = ChainStateConfig::default();
        assert!(config.validation.validate_transactions);
        assert!(config.validation.validate_scripts);
        assert!(!config.validation.ignore_script_errors);
        assert!(!config.pruning.enabled);
    }

    #[test]
    fn test_builder_methods() {
        let config = ChainStateConfig::default()
            .with_validation(ValidationConfig::structural_only())
            .with_lookahead_workers(0)
            .with_inline_unspent_outputs(true)
            .with_pruning(PrunerConfig::keep(10));

        assert!(!config.validation.validate_transactions);
        assert_eq!(config.lookahead_workers, 1);
        assert!(config.inline_unspent_outputs);
        assert!(config.pruning.enabled);
        assert_eq!(config.pruning.keep_blocks, 10);
    }
}
