//! Block validation
//!
//! Structural checks (merkle root, proof of work, coinbase placement) run on
//! the calling thread. Transaction checks fan out over a dedicated rayon pool
//! as loaded transactions arrive from the loader, in block order.

use crate::chainstate::config::ValidationConfig;
use crate::chainstate::error::ChainStateError;
use crate::chainstate::tx_loader::LoadedTx;
use crate::consensus::params::ChainParams;
use crate::consensus::pow::{check_proof_of_work, next_required_bits, PowError};
use crate::consensus::rules::{checked_money_add, max_coinbase_value, money_range};
use crate::core::block::Block;
use crate::core::chain::Chain;
use crate::core::script::ScriptVerifier;
use crate::crypto::Hash256;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct BlockValidator {
    params: Arc<ChainParams>,
    config: ValidationConfig,
    script_verifier: Arc<dyn ScriptVerifier>,
    pool: ThreadPool,
}

/// Shared outcome of one block's parallel transaction checks
#[derive(Default)]
struct Outcome {
    fees: AtomicU64,
    failed: AtomicBool,
    error: Mutex<Option<ChainStateError>>,
}

impl Outcome {
    fn record(&self, error: ChainStateError) {
        self.failed.store(true, Ordering::Release);
        let mut slot = self.error.lock();
        *slot = Some(match slot.take() {
            Some(previous) => previous.or_higher(error),
            None => error,
        });
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn add_fee(&self, fee: u64) -> bool {
        self.fees
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                checked_money_add(total, fee)
            })
            .is_ok()
    }
}

impl BlockValidator {
    pub fn new(
        params: Arc<ChainParams>,
        config: ValidationConfig,
        script_verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self, ChainStateError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(|index| format!("tx-validator-{}", index))
            .build()
            .map_err(|e| ChainStateError::Pipeline(format!("validation pool: {}", e)))?;

        Ok(Self {
            params,
            config,
            script_verifier,
            pool,
        })
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Header checks that need no chain context
    pub fn check_header(&self, block: &Block) -> Result<(), ChainStateError> {
        let hash = block.hash();
        check_proof_of_work(&hash, block.header.bits, block.header.bits, &self.params)
            .map_err(|e| ChainStateError::validation(hash, e.to_string()))
    }

    /// Check that the transactions are the ones the header commits to.
    ///
    /// Failing here blames the body, not the header hash.
    pub fn check_body(&self, block: &Block) -> Result<(), ChainStateError> {
        let hash = block.hash();
        if block.is_mutated() {
            return Err(ChainStateError::malformed_body(hash, "Transaction list is mutated"));
        }
        if !block.has_valid_merkle_root() {
            return Err(ChainStateError::malformed_body(
                hash,
                "Merkle root does not match the transactions",
            ));
        }
        Ok(())
    }

    /// Validate `block` as the child of `parent`.
    ///
    /// `loaded` yields the block's transactions with their previous outputs
    /// in block order; it is only consumed when transaction checks are on.
    pub fn validate_block<I>(
        &self,
        parent: &Chain,
        block: &Block,
        loaded: I,
        cancel: &CancellationToken,
    ) -> Result<(), ChainStateError>
    where
        I: IntoIterator<Item = Result<LoadedTx, ChainStateError>>,
    {
        let block_hash = block.hash();
        let height = parent.height() + 1;

        if !block.has_valid_merkle_root() {
            return Err(ChainStateError::validation(block_hash, "Merkle root is invalid"));
        }

        let required_bits = next_required_bits(parent, &self.params).map_err(|e| match e {
            PowError::MissingAncestor(_) => ChainStateError::StorageCorrupt(e.to_string()),
            other => ChainStateError::validation(block_hash, other.to_string()),
        })?;
        check_proof_of_work(&block_hash, block.header.bits, required_bits, &self.params)
            .map_err(|e| ChainStateError::validation(block_hash, e.to_string()))?;

        let coinbase = block
            .transactions
            .first()
            .ok_or_else(|| ChainStateError::validation(block_hash, "Block has no transactions"))?;
        if !coinbase.is_coinbase() {
            return Err(ChainStateError::validation(
                block_hash,
                "First transaction is not a coinbase",
            ));
        }
        if let Some(extra) = block.transactions.iter().skip(1).find(|tx| tx.is_coinbase()) {
            return Err(ChainStateError::tx_validation(
                block_hash,
                extra.hash(),
                "Coinbase outside the first position",
            ));
        }

        if !self.config.validate_transactions {
            return Ok(());
        }

        let fees = self.validate_transactions(block_hash, block.transactions.len(), loaded, cancel)?;

        let claimed = coinbase.total_output_value().filter(|v| money_range(*v));
        let allowed = max_coinbase_value(height, fees, &self.params);
        match (claimed, allowed) {
            (Some(claimed), Some(allowed)) if claimed <= allowed => {
                log::debug!(
                    "Block {} at height {}: fees {}, coinbase {} of {}",
                    block_hash,
                    height,
                    fees,
                    claimed,
                    allowed
                );
                Ok(())
            }
            _ => Err(ChainStateError::tx_validation(
                block_hash,
                coinbase.hash(),
                format!(
                    "Coinbase claims {:?}, more than the allowed {:?}",
                    claimed, allowed
                ),
            )),
        }
    }

    /// Check every non-coinbase transaction; returns the block's total fees
    fn validate_transactions<I>(
        &self,
        block_hash: Hash256,
        tx_count: usize,
        loaded: I,
        cancel: &CancellationToken,
    ) -> Result<u64, ChainStateError>
    where
        I: IntoIterator<Item = Result<LoadedTx, ChainStateError>>,
    {
        let outcome = Outcome::default();
        let mut seen = 0usize;

        self.pool.in_place_scope(|scope| {
            for item in loaded {
                if cancel.is_cancelled() {
                    outcome.record(ChainStateError::Cancelled);
                    break;
                }
                if outcome.has_failed() && !self.config.continue_on_error {
                    break;
                }

                let tx = match item {
                    Ok(tx) => tx,
                    Err(e) => {
                        outcome.record(e);
                        break;
                    }
                };
                seen += 1;
                if tx.is_coinbase() {
                    continue;
                }

                let outcome = &outcome;
                scope.spawn(move |_| {
                    if outcome.has_failed() && !self.config.continue_on_error {
                        return;
                    }
                    match self.validate_transaction(block_hash, &tx) {
                        Ok(fee) => {
                            if !outcome.add_fee(fee) {
                                outcome.record(ChainStateError::validation(
                                    block_hash,
                                    "Total fees out of range",
                                ));
                            }
                        }
                        Err(e) => outcome.record(e),
                    }
                });
            }
        });

        if let Some(error) = outcome.error.into_inner() {
            return Err(error);
        }
        if seen != tx_count {
            return Err(ChainStateError::Pipeline(format!(
                "validated {} of {} transactions of block {}",
                seen, tx_count, block_hash
            )));
        }
        Ok(outcome.fees.into_inner())
    }

    /// Value and script checks of one transaction; returns its fee
    fn validate_transaction(&self, block_hash: Hash256, loaded: &LoadedTx) -> Result<u64, ChainStateError> {
        let tx = &loaded.transaction;
        let tx_hash = tx.hash();
        let reject = |reason: String| ChainStateError::tx_validation(block_hash, tx_hash, reason);

        if loaded.prev_outputs.len() != tx.inputs().len() {
            return Err(ChainStateError::Pipeline(format!(
                "transaction {} loaded {} previous outputs for {} inputs",
                tx_hash,
                loaded.prev_outputs.len(),
                tx.inputs().len()
            )));
        }

        let mut value_in = 0u64;
        for prev in &loaded.prev_outputs {
            value_in = checked_money_add(value_in, prev.value)
                .ok_or_else(|| reject("Input values out of range".into()))?;
        }

        let mut value_out = 0u64;
        for output in tx.outputs() {
            value_out = checked_money_add(value_out, output.value)
                .ok_or_else(|| reject("Output values out of range".into()))?;
        }

        if value_in < value_out {
            return Err(reject(format!(
                "Outputs {} exceed inputs {}",
                value_out, value_in
            )));
        }

        if self.config.validate_scripts {
            for (input_index, (input, prev)) in tx.inputs().iter().zip(&loaded.prev_outputs).enumerate() {
                let mut combined = input.script_sig.clone();
                combined.extend_from_slice(&prev.script_pubkey);
                let valid = self.script_verifier.verify_script(
                    &block_hash,
                    loaded.tx_index,
                    &prev.script_pubkey,
                    tx,
                    input_index,
                    &combined,
                );
                if valid {
                    continue;
                }
                if self.config.ignore_script_errors {
                    log::warn!(
                        "Ignoring script failure in block {} tx {} input {}",
                        block_hash,
                        tx_hash,
                        input_index
                    );
                } else {
                    return Err(reject(format!("Script verification failed for input {}", input_index)));
                }
            }
        }

        Ok(value_in - value_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::{NullScriptVerifier, StandardScriptVerifier, OP_RETURN};
    use crate::core::transaction::{Transaction, TxOutput};
    use crate::test_util::{genesis_chain, mine_block, spend_tx};

    fn validator(config: ValidationConfig) -> BlockValidator {
        BlockValidator::new(
            Arc::new(ChainParams::regtest()),
            ValidationConfig {
                worker_threads: 2,
                ..config
            },
            Arc::new(StandardScriptVerifier),
        )
        .unwrap()
    }

    fn loaded(block: &Block, prev: &[Vec<TxOutput>]) -> Vec<Result<LoadedTx, ChainStateError>> {
        block
            .transactions
            .iter()
            .zip(prev)
            .enumerate()
            .map(|(i, (tx, prev_outputs))| {
                Ok(LoadedTx {
                    tx_index: i as u32,
                    transaction: tx.clone(),
                    prev_outputs: prev_outputs.clone(),
                })
            })
            .collect()
    }

    fn funded_block(coinbase_value: u64, spend_value: u64) -> (Chain, Block, Vec<Vec<TxOutput>>) {
        let parent = genesis_chain();
        let spend = spend_tx(&[(Hash256::from_bytes([3u8; 32]), 0)], &[spend_value]);
        let coinbase = Transaction::coinbase(1, coinbase_value, vec![]);
        let block = mine_block(parent.tip(), vec![coinbase, spend]);
        let prev = vec![Vec::new(), vec![TxOutput::new(1_000, vec![])]];
        (parent, block, prev)
    }

    #[test]
    fn test_coinbase_reward_bound() {
        let validator = validator(ValidationConfig::default());
        let subsidy = ChainParams::regtest().initial_subsidy;
        let cancel = CancellationToken::new();

        // fee is 1_000 - 600
        let (parent, block, prev) = funded_block(subsidy + 400, 600);
        validator
            .validate_block(&parent, &block, loaded(&block, &prev), &cancel)
            .unwrap();

        let (parent, block, prev) = funded_block(subsidy + 401, 600);
        let err = validator
            .validate_block(&parent, &block, loaded(&block, &prev), &cancel)
            .unwrap_err();
        assert!(err.is_validation(), "{err}");
    }

    #[test]
    fn test_outputs_exceeding_inputs() {
        let validator = validator(ValidationConfig::default());
        let (parent, block, prev) = funded_block(1, 1_001);
        let err = validator
            .validate_block(&parent, &block, loaded(&block, &prev), &CancellationToken::new())
            .unwrap_err();
        match err {
            ChainStateError::Validation { tx_hash, .. } => {
                assert_eq!(tx_hash, Some(block.transactions[1].hash()))
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_merkle_root_mismatch() {
        let validator = validator(ValidationConfig::default());
        let (parent, mut block, prev) = funded_block(1, 10);
        block.transactions.swap(0, 1);
        let err = validator
            .validate_block(&parent, &block, loaded(&block, &prev), &CancellationToken::new())
            .unwrap_err();
        match err {
            ChainStateError::Validation { reason, .. } => assert_eq!(reason, "Merkle root is invalid"),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_body_checks_blame_the_body() {
        let validator = validator(ValidationConfig::default());
        let (_, block, _) = funded_block(1, 10);
        validator.check_body(&block).unwrap();

        let mut repeated = block.clone();
        repeated.transactions.push(block.transactions[1].clone());
        repeated.transactions.push(block.transactions[1].clone());
        assert_eq!(repeated.hash(), block.hash());
        assert!(validator.check_body(&repeated).unwrap_err().is_malformed_body());

        let mut swapped = block;
        swapped.transactions.swap(0, 1);
        let err = validator.check_body(&swapped).unwrap_err();
        assert!(err.is_malformed_body(), "{err}");
        assert!(!err.is_validation());
    }

    #[test]
    fn test_coinbase_required_first() {
        let validator = validator(ValidationConfig::default());
        let parent = genesis_chain();
        let tx = spend_tx(&[(Hash256::from_bytes([3u8; 32]), 0)], &[1]);
        let block = mine_block(parent.tip(), vec![tx]);
        let err = validator
            .validate_block(&parent, &block, Vec::new(), &CancellationToken::new())
            .unwrap_err();
        assert!(err.is_validation());

        let empty = mine_block(parent.tip(), Vec::new());
        assert!(validator
            .validate_block(&parent, &empty, Vec::new(), &CancellationToken::new())
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_script_failure_and_override() {
        let parent = genesis_chain();
        let coinbase = Transaction::coinbase(1, 1, vec![]);
        let spend = spend_tx(&[(Hash256::from_bytes([3u8; 32]), 0)], &[10]);
        let block = mine_block(parent.tip(), vec![coinbase, spend]);
        let prev = vec![Vec::new(), vec![TxOutput::new(10, vec![OP_RETURN])]];
        let cancel = CancellationToken::new();

        let strict = validator(ValidationConfig::default());
        assert!(strict
            .validate_block(&parent, &block, loaded(&block, &prev), &cancel)
            .unwrap_err()
            .is_validation());

        let lenient = validator(ValidationConfig {
            ignore_script_errors: true,
            ..Default::default()
        });
        lenient
            .validate_block(&parent, &block, loaded(&block, &prev), &cancel)
            .unwrap();

        let unchecked = BlockValidator::new(
            Arc::new(ChainParams::regtest()),
            ValidationConfig::default(),
            Arc::new(NullScriptVerifier),
        )
        .unwrap();
        unchecked
            .validate_block(&parent, &block, loaded(&block, &prev), &cancel)
            .unwrap();
    }

    #[test]
    fn test_consensus_failure_outranks_missing_data() {
        let parent = genesis_chain();
        let coinbase = Transaction::coinbase(1, 1, vec![]);
        let bad = spend_tx(&[(Hash256::from_bytes([3u8; 32]), 0)], &[100]);
        let missing = spend_tx(&[(Hash256::from_bytes([4u8; 32]), 0)], &[1]);
        let block = mine_block(parent.tip(), vec![coinbase.clone(), bad.clone(), missing]);

        let stream = vec![
            Ok(LoadedTx {
                tx_index: 0,
                transaction: coinbase,
                prev_outputs: Vec::new(),
            }),
            Ok(LoadedTx {
                tx_index: 1,
                transaction: bad,
                prev_outputs: vec![TxOutput::new(1, vec![])],
            }),
            Err(ChainStateError::MissingData(
                crate::chainstate::error::MissingData::Header(Hash256::ZERO),
            )),
        ];

        let validator = validator(ValidationConfig {
            continue_on_error: true,
            ..Default::default()
        });
        let err = validator
            .validate_block(&parent, &block, stream, &CancellationToken::new())
            .unwrap_err();
        assert!(err.is_validation(), "{err}");
    }

    #[test]
    fn test_incomplete_stream() {
        let validator = validator(ValidationConfig::default());
        let (parent, block, prev) = funded_block(1, 10);
        let mut stream = loaded(&block, &prev);
        stream.pop();
        let err = validator
            .validate_block(&parent, &block, stream, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ChainStateError::Pipeline(_)));
    }

    #[test]
    fn test_structural_only_skips_values() {
        let validator = validator(ValidationConfig::structural_only());
        let (parent, block, _) = funded_block(u64::MAX / 2, 1_000_000);
        validator
            .validate_block(&parent, &block, Vec::new(), &CancellationToken::new())
            .unwrap();
    }
}
