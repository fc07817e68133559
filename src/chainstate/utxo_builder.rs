//! UTXO set transitions
//!
//! Connecting a block spends the outputs its inputs reference and records
//! its own outputs as unspent. Every fully spent transaction is removed from
//! the set and logged in the block's spent-tx log; the funding location of
//! every input is logged in the block's unminted-tx list. Rolling back replays
//! those logs in reverse.

use crate::chainstate::error::ChainStateError;
use crate::chainstate::tx_loader::LoadingTx;
use crate::core::chain::Chain;
use crate::core::transaction::{Transaction, TxInput, TxOutput};
use crate::core::unspent::{
    BlockSpentTxes, OutputState, OutputStates, SpentTx, TxLookupKey, UnmintedTx, UnspentTx,
};
use crate::crypto::Hash256;
use crate::storage::block_txes::BlockTxesStorage;
use crate::storage::cursor::{ChainStateCounters, ChainStateCursor};
use crossbeam_channel::Sender;
use tokio_util::sync::CancellationToken;

/// Rollback logs produced by connecting one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUtxoChanges {
    pub spent_txes: BlockSpentTxes,
    pub unminted_txes: Vec<UnmintedTx>,
}

/// Applies blocks to the UTXO set through a cursor with an open write transaction
pub struct UtxoBuilder<'a, C: ChainStateCursor + ?Sized> {
    cursor: &'a mut C,
    inline_outputs: bool,
}

impl<'a, C: ChainStateCursor + ?Sized> UtxoBuilder<'a, C> {
    pub fn new(cursor: &'a mut C, inline_outputs: bool) -> Self {
        Self {
            cursor,
            inline_outputs,
        }
    }

    // =========================================================================
    // Connect
    // =========================================================================

    /// Apply the block at the tip of `chain`.
    ///
    /// `transactions` yields `(tx_index, tx)` in block order. Each applied
    /// transaction is forwarded to `loading` for validation; a closed
    /// receiver is not an error.
    pub fn calculate_utxo<I>(
        &mut self,
        chain: &Chain,
        transactions: I,
        loading: Option<&Sender<LoadingTx>>,
        cancel: &CancellationToken,
    ) -> Result<BlockUtxoChanges, ChainStateError>
    where
        I: IntoIterator<Item = Result<(u32, Transaction), ChainStateError>>,
    {
        let block = chain.tip();
        let block_hash = block.hash;
        let block_index = block.height;
        let mut counters = self.cursor.counters()?;
        let mut spent_txes = Vec::new();
        let mut unminted_txes = Vec::new();

        for item in transactions {
            if cancel.is_cancelled() {
                return Err(ChainStateError::Cancelled);
            }
            let (tx_index, tx) = item?;
            let tx_hash = tx.hash();

            if tx.outputs().is_empty() {
                return Err(ChainStateError::tx_validation(
                    block_hash,
                    tx_hash,
                    "Transaction has no outputs",
                ));
            }

            let mut prev_output_tx_keys = Vec::new();
            let mut inline_prev_outputs = Vec::new();
            if tx_index == 0 && tx.is_coinbase() {
                // The coinbase spends nothing
            } else {
                if tx.inputs().is_empty() {
                    return Err(ChainStateError::tx_validation(
                        block_hash,
                        tx_hash,
                        "Transaction has no inputs",
                    ));
                }
                for input in tx.inputs() {
                    let (key, inline) =
                        self.spend(chain, block_hash, tx_hash, input, &mut spent_txes, &mut counters)?;
                    prev_output_tx_keys.push(key);
                    inline_prev_outputs.push(inline);
                }
            }

            let unspent = UnspentTx {
                tx_hash,
                block_index,
                tx_index,
                tx_version: tx.version(),
                is_coinbase: tx.is_coinbase(),
                output_states: OutputStates::all_unspent(tx.outputs().len() as u32),
                tx_outputs: self.inline_outputs.then(|| tx.outputs().to_vec()),
            };
            if !self.cursor.try_add_unspent_tx(unspent)? {
                return Err(ChainStateError::tx_validation(
                    block_hash,
                    tx_hash,
                    "Duplicate transaction",
                ));
            }

            counters = Counter::Connect.apply_tx(counters, &tx)?;
            unminted_txes.push(UnmintedTx {
                tx_hash,
                prev_output_tx_keys: prev_output_tx_keys.clone(),
            });

            if let Some(loading) = loading {
                let _ = loading.send(LoadingTx {
                    tx_index,
                    transaction: tx,
                    prev_output_tx_keys,
                    inline_prev_outputs,
                });
            }
        }

        self.cursor.set_counters(counters)?;
        Ok(BlockUtxoChanges {
            spent_txes: spent_txes.into_iter().collect(),
            unminted_txes,
        })
    }

    fn spend(
        &mut self,
        chain: &Chain,
        block_hash: Hash256,
        tx_hash: Hash256,
        input: &TxInput,
        spent_txes: &mut Vec<SpentTx>,
        counters: &mut ChainStateCounters,
    ) -> Result<(TxLookupKey, Option<TxOutput>), ChainStateError> {
        let key = &input.previous_output;
        let unspent = self.cursor.try_get_unspent_tx(&key.tx_hash)?.ok_or_else(|| {
            ChainStateError::tx_validation(
                block_hash,
                tx_hash,
                format!("Double spend: {} is not in the UTXO set", key),
            )
        })?;

        let output_states = match unspent.output_states.get(key.output_index) {
            Some(OutputState::Unspent) => unspent
                .output_states
                .with_state(key.output_index, OutputState::Spent)
                .ok_or_else(|| {
                    ChainStateError::StorageCorrupt(format!("cannot flip output {}", key))
                })?,
            Some(OutputState::Spent) => {
                return Err(ChainStateError::tx_validation(
                    block_hash,
                    tx_hash,
                    format!("Double spend: {} is already spent", key),
                ))
            }
            None => {
                return Err(ChainStateError::tx_validation(
                    block_hash,
                    tx_hash,
                    format!("Output {} does not exist", key),
                ))
            }
        };

        let confirming = chain.get(unspent.block_index).ok_or_else(|| {
            ChainStateError::StorageCorrupt(format!(
                "unspent transaction {} confirmed at unknown height {}",
                unspent.tx_hash, unspent.block_index
            ))
        })?;
        let lookup = TxLookupKey::new(confirming.hash, unspent.tx_index);
        let inline = unspent
            .tx_outputs
            .as_ref()
            .and_then(|outputs| outputs.get(key.output_index as usize).cloned());

        let updated = unspent.with_output_states(output_states);
        if updated.is_fully_spent() {
            if !self.cursor.try_remove_unspent_tx(&updated.tx_hash)? {
                return Err(ChainStateError::StorageCorrupt(format!(
                    "unspent transaction {} vanished",
                    updated.tx_hash
                )));
            }
            spent_txes.push(updated.to_spent_tx());
            counters.unspent_tx_count = decrement(counters.unspent_tx_count, "unspent tx")?;
        } else if !self.cursor.try_update_unspent_tx(updated)? {
            return Err(ChainStateError::StorageCorrupt(format!(
                "unspent transaction {} vanished",
                key.tx_hash
            )));
        }
        counters.unspent_output_count = decrement(counters.unspent_output_count, "unspent output")?;

        Ok((lookup, inline))
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Undo the block at the tip of `chain`
    pub fn rollback_utxo(
        &mut self,
        chain: &Chain,
        transactions: &[Transaction],
        spent_txes: &BlockSpentTxes,
        unminted_txes: &[UnmintedTx],
        block_txes: &dyn BlockTxesStorage,
    ) -> Result<(), ChainStateError> {
        let block_hash = chain.tip().hash;
        if unminted_txes.len() != transactions.len() {
            return Err(ChainStateError::StorageCorrupt(format!(
                "block {} has {} transactions but {} unminted entries",
                block_hash,
                transactions.len(),
                unminted_txes.len()
            )));
        }

        let mut counters = self.cursor.counters()?;

        for (tx_index, tx) in transactions.iter().enumerate().rev() {
            let tx_hash = tx.hash();
            let unminted = &unminted_txes[tx_index];
            if unminted.tx_hash != tx_hash {
                return Err(ChainStateError::StorageCorrupt(format!(
                    "unminted entry {} of block {} is {}, expected {}",
                    tx_index, block_hash, unminted.tx_hash, tx_hash
                )));
            }

            // The transaction's own outputs must all be unspent again by now
            let own = self.cursor.try_get_unspent_tx(&tx_hash)?.ok_or_else(|| {
                ChainStateError::StorageCorrupt(format!(
                    "transaction {} of block {} is not in the UTXO set",
                    tx_hash, block_hash
                ))
            })?;
            if !own.output_states.is_fully_unspent() {
                return Err(ChainStateError::StorageCorrupt(format!(
                    "transaction {} is still spent by a later block",
                    tx_hash
                )));
            }
            self.cursor.try_remove_unspent_tx(&tx_hash)?;

            let is_coinbase = tx_index == 0 && tx.is_coinbase();
            if !is_coinbase {
                if unminted.prev_output_tx_keys.len() != tx.inputs().len() {
                    return Err(ChainStateError::StorageCorrupt(format!(
                        "unminted entry of {} has {} keys for {} inputs",
                        tx_hash,
                        unminted.prev_output_tx_keys.len(),
                        tx.inputs().len()
                    )));
                }
                for (input, key) in tx
                    .inputs()
                    .iter()
                    .zip(&unminted.prev_output_tx_keys)
                    .rev()
                {
                    self.unspend(
                        chain,
                        transactions,
                        input,
                        key,
                        spent_txes,
                        block_txes,
                        &mut counters,
                    )?;
                }
            }

            counters = Counter::Rollback.apply_tx(counters, tx)?;
        }

        self.cursor.set_counters(counters)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn unspend(
        &mut self,
        chain: &Chain,
        transactions: &[Transaction],
        input: &TxInput,
        key: &TxLookupKey,
        spent_txes: &BlockSpentTxes,
        block_txes: &dyn BlockTxesStorage,
        counters: &mut ChainStateCounters,
    ) -> Result<(), ChainStateError> {
        let outpoint = &input.previous_output;
        let unspent = match self.cursor.try_get_unspent_tx(&outpoint.tx_hash)? {
            Some(unspent) => unspent,
            None => {
                let spent = spent_txes.find(&outpoint.tx_hash).ok_or_else(|| {
                    ChainStateError::StorageCorrupt(format!(
                        "{} is neither unspent nor in the spent-tx log",
                        outpoint.tx_hash
                    ))
                })?;
                let outputs = if self.inline_outputs {
                    Some(self.reload_outputs(chain, transactions, key, block_txes)?)
                } else {
                    None
                };
                let restored = spent.to_unspent_tx(outputs);
                self.cursor.try_add_unspent_tx(restored.clone())?;
                counters.unspent_tx_count = increment(counters.unspent_tx_count)?;
                restored
            }
        };

        let confirming = chain.get(unspent.block_index).ok_or_else(|| {
            ChainStateError::StorageCorrupt(format!(
                "{} confirmed at unknown height {}",
                unspent.tx_hash, unspent.block_index
            ))
        })?;
        if confirming.hash != key.block_hash || unspent.tx_index != key.tx_index {
            return Err(ChainStateError::StorageCorrupt(format!(
                "{} is recorded at {}:{} but the unminted log says {}:{}",
                unspent.tx_hash, confirming.hash, unspent.tx_index, key.block_hash, key.tx_index
            )));
        }

        let output_states = match unspent.output_states.get(outpoint.output_index) {
            Some(OutputState::Spent) => unspent
                .output_states
                .with_state(outpoint.output_index, OutputState::Unspent),
            _ => None,
        }
        .ok_or_else(|| {
            ChainStateError::StorageCorrupt(format!("output {} was not spent", outpoint))
        })?;

        self.cursor
            .try_update_unspent_tx(unspent.with_output_states(output_states))?;
        counters.unspent_output_count = increment(counters.unspent_output_count)?;
        Ok(())
    }

    fn reload_outputs(
        &self,
        chain: &Chain,
        transactions: &[Transaction],
        key: &TxLookupKey,
        block_txes: &dyn BlockTxesStorage,
    ) -> Result<Vec<TxOutput>, ChainStateError> {
        let tx = if key.block_hash == chain.tip().hash {
            transactions.get(key.tx_index as usize).cloned()
        } else {
            block_txes.try_get_transaction(&key.block_hash, key.tx_index)?
        };
        tx.map(|tx| tx.outputs().to_vec()).ok_or_else(|| {
            ChainStateError::MissingData(crate::chainstate::error::MissingData::Transaction(*key))
        })
    }
}

// =============================================================================
// Counters
// =============================================================================

enum Counter {
    Connect,
    Rollback,
}

impl Counter {
    /// Totals and the new unspent record of one transaction
    fn apply_tx(
        &self,
        counters: ChainStateCounters,
        tx: &Transaction,
    ) -> Result<ChainStateCounters, ChainStateError> {
        let inputs = if tx.is_coinbase() { 0 } else { tx.inputs().len() as u64 };
        let outputs = tx.outputs().len() as u64;
        let step = |value: u64, by: u64| match self {
            Counter::Connect => value.checked_add(by),
            Counter::Rollback => value.checked_sub(by),
        };
        let overflow = || ChainStateError::StorageCorrupt("chain state counters out of range".into());

        Ok(ChainStateCounters {
            unspent_tx_count: step(counters.unspent_tx_count, 1).ok_or_else(overflow)?,
            unspent_output_count: step(counters.unspent_output_count, outputs).ok_or_else(overflow)?,
            total_tx_count: step(counters.total_tx_count, 1).ok_or_else(overflow)?,
            total_input_count: step(counters.total_input_count, inputs).ok_or_else(overflow)?,
            total_output_count: step(counters.total_output_count, outputs).ok_or_else(overflow)?,
        })
    }
}

fn increment(value: u64) -> Result<u64, ChainStateError> {
    value
        .checked_add(1)
        .ok_or_else(|| ChainStateError::StorageCorrupt("chain state counters out of range".into()))
}

fn decrement(value: u64, what: &str) -> Result<u64, ChainStateError> {
    value
        .checked_sub(1)
        .ok_or_else(|| ChainStateError::StorageCorrupt(format!("{} count below zero", what)))
}
