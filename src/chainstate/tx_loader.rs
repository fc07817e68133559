//! Previous-output resolution for block validation
//!
//! The UTXO builder describes every transaction it applies as a
//! [`LoadingTx`]: the transaction plus, per input, where the funding
//! transaction lives. [`TxLoader`] turns that into a [`LoadedTx`] carrying the
//! actual previous outputs, looking in order at:
//!
//! 1. earlier transactions of the block being connected,
//! 2. outputs kept inline in the UTXO record,
//! 3. block storage.

use crate::chainstate::error::{ChainStateError, MissingData};
use crate::chainstate::lookahead::{look_ahead, LookAhead};
use crate::core::transaction::{Transaction, TxOutput};
use crate::core::unspent::TxLookupKey;
use crate::crypto::Hash256;
use crate::storage::block_txes::BlockTxesStorage;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A transaction as applied to the UTXO set, before its inputs are resolved
#[derive(Debug, Clone)]
pub struct LoadingTx {
    pub tx_index: u32,
    pub transaction: Transaction,
    /// One key per input, in input order; empty for the coinbase
    pub prev_output_tx_keys: Vec<TxLookupKey>,
    /// Previous outputs read from inline UTXO records, per input
    pub inline_prev_outputs: Vec<Option<TxOutput>>,
}

/// A transaction with the output spent by each of its inputs
#[derive(Debug, Clone)]
pub struct LoadedTx {
    pub tx_index: u32,
    pub transaction: Transaction,
    /// One entry per input, in input order; empty for the coinbase
    pub prev_outputs: Vec<TxOutput>,
}

impl LoadedTx {
    pub fn is_coinbase(&self) -> bool {
        self.prev_outputs.is_empty() && self.transaction.is_coinbase()
    }
}

pub struct TxLoader {
    block_hash: Hash256,
    block_transactions: Arc<Vec<Transaction>>,
    block_txes: Arc<dyn BlockTxesStorage>,
}

impl TxLoader {
    pub fn new(
        block_hash: Hash256,
        block_transactions: Arc<Vec<Transaction>>,
        block_txes: Arc<dyn BlockTxesStorage>,
    ) -> Self {
        Self {
            block_hash,
            block_transactions,
            block_txes,
        }
    }

    pub fn load(&self, loading: LoadingTx) -> Result<LoadedTx, ChainStateError> {
        let LoadingTx {
            tx_index,
            transaction,
            prev_output_tx_keys,
            mut inline_prev_outputs,
        } = loading;

        if tx_index == 0 && transaction.is_coinbase() {
            return Ok(LoadedTx {
                tx_index,
                transaction,
                prev_outputs: Vec::new(),
            });
        }

        if prev_output_tx_keys.len() != transaction.inputs().len() {
            return Err(ChainStateError::Pipeline(format!(
                "transaction {} has {} inputs but {} lookup keys",
                transaction.hash(),
                transaction.inputs().len(),
                prev_output_tx_keys.len()
            )));
        }
        inline_prev_outputs.resize(prev_output_tx_keys.len(), None);

        let mut prev_outputs = Vec::with_capacity(prev_output_tx_keys.len());
        for ((input, key), inline) in transaction
            .inputs()
            .iter()
            .zip(&prev_output_tx_keys)
            .zip(inline_prev_outputs)
        {
            let output = match inline {
                Some(output) => output,
                None => {
                    let prev_tx = self.load_transaction(key)?;
                    if prev_tx.hash() != input.previous_output.tx_hash {
                        return Err(ChainStateError::StorageCorrupt(format!(
                            "transaction {} of block {} is {}, expected {}",
                            key.tx_index,
                            key.block_hash,
                            prev_tx.hash(),
                            input.previous_output.tx_hash
                        )));
                    }
                    prev_tx
                        .outputs()
                        .get(input.previous_output.output_index as usize)
                        .cloned()
                        .ok_or_else(|| {
                            ChainStateError::StorageCorrupt(format!(
                                "output {} missing from stored transaction",
                                input.previous_output
                            ))
                        })?
                }
            };
            prev_outputs.push(output);
        }

        Ok(LoadedTx {
            tx_index,
            transaction,
            prev_outputs,
        })
    }

    fn load_transaction(&self, key: &TxLookupKey) -> Result<Transaction, ChainStateError> {
        if key.block_hash == self.block_hash {
            return self
                .block_transactions
                .get(key.tx_index as usize)
                .cloned()
                .ok_or(ChainStateError::MissingData(MissingData::Transaction(*key)));
        }
        self.block_txes
            .try_get_transaction(&key.block_hash, key.tx_index)?
            .ok_or(ChainStateError::MissingData(MissingData::Transaction(*key)))
    }

    /// Resolve a stream of loading transactions on `workers` threads, in order
    pub fn load_all(
        self,
        loading: Receiver<LoadingTx>,
        workers: usize,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<LookAhead<LoadedTx>, ChainStateError> {
        let loader = Arc::new(self);
        look_ahead("tx-loader", loading, workers, capacity, cancel, move |tx| {
            loader.load(tx)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::TxInput;
    use crate::core::unspent::TxOutputKey;
    use crate::storage::block_txes::MemoryBlockTxesStorage;

    fn spend(prev: &Transaction, index: u32, value: u64) -> Transaction {
        Transaction::new(
            1,
            vec![TxInput::new(TxOutputKey::new(prev.hash(), index), vec![])],
            vec![TxOutput::new(value, vec![])],
            0,
        )
    }

    #[test]
    fn test_resolution_order() {
        let stored = Transaction::coinbase(1, 50, vec![0x51]);
        let stored_block = Hash256::from_bytes([1u8; 32]);
        let block_txes = Arc::new(MemoryBlockTxesStorage::new());
        block_txes
            .try_add_block_transactions(stored_block, &[stored.clone()])
            .unwrap();

        let coinbase = Transaction::coinbase(2, 50, vec![]);
        let first = spend(&stored, 0, 40);
        let second = spend(&first, 0, 30);
        let this_block = Hash256::from_bytes([2u8; 32]);
        let txes = Arc::new(vec![coinbase, first.clone(), second.clone()]);
        let loader = TxLoader::new(this_block, txes, block_txes);

        let loaded = loader
            .load(LoadingTx {
                tx_index: 1,
                transaction: first.clone(),
                prev_output_tx_keys: vec![TxLookupKey::new(stored_block, 0)],
                inline_prev_outputs: vec![None],
            })
            .unwrap();
        assert_eq!(loaded.prev_outputs, vec![TxOutput::new(50, vec![0x51])]);

        let loaded = loader
            .load(LoadingTx {
                tx_index: 2,
                transaction: second,
                prev_output_tx_keys: vec![TxLookupKey::new(this_block, 1)],
                inline_prev_outputs: vec![None],
            })
            .unwrap();
        assert_eq!(loaded.prev_outputs, vec![TxOutput::new(40, vec![])]);

        let inline = TxOutput::new(7, vec![]);
        let loaded = loader
            .load(LoadingTx {
                tx_index: 1,
                transaction: first,
                prev_output_tx_keys: vec![TxLookupKey::new(Hash256::ZERO, 9)],
                inline_prev_outputs: vec![Some(inline.clone())],
            })
            .unwrap();
        assert_eq!(loaded.prev_outputs, vec![inline]);
    }

    #[test]
    fn test_pruned_transaction_is_missing_data() {
        let stored = Transaction::coinbase(1, 50, vec![]);
        let stored_block = Hash256::from_bytes([1u8; 32]);
        let block_txes = Arc::new(MemoryBlockTxesStorage::new());
        block_txes
            .try_add_block_transactions(stored_block, &[stored.clone()])
            .unwrap();
        block_txes.prune_elements(&stored_block, &[0]).unwrap();

        let tx = spend(&stored, 0, 10);
        let loader = TxLoader::new(Hash256::ZERO, Arc::new(Vec::new()), block_txes);
        let result = loader.load(LoadingTx {
            tx_index: 1,
            transaction: tx,
            prev_output_tx_keys: vec![TxLookupKey::new(stored_block, 0)],
            inline_prev_outputs: vec![None],
        });
        assert!(result.unwrap_err().is_missing_data());
    }
}
