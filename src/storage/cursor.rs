//! Chain state cursor contract
//!
//! A cursor is a transactional view over the chain state: the chain tip, the
//! headers of the connected chain, the UTXO set, the per-block spent and
//! unminted logs, and the global counters. Every call needs an open
//! transaction; mutations additionally need it to be writable.
//!
//! A cursor is used from one thread at a time. Parallel readers each take
//! their own cursor from a [`CursorPool`](crate::storage::pool::CursorPool).

use crate::core::chained_header::ChainedHeader;
use crate::core::unspent::{BlockSpentTxes, UnmintedTx, UnspentTx};
use crate::crypto::Hash256;
use crate::merkle::MerkleError;
use crate::core::encoding::EncodingError;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("No open transaction")]
    NoTransaction,
    #[error("A transaction is already open")]
    TransactionInProgress,
    #[error("Transaction is read-only")]
    ReadOnlyTransaction,
    #[error("Timed out after {0:?} waiting for a cursor")]
    PoolTimeout(Duration),
    #[error("Cursor pool closed")]
    PoolClosed,
    #[error("Block {0} not found in block storage")]
    BlockNotFound(Hash256),
    #[error("Storage corrupt: {0}")]
    Corrupt(String),
    #[error("Merkle tree error: {0}")]
    Merkle(#[from] MerkleError),
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Global chain state counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStateCounters {
    pub unspent_tx_count: u64,
    pub unspent_output_count: u64,
    pub total_tx_count: u64,
    pub total_input_count: u64,
    pub total_output_count: u64,
}

pub trait ChainStateCursor: Send {
    fn in_transaction(&self) -> bool;

    fn begin_transaction(&mut self, read_only: bool) -> Result<(), StorageError>;

    fn commit_transaction(&mut self) -> Result<(), StorageError>;

    fn rollback_transaction(&mut self) -> Result<(), StorageError>;

    // ---- chain tip and counters ----

    fn chain_tip(&self) -> Result<Option<ChainedHeader>, StorageError>;

    fn set_chain_tip(&mut self, tip: ChainedHeader) -> Result<(), StorageError>;

    fn counters(&self) -> Result<ChainStateCounters, StorageError>;

    fn set_counters(&mut self, counters: ChainStateCounters) -> Result<(), StorageError>;

    // ---- headers ----

    fn contains_header(&self, hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.try_get_header(hash)?.is_some())
    }

    fn try_get_header(&self, hash: &Hash256) -> Result<Option<ChainedHeader>, StorageError>;

    fn try_add_header(&mut self, header: ChainedHeader) -> Result<bool, StorageError>;

    fn try_remove_header(&mut self, hash: &Hash256) -> Result<bool, StorageError>;

    /// All stored headers, in no particular order
    fn read_headers(&self) -> Result<Vec<ChainedHeader>, StorageError>;

    // ---- unspent transactions ----

    fn contains_unspent_tx(&self, tx_hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.try_get_unspent_tx(tx_hash)?.is_some())
    }

    fn try_get_unspent_tx(&self, tx_hash: &Hash256) -> Result<Option<UnspentTx>, StorageError>;

    /// Insert; false if the hash is already present
    fn try_add_unspent_tx(&mut self, unspent_tx: UnspentTx) -> Result<bool, StorageError>;

    fn try_remove_unspent_tx(&mut self, tx_hash: &Hash256) -> Result<bool, StorageError>;

    /// Replace; false if the hash is not present
    fn try_update_unspent_tx(&mut self, unspent_tx: UnspentTx) -> Result<bool, StorageError>;

    /// Lazily walk the UTXO set
    fn read_unspent_transactions(
        &self,
    ) -> Result<Box<dyn Iterator<Item = UnspentTx> + '_>, StorageError>;

    /// Hint that `tx_hash` will be read soon
    fn warm_unspent_tx(&self, tx_hash: &Hash256) -> Result<(), StorageError> {
        self.try_get_unspent_tx(tx_hash).map(|_| ())
    }

    // ---- per-block logs ----

    fn contains_block_spent_txes(&self, block_index: u32) -> Result<bool, StorageError> {
        Ok(self.try_get_block_spent_txes(block_index)?.is_some())
    }

    fn try_get_block_spent_txes(
        &self,
        block_index: u32,
    ) -> Result<Option<BlockSpentTxes>, StorageError>;

    fn try_add_block_spent_txes(
        &mut self,
        block_index: u32,
        spent_txes: BlockSpentTxes,
    ) -> Result<bool, StorageError>;

    fn try_remove_block_spent_txes(&mut self, block_index: u32) -> Result<bool, StorageError>;

    fn try_get_block_unminted_txes(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<UnmintedTx>>, StorageError>;

    fn try_add_block_unminted_txes(
        &mut self,
        block_hash: Hash256,
        unminted_txes: Vec<UnmintedTx>,
    ) -> Result<bool, StorageError>;

    fn try_remove_block_unminted_txes(&mut self, block_hash: &Hash256) -> Result<bool, StorageError>;
}
