//! Chain state error taxonomy
//!
//! Consensus failures are permanent, missing data is recoverable, storage
//! corruption is fatal and cancellation is a normal early exit. Parallel work
//! collapses its failures to one error using [`ChainStateError::priority`].

use crate::core::chain::ChainError;
use crate::core::unspent::TxLookupKey;
use crate::crypto::Hash256;
use crate::merkle::MerkleError;
use crate::storage::cursor::StorageError;
use std::fmt;
use thiserror::Error;

/// Data the engine needs but does not have locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingData {
    /// Header not in the index
    Header(Hash256),
    /// Block body not in block storage
    BlockTransactions(Hash256),
    /// A transaction body that is not stored, or was pruned
    Transaction(TxLookupKey),
    /// Rollback data of a block at this height was pruned
    RollbackData { height: u32 },
}

impl fmt::Display for MissingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingData::Header(hash) => write!(f, "header {}", hash),
            MissingData::BlockTransactions(hash) => write!(f, "transactions of block {}", hash),
            MissingData::Transaction(key) => {
                write!(f, "transaction {} of block {}", key.tx_index, key.block_hash)
            }
            MissingData::RollbackData { height } => {
                write!(f, "rollback data of height {} (pruned)", height)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ChainStateError {
    #[error("Block {block_hash} is invalid: {reason}")]
    Validation {
        block_hash: Hash256,
        tx_hash: Option<Hash256>,
        reason: String,
    },
    /// The transactions do not belong to the header. Says nothing about the
    /// header itself, which may still arrive with the right body.
    #[error("Block {block_hash} carries a malformed body: {reason}")]
    MalformedBody { block_hash: Hash256, reason: String },
    #[error("Missing data: {0}")]
    MissingData(MissingData),
    #[error("Chain state storage corrupt: {0}")]
    StorageCorrupt(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Storage error: {0}")]
    Storage(StorageError),
    #[error("Chain error: {0}")]
    Chain(ChainError),
    #[error("Pipeline failure: {0}")]
    Pipeline(String),
}

impl ChainStateError {
    pub fn validation(block_hash: Hash256, reason: impl Into<String>) -> Self {
        ChainStateError::Validation {
            block_hash,
            tx_hash: None,
            reason: reason.into(),
        }
    }

    pub fn tx_validation(block_hash: Hash256, tx_hash: Hash256, reason: impl Into<String>) -> Self {
        ChainStateError::Validation {
            block_hash,
            tx_hash: Some(tx_hash),
            reason: reason.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ChainStateError::Validation { .. })
    }

    pub fn malformed_body(block_hash: Hash256, reason: impl Into<String>) -> Self {
        ChainStateError::MalformedBody {
            block_hash,
            reason: reason.into(),
        }
    }

    pub fn is_malformed_body(&self) -> bool {
        matches!(self, ChainStateError::MalformedBody { .. })
    }

    pub fn is_missing_data(&self) -> bool {
        matches!(self, ChainStateError::MissingData(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChainStateError::Cancelled)
    }

    /// Consensus failures outrank missing data, which outranks everything
    /// else; cancellation ranks lowest
    pub fn priority(&self) -> u8 {
        match self {
            ChainStateError::Validation { .. } => 3,
            ChainStateError::MissingData(_) => 2,
            ChainStateError::Cancelled => 0,
            _ => 1,
        }
    }

    /// Keep whichever error ranks higher; `self` on a tie
    pub fn or_higher(self, other: ChainStateError) -> ChainStateError {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

/// Collapse two outcomes of the same block apply into one
pub fn collapse_results<T>(
    first: Result<T, ChainStateError>,
    second: Result<(), ChainStateError>,
) -> Result<T, ChainStateError> {
    match (first, second) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), Ok(())) | (Ok(_), Err(e)) => Err(e),
        (Err(a), Err(b)) => Err(a.or_higher(b)),
    }
}

impl From<StorageError> for ChainStateError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Corrupt(reason) => ChainStateError::StorageCorrupt(reason),
            StorageError::Merkle(MerkleError::Corrupt(reason)) => {
                ChainStateError::StorageCorrupt(reason)
            }
            other => ChainStateError::Storage(other),
        }
    }
}

impl From<ChainError> for ChainStateError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::Cancelled => ChainStateError::Cancelled,
            other => ChainStateError::Chain(other),
        }
    }
}

impl From<MissingData> for ChainStateError {
    fn from(missing: MissingData) -> Self {
        ChainStateError::MissingData(missing)
    }
}
