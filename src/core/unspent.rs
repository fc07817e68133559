//! UTXO set records
//!
//! An `UnspentTx` tracks which outputs of one confirmed transaction are still
//! spendable. Once every output is spent the record leaves the set, and a
//! `SpentTx` entry in the confirming block's log keeps what a rollback needs
//! to put it back.

use crate::core::transaction::TxOutput;
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Keys
// =============================================================================

/// Reference to one output of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxOutputKey {
    pub tx_hash: Hash256,
    pub output_index: u32,
}

impl TxOutputKey {
    pub fn new(tx_hash: Hash256, output_index: u32) -> Self {
        Self {
            tx_hash,
            output_index,
        }
    }

    /// The key a coinbase input spends
    pub fn null() -> Self {
        Self::new(Hash256::ZERO, u32::MAX)
    }

    pub fn is_null(&self) -> bool {
        self.tx_hash.is_zero() && self.output_index == u32::MAX
    }
}

impl fmt::Display for TxOutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.output_index)
    }
}

/// Location of a confirmed transaction in block storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxLookupKey {
    pub block_hash: Hash256,
    pub tx_index: u32,
}

impl TxLookupKey {
    pub fn new(block_hash: Hash256, tx_index: u32) -> Self {
        Self {
            block_hash,
            tx_index,
        }
    }
}

// =============================================================================
// Output States
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Unspent,
    Spent,
}

/// Fixed-length bit vector of per-output spent state. A set bit means spent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputStates {
    len: u32,
    bits: Vec<u8>,
}

impl OutputStates {
    pub fn new(len: u32, state: OutputState) -> Self {
        let byte_len = (len as usize).div_ceil(8);
        let mut bits = vec![0u8; byte_len];
        if state == OutputState::Spent {
            for index in 0..len {
                bits[(index / 8) as usize] |= 1 << (index % 8);
            }
        }
        Self { len, bits }
    }

    pub fn all_unspent(len: u32) -> Self {
        Self::new(len, OutputState::Unspent)
    }

    pub fn all_spent(len: u32) -> Self {
        Self::new(len, OutputState::Spent)
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> Option<OutputState> {
        if index >= self.len {
            return None;
        }
        if self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0 {
            Some(OutputState::Spent)
        } else {
            Some(OutputState::Unspent)
        }
    }

    /// Copy with one output changed, `None` if the index is out of range
    pub fn with_state(&self, index: u32, state: OutputState) -> Option<Self> {
        if index >= self.len {
            return None;
        }
        let mut bits = self.bits.clone();
        let mask = 1u8 << (index % 8);
        match state {
            OutputState::Spent => bits[(index / 8) as usize] |= mask,
            OutputState::Unspent => bits[(index / 8) as usize] &= !mask,
        }
        Some(Self {
            len: self.len,
            bits,
        })
    }

    pub fn unspent_count(&self) -> u32 {
        (0..self.len)
            .filter(|index| self.get(*index) == Some(OutputState::Unspent))
            .count() as u32
    }

    pub fn is_fully_spent(&self) -> bool {
        self.unspent_count() == 0
    }

    pub fn is_fully_unspent(&self) -> bool {
        self.unspent_count() == self.len
    }
}

// =============================================================================
// UnspentTx
// =============================================================================

/// A confirmed transaction with at least one unspent output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentTx {
    pub tx_hash: Hash256,
    /// Height of the confirming block
    pub block_index: u32,
    pub tx_index: u32,
    pub tx_version: u32,
    pub is_coinbase: bool,
    pub output_states: OutputStates,
    /// Outputs kept inline when the engine is configured to do so
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_outputs: Option<Vec<TxOutput>>,
}

impl UnspentTx {
    pub fn with_output_states(&self, output_states: OutputStates) -> Self {
        Self {
            output_states,
            ..self.clone()
        }
    }

    pub fn is_fully_spent(&self) -> bool {
        self.output_states.is_fully_spent()
    }

    pub fn output_count(&self) -> u32 {
        self.output_states.len()
    }

    pub fn to_spent_tx(&self) -> SpentTx {
        SpentTx {
            tx_hash: self.tx_hash,
            confirmed_block_index: self.block_index,
            tx_index: self.tx_index,
            tx_version: self.tx_version,
            is_coinbase: self.is_coinbase,
            output_count: self.output_count(),
        }
    }
}

// =============================================================================
// Spent / Unminted logs
// =============================================================================

/// A transaction that became fully spent in some block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpentTx {
    pub tx_hash: Hash256,
    pub confirmed_block_index: u32,
    pub tx_index: u32,
    pub tx_version: u32,
    pub is_coinbase: bool,
    pub output_count: u32,
}

impl SpentTx {
    /// The removed record, with every output spent
    pub fn to_unspent_tx(&self, tx_outputs: Option<Vec<TxOutput>>) -> UnspentTx {
        UnspentTx {
            tx_hash: self.tx_hash,
            block_index: self.confirmed_block_index,
            tx_index: self.tx_index,
            tx_version: self.tx_version,
            is_coinbase: self.is_coinbase,
            output_states: OutputStates::all_spent(self.output_count),
            tx_outputs,
        }
    }
}

/// Per-block log of fully spent transactions, ordered by (block index, tx index)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpentTxes(Vec<SpentTx>);

impl BlockSpentTxes {
    pub fn iter(&self) -> impl Iterator<Item = &SpentTx> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find(&self, tx_hash: &Hash256) -> Option<&SpentTx> {
        self.0.iter().find(|spent| spent.tx_hash == *tx_hash)
    }
}

impl FromIterator<SpentTx> for BlockSpentTxes {
    fn from_iter<I: IntoIterator<Item = SpentTx>>(iter: I) -> Self {
        let mut spent: Vec<SpentTx> = iter.into_iter().collect();
        spent.sort_by_key(|tx| (tx.confirmed_block_index, tx.tx_index));
        Self(spent)
    }
}

/// Where the previous transactions of one block transaction live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmintedTx {
    pub tx_hash: Hash256,
    /// One entry per input, in input order
    pub prev_output_tx_keys: Vec<TxLookupKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unspent(outputs: u32) -> UnspentTx {
        UnspentTx {
            tx_hash: Hash256::from_bytes([9u8; 32]),
            block_index: 4,
            tx_index: 2,
            tx_version: 1,
            is_coinbase: false,
            output_states: OutputStates::all_unspent(outputs),
            tx_outputs: None,
        }
    }

    #[test]
    fn test_output_states_partial_spend() {
        let states = OutputStates::all_unspent(3);
        let states = states.with_state(0, OutputState::Spent).unwrap();
        assert_eq!(states.get(0), Some(OutputState::Spent));
        assert_eq!(states.get(1), Some(OutputState::Unspent));
        assert_eq!(states.unspent_count(), 2);

        let states = states.with_state(1, OutputState::Spent).unwrap();
        assert_eq!(states.unspent_count(), 1);
        assert!(!states.is_fully_spent());

        let states = states.with_state(2, OutputState::Spent).unwrap();
        assert!(states.is_fully_spent());
    }

    #[test]
    fn test_output_states_out_of_range() {
        let states = OutputStates::all_unspent(9);
        assert_eq!(states.get(9), None);
        assert!(states.with_state(9, OutputState::Spent).is_none());
        assert_eq!(states.get(8), Some(OutputState::Unspent));
    }

    #[test]
    fn test_all_spent_matches_flipped() {
        let mut states = OutputStates::all_unspent(10);
        for index in 0..10 {
            states = states.with_state(index, OutputState::Spent).unwrap();
        }
        assert_eq!(states, OutputStates::all_spent(10));
    }

    #[test]
    fn test_spent_tx_restores_record() {
        let tx = unspent(2);
        let spent = tx.to_spent_tx();
        let restored = spent.to_unspent_tx(None);
        assert_eq!(restored.output_states, OutputStates::all_spent(2));
        assert_eq!(
            restored.with_output_states(OutputStates::all_unspent(2)),
            tx
        );
    }

    #[test]
    fn test_block_spent_txes_sorted() {
        let mut a = unspent(1).to_spent_tx();
        a.confirmed_block_index = 7;
        let mut b = unspent(1).to_spent_tx();
        b.confirmed_block_index = 3;
        b.tx_index = 5;
        let mut c = unspent(1).to_spent_tx();
        c.confirmed_block_index = 3;
        c.tx_index = 1;

        let log: BlockSpentTxes = vec![a, b, c].into_iter().collect();
        let order: Vec<(u32, u32)> = log
            .iter()
            .map(|tx| (tx.confirmed_block_index, tx.tx_index))
            .collect();
        assert_eq!(order, vec![(3, 1), (3, 5), (7, 2)]);
    }

    #[test]
    fn test_null_key() {
        assert!(TxOutputKey::null().is_null());
        assert!(!TxOutputKey::new(Hash256::ZERO, 0).is_null());
    }
}
