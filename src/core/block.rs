//! Block implementation for the chain state
//!
//! A block contains an 80-byte header and a list of transactions.

use crate::core::encoding::{Decoder, Encoder, EncodingError};
use crate::core::transaction::Transaction;
use crate::crypto::{calculate_merkle_root, double_sha256, merkle_root_with_mutation, Hash256};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Block header containing metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block
    pub previous_hash: Hash256,
    /// Merkle root of all transactions
    pub merkle_root: Hash256,
    /// Block time, seconds since the Unix epoch
    pub time: u32,
    /// Compact proof-of-work target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Canonical 80-byte encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(BLOCK_HEADER_SIZE);
        encoder.write_u32_le(self.version);
        encoder.write_bytes(self.previous_hash.as_bytes());
        encoder.write_bytes(self.merkle_root.as_bytes());
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self {
            version: decoder.read_u32_le()?,
            previous_hash: Hash256::from_bytes(decoder.read_array32()?),
            merkle_root: Hash256::from_bytes(decoder.read_array32()?),
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        };
        decoder.finish()?;
        Ok(header)
    }

    /// Double SHA-256 of the 80-byte encoding
    pub fn hash(&self) -> Hash256 {
        double_sha256(&self.to_bytes())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.time as i64, 0)
            .single()
            .unwrap_or_default()
    }
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Merkle root over the transaction hashes
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash256 {
        let hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.hash()).collect();
        calculate_merkle_root(&hashes)
    }

    /// Whether the declared merkle root matches the transactions
    pub fn has_valid_merkle_root(&self) -> bool {
        self.header.merkle_root == Self::calculate_merkle_root(&self.transactions)
    }

    /// Whether the transaction list repeats hashes in a way that leaves the
    /// merkle root unchanged. The header hash then says nothing about the body.
    pub fn is_mutated(&self) -> bool {
        let hashes: Vec<Hash256> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root_with_mutation(&hashes).1
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            previous_hash: Hash256::from_bytes([3u8; 32]),
            merkle_root: Hash256::from_bytes([4u8; 32]),
            time: 1_700_000_000,
            bits: 0x207fffff,
            nonce: 42,
        }
    }

    #[test]
    fn test_header_is_80_bytes() {
        assert_eq!(header().to_bytes().len(), BLOCK_HEADER_SIZE);
    }

    #[test]
    fn test_header_decode() {
        let header = header();
        let decoded = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn test_nonce_changes_hash() {
        let a = header();
        let mut b = header();
        b.nonce += 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_merkle_root_check() {
        let coinbase = Transaction::coinbase(1, 50, vec![]);
        let mut header = header();
        header.merkle_root = Block::calculate_merkle_root(std::slice::from_ref(&coinbase));
        let block = Block::new(header, vec![coinbase]);
        assert!(block.has_valid_merkle_root());

        let mut tampered = block.clone();
        tampered.header.merkle_root = Hash256::ZERO;
        assert!(!tampered.has_valid_merkle_root());
    }

    #[test]
    fn test_repeated_transactions_are_mutated() {
        let txs = vec![
            Transaction::coinbase(1, 50, vec![]),
            Transaction::coinbase(2, 50, vec![]),
            Transaction::coinbase(3, 50, vec![]),
        ];
        let mut header = header();
        header.merkle_root = Block::calculate_merkle_root(&txs);
        let block = Block::new(header, txs.clone());
        assert!(!block.is_mutated());

        let mut repeated = txs;
        repeated.push(repeated[2].clone());
        let mutated = Block::new(block.header.clone(), repeated);
        assert!(mutated.has_valid_merkle_root());
        assert_eq!(mutated.hash(), block.hash());
        assert!(mutated.is_mutated());
    }
}
