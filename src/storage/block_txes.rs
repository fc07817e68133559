//! Block transaction body storage
//!
//! Each block is kept as its index-ordered list of merkle nodes. Spent
//! transactions are pruned out of the list while the remaining hashes keep
//! committing to the block's merkle root.

use crate::core::transaction::Transaction;
use crate::crypto::Hash256;
use crate::merkle::{prune_node, BlockTxNode, CachedMerkleCursor, VecMerkleCursor};
use crate::storage::cursor::StorageError;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Storage of block transaction bodies, shared between threads
pub trait BlockTxesStorage: Send + Sync {
    fn contains_block(&self, block_hash: &Hash256) -> Result<bool, StorageError>;

    /// Store a block's transactions as unpruned leaves; false if already stored
    fn try_add_block_transactions(
        &self,
        block_hash: Hash256,
        transactions: &[Transaction],
    ) -> Result<bool, StorageError>;

    /// The transaction at `tx_index`, if its body is still stored
    fn try_get_transaction(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
    ) -> Result<Option<Transaction>, StorageError>;

    /// Stored nodes of a block with pruning applied, in index order
    fn try_read_block_transactions(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<BlockTxNode>>, StorageError>;

    /// Prune the given leaves, keeping their hashes
    fn prune_elements(&self, block_hash: &Hash256, tx_indices: &[u32]) -> Result<(), StorageError>;

    /// Remove the given leaves outright; the first leaf is only pruned
    fn delete_elements(&self, block_hash: &Hash256, tx_indices: &[u32]) -> Result<(), StorageError>;

    fn try_remove_block_transactions(&self, block_hash: &Hash256) -> Result<bool, StorageError>;
}

/// In-memory block storage
#[derive(Debug, Default)]
pub struct MemoryBlockTxesStorage {
    blocks: RwLock<HashMap<Hash256, Vec<BlockTxNode>>>,
}

impl MemoryBlockTxesStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_blocks(blocks: BTreeMap<Hash256, Vec<BlockTxNode>>) -> Self {
        Self {
            blocks: RwLock::new(blocks.into_iter().collect()),
        }
    }

    /// Copy of every stored block, ordered by hash
    pub fn snapshot(&self) -> BTreeMap<Hash256, Vec<BlockTxNode>> {
        self.blocks
            .read()
            .iter()
            .map(|(hash, nodes)| (*hash, nodes.clone()))
            .collect()
    }
}

impl BlockTxesStorage for MemoryBlockTxesStorage {
    fn contains_block(&self, block_hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.blocks.read().contains_key(block_hash))
    }

    fn try_add_block_transactions(
        &self,
        block_hash: Hash256,
        transactions: &[Transaction],
    ) -> Result<bool, StorageError> {
        let mut blocks = self.blocks.write();
        if blocks.contains_key(&block_hash) {
            return Ok(false);
        }
        let nodes = transactions
            .iter()
            .zip(0u32..)
            .map(|(tx, index)| BlockTxNode::leaf(index, tx))
            .collect();
        blocks.insert(block_hash, nodes);
        Ok(true)
    }

    fn try_get_transaction(
        &self,
        block_hash: &Hash256,
        tx_index: u32,
    ) -> Result<Option<Transaction>, StorageError> {
        let blocks = self.blocks.read();
        let nodes = match blocks.get(block_hash) {
            Some(nodes) => nodes,
            None => return Ok(None),
        };
        let node = match nodes.binary_search_by_key(&tx_index, |node| node.index) {
            Ok(position) => &nodes[position],
            Err(_) => return Ok(None),
        };
        if !node.is_leaf() {
            return Ok(None);
        }
        match node.transaction() {
            Some(decoded) => {
                let tx = decoded?;
                if tx.hash() != node.hash {
                    return Err(StorageError::Corrupt(format!(
                        "transaction {} of block {} does not match its hash",
                        tx_index, block_hash
                    )));
                }
                Ok(Some(tx))
            }
            None => Ok(None),
        }
    }

    fn try_read_block_transactions(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<BlockTxNode>>, StorageError> {
        Ok(self.blocks.read().get(block_hash).cloned())
    }

    fn prune_elements(&self, block_hash: &Hash256, tx_indices: &[u32]) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write();
        let nodes = blocks
            .get_mut(block_hash)
            .ok_or(StorageError::BlockNotFound(*block_hash))?;

        let mut cursor = CachedMerkleCursor::new(VecMerkleCursor::new(nodes));
        for index in tx_indices {
            prune_node(&mut cursor, *index)?;
        }
        Ok(())
    }

    fn delete_elements(&self, block_hash: &Hash256, tx_indices: &[u32]) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write();
        let nodes = blocks
            .get_mut(block_hash)
            .ok_or(StorageError::BlockNotFound(*block_hash))?;

        for index in tx_indices {
            if let Ok(position) = nodes.binary_search_by_key(index, |node| node.index) {
                if !nodes[position].is_leaf() {
                    continue;
                }
                if position == 0 {
                    nodes[0] = nodes[0].as_pruned();
                } else {
                    nodes.remove(position);
                }
            }
        }
        Ok(())
    }

    fn try_remove_block_transactions(&self, block_hash: &Hash256) -> Result<bool, StorageError> {
        Ok(self.blocks.write().remove(block_hash).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::Block;
    use crate::merkle::merkle_root_from_nodes;

    fn transactions(count: u32) -> Vec<Transaction> {
        (0..count)
            .map(|i| Transaction::coinbase(i, 10 + i as u64, vec![]))
            .collect()
    }

    #[test]
    fn test_add_and_get() {
        let storage = MemoryBlockTxesStorage::new();
        let txes = transactions(3);
        let hash = Hash256::from_bytes([1u8; 32]);

        assert!(storage.try_add_block_transactions(hash, &txes).unwrap());
        assert!(!storage.try_add_block_transactions(hash, &txes).unwrap());
        assert!(storage.contains_block(&hash).unwrap());
        assert_eq!(storage.try_get_transaction(&hash, 2).unwrap(), Some(txes[2].clone()));
        assert_eq!(storage.try_get_transaction(&hash, 3).unwrap(), None);
        assert_eq!(
            storage.try_get_transaction(&Hash256::ZERO, 0).unwrap(),
            None
        );
    }

    #[test]
    fn test_prune_keeps_root() {
        let storage = MemoryBlockTxesStorage::new();
        let txes = transactions(5);
        let hash = Hash256::from_bytes([2u8; 32]);
        storage.try_add_block_transactions(hash, &txes).unwrap();

        storage.prune_elements(&hash, &[1, 2, 3]).unwrap();
        assert_eq!(storage.try_get_transaction(&hash, 2).unwrap(), None);
        assert_eq!(storage.try_get_transaction(&hash, 4).unwrap(), Some(txes[4].clone()));

        let nodes = storage.try_read_block_transactions(&hash).unwrap().unwrap();
        assert_eq!(
            merkle_root_from_nodes(nodes).unwrap(),
            Block::calculate_merkle_root(&txes)
        );
    }

    #[test]
    fn test_delete_keeps_first_leaf() {
        let storage = MemoryBlockTxesStorage::new();
        let txes = transactions(3);
        let hash = Hash256::from_bytes([3u8; 32]);
        storage.try_add_block_transactions(hash, &txes).unwrap();

        storage.delete_elements(&hash, &[0, 2]).unwrap();
        let nodes = storage.try_read_block_transactions(&hash).unwrap().unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].pruned);
        assert_eq!(nodes[1].index, 1);
    }

    #[test]
    fn test_prune_unknown_block() {
        let storage = MemoryBlockTxesStorage::new();
        assert!(matches!(
            storage.prune_elements(&Hash256::ZERO, &[0]),
            Err(StorageError::BlockNotFound(_))
        ));
    }
}
