//! Caching decorator for merkle pruning cursors
//!
//! Remembers every node it has read, and which index sits to the left and
//! right of each one, keyed by node index. Navigation over remembered nodes
//! never touches the inner cursor. Writes and deletes go through to the
//! inner cursor immediately.

use crate::merkle::cursor::{MerkleError, MerkleTreePruningCursor};
use crate::merkle::node::BlockTxNode;
use std::collections::HashMap;

pub struct CachedMerkleCursor<C> {
    inner: C,
    /// Index the decorator is positioned on
    current: Option<u32>,
    /// Index the inner cursor is positioned on
    inner_index: Option<u32>,
    /// `None` marks a deleted node
    nodes: HashMap<u32, Option<BlockTxNode>>,
    /// `None` marks a known tree boundary
    left: HashMap<u32, Option<u32>>,
    right: HashMap<u32, Option<u32>>,
    inner_reads: usize,
}

impl<C: MerkleTreePruningCursor> CachedMerkleCursor<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            current: None,
            inner_index: None,
            nodes: HashMap::new(),
            left: HashMap::new(),
            right: HashMap::new(),
            inner_reads: 0,
        }
    }

    /// Nodes fetched from the inner cursor so far
    pub fn inner_reads(&self) -> usize {
        self.inner_reads
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn current(&self) -> Result<u32, MerkleError> {
        self.current.ok_or(MerkleError::NoCurrentNode)
    }

    fn sync_inner(&mut self, index: u32) -> Result<(), MerkleError> {
        if self.inner_index == Some(index) {
            return Ok(());
        }
        if !self.inner.try_move_to_index(index)? {
            return Err(MerkleError::Corrupt(format!(
                "cached node {} missing from storage",
                index
            )));
        }
        self.inner_index = Some(index);
        Ok(())
    }

    fn read_inner(&mut self) -> Result<BlockTxNode, MerkleError> {
        self.inner_reads += 1;
        let node = self.inner.read_node()?;
        self.nodes.insert(node.index, Some(node.clone()));
        Ok(node)
    }

    fn step(&mut self, towards_left: bool) -> Result<bool, MerkleError> {
        let current = self.current()?;
        let cached = if towards_left {
            self.left.get(&current).copied()
        } else {
            self.right.get(&current).copied()
        };

        if let Some(neighbour) = cached {
            return Ok(match neighbour {
                Some(index) => {
                    self.current = Some(index);
                    true
                }
                None => false,
            });
        }

        self.sync_inner(current)?;
        let moved = if towards_left {
            self.inner.try_move_left()?
        } else {
            self.inner.try_move_right()?
        };

        if !moved {
            if towards_left {
                self.left.insert(current, None);
            } else {
                self.right.insert(current, None);
            }
            return Ok(false);
        }

        let node = self.read_inner()?;
        self.inner_index = Some(node.index);
        if towards_left {
            self.left.insert(current, Some(node.index));
            self.right.insert(node.index, Some(current));
        } else {
            self.right.insert(current, Some(node.index));
            self.left.insert(node.index, Some(current));
        }
        self.current = Some(node.index);
        Ok(true)
    }
}

impl<C: MerkleTreePruningCursor> MerkleTreePruningCursor for CachedMerkleCursor<C> {
    fn try_move_to_index(&mut self, index: u32) -> Result<bool, MerkleError> {
        match self.nodes.get(&index) {
            Some(Some(_)) => {
                self.current = Some(index);
                return Ok(true);
            }
            Some(None) => return Ok(false),
            None => {}
        }

        if !self.inner.try_move_to_index(index)? {
            return Ok(false);
        }
        self.inner_index = Some(index);
        self.read_inner()?;
        self.current = Some(index);
        Ok(true)
    }

    fn try_move_left(&mut self) -> Result<bool, MerkleError> {
        self.step(true)
    }

    fn try_move_right(&mut self) -> Result<bool, MerkleError> {
        self.step(false)
    }

    fn read_node(&mut self) -> Result<BlockTxNode, MerkleError> {
        let current = self.current()?;
        match self.nodes.get(&current) {
            Some(Some(node)) => Ok(node.clone()),
            _ => Err(MerkleError::NoCurrentNode),
        }
    }

    fn write_node(&mut self, node: BlockTxNode) -> Result<(), MerkleError> {
        let current = self.current()?;
        self.sync_inner(current)?;
        self.inner.write_node(node.clone())?;
        self.nodes.insert(current, Some(node));
        Ok(())
    }

    fn delete_node(&mut self) -> Result<(), MerkleError> {
        let current = self.current()?;
        self.sync_inner(current)?;
        self.inner.delete_node()?;

        // The inner cursor now sits on the left neighbour
        let left = match self.left.get(&current).copied().flatten() {
            Some(index) => index,
            None => {
                let node = self.read_inner()?;
                node.index
            }
        };
        let right = self.right.get(&current).copied();

        self.nodes.insert(current, None);
        self.left.remove(&current);
        self.right.remove(&current);

        match right {
            Some(right) => {
                self.right.insert(left, right);
                if let Some(index) = right {
                    self.left.insert(index, Some(left));
                }
            }
            None => {
                self.right.remove(&left);
            }
        }

        self.inner_index = Some(left);
        self.current = Some(left);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Transaction;
    use crate::merkle::cursor::VecMerkleCursor;

    fn nodes(count: u32) -> Vec<BlockTxNode> {
        (0..count)
            .map(|i| BlockTxNode::leaf(i, &Transaction::coinbase(i, 1, vec![])))
            .collect()
    }

    #[test]
    fn test_repeated_navigation_hits_cache() {
        let mut nodes = nodes(4);
        let mut cursor = CachedMerkleCursor::new(VecMerkleCursor::new(&mut nodes));

        assert!(cursor.try_move_to_index(1).unwrap());
        assert!(cursor.try_move_right().unwrap());
        assert!(cursor.try_move_left().unwrap());
        let reads = cursor.inner_reads();
        assert_eq!(reads, 2);

        for _ in 0..5 {
            assert!(cursor.try_move_right().unwrap());
            assert!(cursor.try_move_left().unwrap());
        }
        assert!(cursor.try_move_to_index(2).unwrap());
        assert_eq!(cursor.inner_reads(), reads);
    }

    #[test]
    fn test_write_through() {
        let mut nodes = nodes(2);
        {
            let mut cursor = CachedMerkleCursor::new(VecMerkleCursor::new(&mut nodes));
            cursor.try_move_to_index(1).unwrap();
            let pruned = cursor.read_node().unwrap().as_pruned();
            cursor.write_node(pruned.clone()).unwrap();
            assert_eq!(cursor.read_node().unwrap(), pruned);
        }
        assert!(nodes[1].pruned);
    }

    #[test]
    fn test_delete_relinks_neighbours() {
        let mut nodes = nodes(3);
        {
            let mut cursor = CachedMerkleCursor::new(VecMerkleCursor::new(&mut nodes));
            cursor.try_move_to_index(1).unwrap();
            cursor.try_move_right().unwrap();
            cursor.try_move_left().unwrap();

            cursor.delete_node().unwrap();
            assert_eq!(cursor.read_node().unwrap().index, 0);
            assert!(!cursor.try_move_to_index(1).unwrap());

            assert!(cursor.try_move_right().unwrap());
            assert_eq!(cursor.read_node().unwrap().index, 2);
            assert!(cursor.try_move_left().unwrap());
            assert_eq!(cursor.read_node().unwrap().index, 0);
        }
        assert_eq!(nodes.len(), 2);
    }
}
