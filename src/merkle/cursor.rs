//! Cursor over the stored nodes of one block's merkle tree
//!
//! Nodes are kept in index order. Moving left or right steps to the
//! neighbouring stored node, whatever its depth.

use crate::merkle::node::BlockTxNode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Cursor is not positioned on a node")]
    NoCurrentNode,
    #[error("Only pruned nodes may be written (index {0})")]
    IllegalWrite(u32),
    #[error("Written node index {written} does not match cursor index {current}")]
    IndexMismatch { current: u32, written: u32 },
    #[error("The first node of a tree cannot be deleted")]
    DeleteFirstNode,
    #[error("Merkle tree has no nodes")]
    Empty,
    #[error("Merkle tree storage corrupt: {0}")]
    Corrupt(String),
}

/// Navigation and mutation over a block's stored merkle nodes
pub trait MerkleTreePruningCursor {
    /// Position on the node whose index is `index`
    fn try_move_to_index(&mut self, index: u32) -> Result<bool, MerkleError>;

    /// Step to the previous node; false at the start of the tree
    fn try_move_left(&mut self) -> Result<bool, MerkleError>;

    /// Step to the next node; false at the end of the tree
    fn try_move_right(&mut self) -> Result<bool, MerkleError>;

    fn read_node(&mut self) -> Result<BlockTxNode, MerkleError>;

    /// Replace the current node with a pruned node of the same index
    fn write_node(&mut self, node: BlockTxNode) -> Result<(), MerkleError>;

    /// Remove the current node and move to its left neighbour
    fn delete_node(&mut self) -> Result<(), MerkleError>;
}

/// Cursor over an in-memory, index-ordered node list
pub struct VecMerkleCursor<'a> {
    nodes: &'a mut Vec<BlockTxNode>,
    position: Option<usize>,
}

impl<'a> VecMerkleCursor<'a> {
    pub fn new(nodes: &'a mut Vec<BlockTxNode>) -> Self {
        Self {
            nodes,
            position: None,
        }
    }

    fn position(&self) -> Result<usize, MerkleError> {
        self.position.ok_or(MerkleError::NoCurrentNode)
    }
}

impl MerkleTreePruningCursor for VecMerkleCursor<'_> {
    fn try_move_to_index(&mut self, index: u32) -> Result<bool, MerkleError> {
        match self.nodes.binary_search_by_key(&index, |node| node.index) {
            Ok(position) => {
                self.position = Some(position);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn try_move_left(&mut self) -> Result<bool, MerkleError> {
        let position = self.position()?;
        if position == 0 {
            return Ok(false);
        }
        self.position = Some(position - 1);
        Ok(true)
    }

    fn try_move_right(&mut self) -> Result<bool, MerkleError> {
        let position = self.position()?;
        if position + 1 >= self.nodes.len() {
            return Ok(false);
        }
        self.position = Some(position + 1);
        Ok(true)
    }

    fn read_node(&mut self) -> Result<BlockTxNode, MerkleError> {
        let position = self.position()?;
        Ok(self.nodes[position].clone())
    }

    fn write_node(&mut self, node: BlockTxNode) -> Result<(), MerkleError> {
        let position = self.position()?;
        if !node.pruned {
            return Err(MerkleError::IllegalWrite(node.index));
        }
        let current = self.nodes[position].index;
        if node.index != current {
            return Err(MerkleError::IndexMismatch {
                current,
                written: node.index,
            });
        }
        self.nodes[position] = node;
        Ok(())
    }

    fn delete_node(&mut self) -> Result<(), MerkleError> {
        let position = self.position()?;
        if position == 0 {
            return Err(MerkleError::DeleteFirstNode);
        }
        self.nodes.remove(position);
        self.position = Some(position - 1);
        Ok(())
    }
}
