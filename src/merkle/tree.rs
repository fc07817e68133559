//! Merkle tree pruning and root recomputation over stored nodes
//!
//! Pruning a transaction drops its bytes but keeps its hash. When both
//! children of a parent are pruned they collapse into the parent node, so a
//! block whose transactions are all spent shrinks towards a single root node.

use crate::crypto::Hash256;
use crate::merkle::cursor::{MerkleError, MerkleTreePruningCursor};
use crate::merkle::node::BlockTxNode;

/// Prune the transaction at `index` and collapse pruned sibling pairs above it.
///
/// Pruning an index that is already pruned, or already folded into a parent,
/// changes nothing.
pub fn prune_node<C: MerkleTreePruningCursor>(cursor: &mut C, index: u32) -> Result<(), MerkleError> {
    if !cursor.try_move_to_index(index)? {
        return Ok(());
    }

    let mut node = cursor.read_node()?;
    if !node.pruned {
        node = node.as_pruned();
        cursor.write_node(node.clone())?;
    }

    loop {
        let merged = if node.is_left() {
            if cursor.try_move_right()? {
                let right = cursor.read_node()?;
                if right.pruned && right.depth == node.depth {
                    let parent = node.pair_with(&right);
                    // Delete the right node, landing back on the left one
                    cursor.delete_node()?;
                    cursor.write_node(parent.clone())?;
                    Some(parent)
                } else {
                    None
                }
            } else if node.index != 0 {
                // Last node of an odd level pairs with itself
                let parent = node.pair_with_self();
                cursor.write_node(parent.clone())?;
                Some(parent)
            } else {
                None
            }
        } else {
            if !cursor.try_move_left()? {
                return Err(MerkleError::Corrupt(format!(
                    "right node {} at depth {} has no left neighbour",
                    node.index, node.depth
                )));
            }
            let left = cursor.read_node()?;
            if left.pruned && left.depth == node.depth {
                let parent = left.pair_with(&node);
                if !cursor.try_move_right()? {
                    return Err(MerkleError::Corrupt(format!(
                        "node {} vanished during pruning",
                        node.index
                    )));
                }
                cursor.delete_node()?;
                cursor.write_node(parent.clone())?;
                Some(parent)
            } else {
                None
            }
        };

        match merged {
            Some(parent) => node = parent,
            None => return Ok(()),
        }
    }
}

/// Recompute the merkle root from a block's stored nodes, in index order.
///
/// Works on any mix of pruned and unpruned nodes.
pub fn merkle_root_from_nodes<I>(nodes: I) -> Result<Hash256, MerkleError>
where
    I: IntoIterator<Item = BlockTxNode>,
{
    let mut stack: Vec<BlockTxNode> = Vec::new();
    let mut expected_index = 0u64;

    for node in nodes {
        if node.index as u64 != expected_index {
            return Err(MerkleError::Corrupt(format!(
                "expected node at index {}, found {}",
                expected_index, node.index
            )));
        }
        expected_index = node.end_index();
        stack.push(node);
        collapse_pairs(&mut stack)?;
    }

    if stack.is_empty() {
        return Err(MerkleError::Empty);
    }

    while stack.len() > 1 {
        let top = stack.len() - 1;
        if stack[top].depth >= stack[top - 1].depth {
            return Err(MerkleError::Corrupt(format!(
                "node {} at depth {} cannot close the tree",
                stack[top].index, stack[top].depth
            )));
        }
        let lone = stack[top].pair_with_self();
        stack[top] = lone;
        collapse_pairs(&mut stack)?;
    }

    Ok(stack[0].hash)
}

fn collapse_pairs(stack: &mut Vec<BlockTxNode>) -> Result<(), MerkleError> {
    while stack.len() >= 2 && stack[stack.len() - 1].depth == stack[stack.len() - 2].depth {
        let right = stack.pop().ok_or(MerkleError::Empty)?;
        let left = stack.pop().ok_or(MerkleError::Empty)?;
        if !left.is_left() {
            return Err(MerkleError::Corrupt(format!(
                "node {} at depth {} paired as a left child",
                left.index, left.depth
            )));
        }
        stack.push(left.pair_with(&right));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Transaction;
    use crate::crypto::calculate_merkle_root;
    use crate::merkle::cached_cursor::CachedMerkleCursor;
    use crate::merkle::cursor::VecMerkleCursor;
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, SeedableRng};

    fn leaves(count: u32) -> Vec<BlockTxNode> {
        (0..count)
            .map(|i| BlockTxNode::leaf(i, &Transaction::coinbase(i, 1, vec![])))
            .collect()
    }

    fn expected_root(nodes: &[BlockTxNode]) -> Hash256 {
        let hashes: Vec<Hash256> = nodes.iter().map(|n| n.hash).collect();
        calculate_merkle_root(&hashes)
    }

    fn prune(nodes: &mut Vec<BlockTxNode>, index: u32) {
        let mut cursor = VecMerkleCursor::new(nodes);
        prune_node(&mut cursor, index).unwrap();
    }

    #[test]
    fn test_root_from_unpruned_nodes() {
        for count in 1..=17 {
            let nodes = leaves(count);
            assert_eq!(
                merkle_root_from_nodes(nodes.clone()).unwrap(),
                expected_root(&nodes),
                "{count} leaves"
            );
        }
    }

    #[test]
    fn test_pruning_preserves_root() {
        for count in 1..=12 {
            let original = leaves(count);
            let root = expected_root(&original);
            for index in 0..count {
                let mut nodes = original.clone();
                prune(&mut nodes, index);
                assert_eq!(merkle_root_from_nodes(nodes).unwrap(), root, "{count} leaves, index {index}");
            }
        }
    }

    #[test]
    fn test_prune_is_idempotent() {
        let original = leaves(7);
        let mut nodes = original.clone();
        prune(&mut nodes, 3);
        let once = nodes.clone();
        prune(&mut nodes, 3);
        assert_eq!(nodes, once);
        assert_eq!(merkle_root_from_nodes(nodes).unwrap(), expected_root(&original));
    }

    #[test]
    fn test_prune_all_collapses_to_root() {
        for count in 1..=9 {
            let original = leaves(count);
            let root = expected_root(&original);
            let mut nodes = original.clone();
            for index in 0..count {
                prune(&mut nodes, index);
            }
            assert_eq!(nodes.len(), 1, "{count} leaves");
            assert_eq!(nodes[0].index, 0);
            assert!(nodes[0].pruned);
            assert_eq!(nodes[0].hash, root);
        }
    }

    #[test]
    fn test_random_prune_order_through_cache() {
        let mut rng = StdRng::seed_from_u64(7);
        for count in [5u32, 8, 13] {
            let original = leaves(count);
            let root = expected_root(&original);
            let mut order: Vec<u32> = (0..count).collect();
            order.shuffle(&mut rng);

            let mut nodes = original.clone();
            {
                let mut cursor = CachedMerkleCursor::new(VecMerkleCursor::new(&mut nodes));
                for (step, index) in order.iter().enumerate() {
                    prune_node(&mut cursor, *index).unwrap();
                    if step % 2 == 0 {
                        prune_node(&mut cursor, *index).unwrap();
                    }
                }
            }
            assert_eq!(nodes.len(), 1);
            assert_eq!(merkle_root_from_nodes(nodes).unwrap(), root);
        }
    }

    #[test]
    fn test_coinbase_leaf_is_kept() {
        let mut nodes = leaves(4);
        prune(&mut nodes, 0);
        assert_eq!(nodes.len(), 4);
        assert!(nodes[0].pruned);
        assert!(nodes[0].tx_bytes.is_none());
    }

    #[test]
    fn test_right_node_without_left_is_corrupt() {
        let mut nodes = leaves(4);
        nodes.remove(0);
        let mut cursor = VecMerkleCursor::new(&mut nodes);
        assert!(matches!(
            prune_node(&mut cursor, 1),
            Err(MerkleError::Corrupt(_))
        ));
    }

    #[test]
    fn test_gap_is_corrupt() {
        let mut nodes = leaves(4);
        nodes.remove(2);
        assert!(matches!(
            merkle_root_from_nodes(nodes),
            Err(MerkleError::Corrupt(_))
        ));
        assert_eq!(merkle_root_from_nodes(Vec::new()), Err(MerkleError::Empty));
    }
}
