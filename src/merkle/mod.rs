//! Prunable merkle trees of block transactions
//!
//! Block storage keeps each block as its list of merkle nodes. Spent
//! transactions are pruned out of that list while the remaining hashes still
//! commit to the header's merkle root.

pub mod cached_cursor;
pub mod cursor;
pub mod node;
pub mod tree;

pub use cached_cursor::CachedMerkleCursor;
pub use cursor::{MerkleError, MerkleTreePruningCursor, VecMerkleCursor};
pub use node::BlockTxNode;
pub use tree::{merkle_root_from_nodes, prune_node};
