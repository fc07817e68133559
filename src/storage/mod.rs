//! Storage module for the chain state
//!
//! - Cursor contract over the chain state and its in-memory backend
//! - Block transaction body storage
//! - Bounded cursor pool
//! - Snapshot persistence and block pruning

pub mod block_txes;
pub mod cursor;
pub mod memory;
pub mod persistence;
pub mod pool;
pub mod pruning;

pub use block_txes::{BlockTxesStorage, MemoryBlockTxesStorage};
pub use cursor::{ChainStateCounters, ChainStateCursor, StorageError};
pub use memory::{ChainStateData, MemoryChainStateCursor, MemoryChainStateStorage};
pub use persistence::{ChainStateSnapshot, SnapshotConfig, SnapshotStorage};
pub use pool::{CursorPool, PooledCursor};
pub use pruning::{PruneRange, PruneState, Pruner, PrunerConfig};
