//! UTXO chain-state engine
//!
//! This crate keeps the state of a UTXO blockchain as blocks arrive:
//! - Proof of Work validation with difficulty retargeting
//! - Parallel transaction validation with fee and coinbase accounting
//! - UTXO set maintenance with per-block rollback logs
//! - Chain reorganization towards the branch with the most work
//! - Merkle-tree pruning of spent transaction bodies
//! - JSON snapshot persistence
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use utxo_chainstate::chainstate::{ChainStateConfig, MemoryChainState};
//! use utxo_chainstate::consensus::ChainParams;
//! use utxo_chainstate::core::StandardScriptVerifier;
//!
//! // Open an empty regtest chain state; the genesis block is written for us
//! let state = MemoryChainState::new(
//!     ChainParams::regtest(),
//!     ChainStateConfig::default(),
//!     Arc::new(StandardScriptVerifier),
//! )?;
//!
//! assert_eq!(state.height(), 0);
//! println!("Tip: {}", state.tip().hash);
//! # Ok::<(), utxo_chainstate::chainstate::ChainStateError>(())
//! ```

pub mod chainstate;
pub mod cli;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod merkle;
pub mod storage;

#[cfg(test)]
mod test_util;

// Re-export commonly used types
pub use chainstate::{
    ChainStateBuilder, ChainStateConfig, ChainStateError, MemoryChainState, ValidationConfig,
};
pub use consensus::{ChainParams, Network};
pub use core::{Block, BlockHeader, BlockStatus, Chain, ChainedHeader, Transaction, UnspentTx};
pub use crypto::Hash256;
pub use storage::{ChainStateCursor, MemoryChainStateStorage, SnapshotStorage};
