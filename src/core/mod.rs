//! Core chain components
//!
//! This module contains the fundamental building blocks:
//! - Transactions and blocks with their canonical encoding
//! - Chained headers, immutable chains and the chain builder
//! - UTXO records and per-block spent/unminted logs
//! - Header index and orphan pool (fork resolution)
//! - Script verification oracle

pub mod block;
pub mod chain;
pub mod chain_builder;
pub mod chain_state;
pub mod chained_header;
pub mod encoding;
pub mod script;
pub mod transaction;
pub mod unspent;

pub use block::{Block, BlockHeader, BLOCK_HEADER_SIZE};
pub use chain::{Chain, ChainError, Direction, NavigateTowards, NavigationStep};
pub use chain_builder::ChainBuilder;
pub use chain_state::{
    BlockStatus, BlockTreeSnapshot, HeaderIndex, OrphanBlock, OrphanPool, MAX_ORPHAN_BLOCKS,
    ORPHAN_BLOCK_EXPIRE_TIME,
};
pub use chained_header::ChainedHeader;
pub use encoding::{Decoder, Encoder, EncodingError};
pub use script::{
    NullScriptVerifier, ScriptError, ScriptVerifier, StandardScriptVerifier,
};
pub use transaction::{
    Transaction, TransactionData, TxInput, TxOutput, SEQUENCE_FINAL, TX_VERSION,
};
pub use unspent::{
    BlockSpentTxes, OutputState, OutputStates, SpentTx, TxLookupKey, TxOutputKey, UnmintedTx,
    UnspentTx,
};
