//! Chain state engine
//!
//! Block validation, UTXO set maintenance and chain reorganization on top of
//! the storage contracts.

pub mod builder;
pub mod config;
pub mod error;
pub mod lookahead;
pub mod tx_loader;
pub mod utxo_builder;
pub mod validator;

pub use builder::{ChainStateBuilder, ChainStateStorage, MemoryChainState};
pub use config::{ChainStateConfig, ValidationConfig};
pub use error::{ChainStateError, MissingData};
pub use lookahead::{look_ahead, warm_transactions, LookAhead};
pub use tx_loader::{LoadedTx, LoadingTx, TxLoader};
pub use utxo_builder::{BlockUtxoChanges, UtxoBuilder};
pub use validator::BlockValidator;
