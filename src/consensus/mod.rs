//! Consensus parameters and rules
//!
//! - Network parameters and genesis blocks
//! - Compact targets, block work and retargeting
//! - Subsidy schedule and money range

pub mod params;
pub mod pow;
pub mod rules;

pub use params::{ChainParams, Network, COIN, MAX_MONEY};
pub use pow::{
    block_work, check_proof_of_work, next_required_bits, retarget, target_from_compact,
    target_to_compact, PowError,
};
pub use rules::{block_subsidy, checked_money_add, max_coinbase_value, money_range};
