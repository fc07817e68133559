//! Block reward and value range rules

use crate::consensus::params::{ChainParams, MAX_MONEY};

/// Subsidy halvings after which the reward is zero
const MAX_HALVINGS: u32 = 64;

/// New coins a block at `height` may mint
pub fn block_subsidy(height: u32, params: &ChainParams) -> u64 {
    let halvings = height / params.halving_interval;
    if halvings >= MAX_HALVINGS {
        return 0;
    }
    params.initial_subsidy >> halvings
}

pub fn money_range(value: u64) -> bool {
    value <= MAX_MONEY
}

/// Add two amounts, `None` if the sum leaves the money range
pub fn checked_money_add(a: u64, b: u64) -> Option<u64> {
    a.checked_add(b).filter(|sum| money_range(*sum))
}

/// Maximum a coinbase at `height` may claim given the block's fees
pub fn max_coinbase_value(height: u32, fees: u64, params: &ChainParams) -> Option<u64> {
    block_subsidy(height, params).checked_add(fees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::{COIN, INITIAL_SUBSIDY};

    #[test]
    fn test_subsidy_halving() {
        let params = ChainParams::mainnet();
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), INITIAL_SUBSIDY / 4);
    }

    #[test]
    fn test_subsidy_ends() {
        let params = ChainParams::regtest();
        assert_eq!(block_subsidy(params.halving_interval * 64, &params), 0);
        assert_eq!(block_subsidy(params.halving_interval * 33, &params), 0);
    }

    #[test]
    fn test_money_range() {
        assert!(money_range(MAX_MONEY));
        assert!(!money_range(MAX_MONEY + 1));
        assert_eq!(checked_money_add(MAX_MONEY, 1), None);
        assert_eq!(checked_money_add(1, 2), Some(3));
    }
}
