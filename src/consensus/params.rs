//! Network consensus parameters

use crate::core::block::{Block, BlockHeader};
use crate::core::transaction::{Transaction, TxInput, TxOutput};
use crate::core::unspent::TxOutputKey;
use crate::crypto::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Base units per coin
pub const COIN: u64 = 100_000_000;

/// Upper bound on any single value or running sum of values
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

/// Blocks between difficulty retargets
pub const RETARGET_INTERVAL: u32 = 2016;

/// Two weeks, in seconds
pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;

/// Ten minutes, in seconds
pub const TARGET_SPACING: u32 = 10 * 60;

/// Blocks between subsidy halvings
pub const HALVING_INTERVAL: u32 = 210_000;

pub const INITIAL_SUBSIDY: u64 = 50 * COIN;

const GENESIS_SCRIPT_SIG: [u8; 77] = [
    0x04, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, 0x45, 0x54, 0x68, 0x65, 0x20, 0x54, 0x69, 0x6d,
    0x65, 0x73, 0x20, 0x30, 0x33, 0x2f, 0x4a, 0x61, 0x6e, 0x2f, 0x32, 0x30, 0x30, 0x39, 0x20,
    0x43, 0x68, 0x61, 0x6e, 0x63, 0x65, 0x6c, 0x6c, 0x6f, 0x72, 0x20, 0x6f, 0x6e, 0x20, 0x62,
    0x72, 0x69, 0x6e, 0x6b, 0x20, 0x6f, 0x66, 0x20, 0x73, 0x65, 0x63, 0x6f, 0x6e, 0x64, 0x20,
    0x62, 0x61, 0x69, 0x6c, 0x6f, 0x75, 0x74, 0x20, 0x66, 0x6f, 0x72, 0x20, 0x62, 0x61, 0x6e,
    0x6b, 0x73,
];

const GENESIS_SCRIPT_PUBKEY: [u8; 67] = [
    0x41, 0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71,
    0x30, 0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea,
    0x1f, 0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04,
    0xe5, 0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c,
    0x70, 0x2b, 0x6b, 0xf1, 0x1d, 0x5f, 0xac,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

/// Consensus parameters of one network
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub genesis_block: Block,
    /// Easiest allowed target, compact form
    pub pow_limit_bits: u32,
    pub retarget_interval: u32,
    pub target_timespan: u32,
    pub target_spacing: u32,
    pub halving_interval: u32,
    pub initial_subsidy: u64,
    /// Keep the previous target forever
    pub no_retargeting: bool,
}

impl ChainParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            genesis_block: genesis_block(1231006505, 0x1d00ffff, 2083236893),
            pow_limit_bits: 0x1d00ffff,
            retarget_interval: RETARGET_INTERVAL,
            target_timespan: TARGET_TIMESPAN,
            target_spacing: TARGET_SPACING,
            halving_interval: HALVING_INTERVAL,
            initial_subsidy: INITIAL_SUBSIDY,
            no_retargeting: false,
        }
    }

    /// Local test network: trivial target, halvings every 150 blocks
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            genesis_block: genesis_block(1296688602, 0x207fffff, 2),
            pow_limit_bits: 0x207fffff,
            retarget_interval: RETARGET_INTERVAL,
            target_timespan: TARGET_TIMESPAN,
            target_spacing: TARGET_SPACING,
            halving_interval: 150,
            initial_subsidy: INITIAL_SUBSIDY,
            no_retargeting: true,
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_block.hash()
    }
}

fn genesis_block(time: u32, bits: u32, nonce: u32) -> Block {
    let coinbase = Transaction::new(
        1,
        vec![TxInput::new(
            TxOutputKey::null(),
            GENESIS_SCRIPT_SIG.to_vec(),
        )],
        vec![TxOutput::new(INITIAL_SUBSIDY, GENESIS_SCRIPT_PUBKEY.to_vec())],
        0,
    );

    let header = BlockHeader {
        version: 1,
        previous_hash: Hash256::ZERO,
        merkle_root: Block::calculate_merkle_root(std::slice::from_ref(&coinbase)),
        time,
        bits,
        nonce,
    };

    Block::new(header, vec![coinbase])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_genesis_hash() {
        let params = ChainParams::mainnet();
        assert_eq!(
            params.genesis_block.header.merkle_root.to_hex(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(
            params.genesis_hash().to_hex(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_regtest_genesis_hash() {
        assert_eq!(
            ChainParams::regtest().genesis_hash().to_hex(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert_eq!("MAINNET".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("testnet9".parse::<Network>().is_err());
    }
}
