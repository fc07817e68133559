//! Headers placed in a chain

use crate::consensus::pow::block_work;
use crate::core::block::BlockHeader;
use crate::crypto::Hash256;
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// A block header with its height and the cumulative work up to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedHeader {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    pub total_work: BigUint,
    /// When this node first saw the header
    pub date_seen: DateTime<Utc>,
}

impl ChainedHeader {
    pub fn genesis(header: &BlockHeader, date_seen: DateTime<Utc>) -> Self {
        Self {
            hash: header.hash(),
            height: 0,
            total_work: block_work(header.bits),
            header: header.clone(),
            date_seen,
        }
    }

    /// Chain `header` onto `parent`. The caller checks the previous hash.
    pub fn from_parent(parent: &ChainedHeader, header: BlockHeader, date_seen: DateTime<Utc>) -> Self {
        Self {
            hash: header.hash(),
            height: parent.height + 1,
            total_work: &parent.total_work + block_work(header.bits),
            header,
            date_seen,
        }
    }

    pub fn previous_hash(&self) -> Hash256 {
        self.header.previous_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ChainParams;

    #[test]
    fn test_work_accumulates() {
        let params = ChainParams::regtest();
        let genesis = ChainedHeader::genesis(&params.genesis_block.header, Utc::now());
        assert_eq!(genesis.total_work, BigUint::from(2u32));

        let header = BlockHeader {
            previous_hash: genesis.hash,
            ..params.genesis_block.header.clone()
        };
        let child = ChainedHeader::from_parent(&genesis, header, Utc::now());
        assert_eq!(child.height, 1);
        assert_eq!(child.total_work, BigUint::from(4u32));
        assert_eq!(child.previous_hash(), genesis.hash);
    }
}
