//! Nodes of a block's merkle tree as kept in block storage

use crate::core::transaction::Transaction;
use crate::crypto::{merkle_combine, Hash256};
use serde::{Deserialize, Serialize};

mod opt_hex_bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(de::Error::custom))
            .transpose()
    }
}

/// One node of a block's merkle tree.
///
/// A leaf (depth 0) at `index` holds transaction `index`. A node of depth `d`
/// at `index` stands for the `2^d` leaves starting at `index`. The hash is
/// always present; the transaction bytes only until the node is pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTxNode {
    pub index: u32,
    pub depth: u8,
    pub hash: Hash256,
    pub pruned: bool,
    #[serde(with = "opt_hex_bytes", default)]
    pub tx_bytes: Option<Vec<u8>>,
}

impl BlockTxNode {
    pub fn leaf(index: u32, tx: &Transaction) -> Self {
        Self {
            index,
            depth: 0,
            hash: tx.hash(),
            pruned: false,
            tx_bytes: Some(tx.to_bytes()),
        }
    }

    /// Whether this node is the left child of its parent
    pub fn is_left(&self) -> bool {
        (self.index >> self.depth) % 2 == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.depth == 0
    }

    /// Index just past the leaves this node covers
    pub fn end_index(&self) -> u64 {
        self.index as u64 + (1u64 << self.depth)
    }

    /// Same node with its transaction bytes dropped
    pub fn as_pruned(&self) -> Self {
        Self {
            pruned: true,
            tx_bytes: None,
            ..self.clone()
        }
    }

    /// Pruned parent of `self` (left) and `right`
    pub fn pair_with(&self, right: &BlockTxNode) -> Self {
        Self {
            index: self.index,
            depth: self.depth + 1,
            hash: merkle_combine(&self.hash, &right.hash),
            pruned: true,
            tx_bytes: None,
        }
    }

    /// Pruned parent of `self` paired with itself, for the last node of an odd level
    pub fn pair_with_self(&self) -> Self {
        self.pair_with(self)
    }

    /// Decode the transaction this leaf carries
    pub fn transaction(&self) -> Option<Result<Transaction, crate::core::encoding::EncodingError>> {
        self.tx_bytes.as_deref().map(Transaction::from_bytes)
    }
}
