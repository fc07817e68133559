//! Mutable, stack-like chain of headers

use crate::core::chain::{Chain, ChainError};
use crate::core::chained_header::ChainedHeader;
use crate::crypto::Hash256;

/// A chain that grows and shrinks at its tip
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    headers: Vec<ChainedHeader>,
}

impl ChainBuilder {
    pub fn new(genesis: ChainedHeader) -> Self {
        Self {
            headers: vec![genesis],
        }
    }

    pub fn from_chain(chain: &Chain) -> Self {
        Self {
            headers: chain.headers().to_vec(),
        }
    }

    pub fn genesis_header(&self) -> &ChainedHeader {
        &self.headers[0]
    }

    pub fn tip(&self) -> &ChainedHeader {
        &self.headers[self.headers.len() - 1]
    }

    pub fn height(&self) -> u32 {
        self.tip().height
    }

    pub fn get(&self, height: u32) -> Option<&ChainedHeader> {
        self.headers.get(height as usize)
    }

    pub fn contains_hash(&self, hash: &Hash256) -> bool {
        self.headers.iter().rev().any(|header| header.hash == *hash)
    }

    /// Push `header`; it must extend the current tip
    pub fn add_block(&mut self, header: ChainedHeader) -> Result<(), ChainError> {
        let tip = self.tip();
        if header.previous_hash() != tip.hash || header.height != tip.height + 1 {
            return Err(ChainError::NotExtendingTip {
                hash: header.hash,
                height: header.height,
                tip: tip.hash,
            });
        }
        self.headers.push(header);
        Ok(())
    }

    /// Pop the tip; genesis stays
    pub fn remove_block(&mut self) -> Result<ChainedHeader, ChainError> {
        if self.headers.len() <= 1 {
            return Err(ChainError::RemoveGenesis);
        }
        self.headers.pop().ok_or(ChainError::Empty)
    }

    pub fn to_immutable(&self) -> Chain {
        Chain::from_checked(self.headers.clone())
    }
}
