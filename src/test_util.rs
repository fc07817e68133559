//! Regtest chain construction for unit tests

use crate::consensus::params::ChainParams;
use crate::consensus::pow::check_proof_of_work;
use crate::core::block::{Block, BlockHeader};
use crate::core::chain::Chain;
use crate::core::chained_header::ChainedHeader;
use crate::core::transaction::{Transaction, TxInput, TxOutput};
use crate::core::unspent::TxOutputKey;
use crate::crypto::Hash256;
use chrono::Utc;

pub const REGTEST_BITS: u32 = 0x207fffff;

pub fn genesis_chain() -> Chain {
    let params = ChainParams::regtest();
    Chain::genesis(ChainedHeader::genesis(&params.genesis_block.header, Utc::now()))
}

fn header_on(parent: &ChainedHeader, transactions: &[Transaction]) -> BlockHeader {
    BlockHeader {
        version: 1,
        previous_hash: parent.hash,
        merkle_root: Block::calculate_merkle_root(transactions),
        time: parent.header.time + 600,
        bits: REGTEST_BITS,
        nonce: 0,
    }
}

/// Unmined header carrying `transactions`, chained onto `parent`
pub fn next_header(parent: &ChainedHeader, transactions: &[Transaction]) -> ChainedHeader {
    ChainedHeader::from_parent(parent, header_on(parent, transactions), Utc::now())
}

/// Block on `parent` whose header meets the regtest target
pub fn mine_block(parent: &ChainedHeader, transactions: Vec<Transaction>) -> Block {
    let params = ChainParams::regtest();
    let mut header = header_on(parent, &transactions);
    while check_proof_of_work(&header.hash(), header.bits, header.bits, &params).is_err() {
        header.nonce += 1;
    }
    Block::new(header, transactions)
}

/// Transaction spending `inputs` (tx hash, output index) into outputs of `values`
pub fn spend_tx(inputs: &[(Hash256, u32)], values: &[u64]) -> Transaction {
    Transaction::new(
        1,
        inputs
            .iter()
            .map(|(hash, index)| TxInput::new(TxOutputKey::new(*hash, *index), vec![]))
            .collect(),
        values.iter().map(|value| TxOutput::new(*value, vec![])).collect(),
        0,
    )
}
