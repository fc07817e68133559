//! In-memory chain state storage
//!
//! Committed state is an immutable snapshot behind a `RwLock`. Read-only
//! transactions hold a snapshot for their whole lifetime. A write transaction
//! takes the single writer slot, buffers its changes in an overlay, and
//! publishes them on commit; rollback just drops the overlay.

use crate::core::chained_header::ChainedHeader;
use crate::core::unspent::{BlockSpentTxes, UnmintedTx, UnspentTx};
use crate::crypto::Hash256;
use crate::storage::cursor::{ChainStateCounters, ChainStateCursor, StorageError};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

/// Everything the chain state stores
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStateData {
    pub chain_tip: Option<ChainedHeader>,
    pub counters: ChainStateCounters,
    pub headers: BTreeMap<Hash256, ChainedHeader>,
    pub unspent_txes: BTreeMap<Hash256, UnspentTx>,
    pub block_spent_txes: BTreeMap<u32, BlockSpentTxes>,
    pub block_unminted_txes: BTreeMap<Hash256, Vec<UnmintedTx>>,
}

// =============================================================================
// Pending changes
// =============================================================================

/// Overlay of an open write transaction; `None` marks a removal
#[derive(Debug, Default)]
struct PendingChanges {
    chain_tip: Option<ChainedHeader>,
    counters: Option<ChainStateCounters>,
    headers: HashMap<Hash256, Option<ChainedHeader>>,
    unspent_txes: HashMap<Hash256, Option<UnspentTx>>,
    block_spent_txes: HashMap<u32, Option<BlockSpentTxes>>,
    block_unminted_txes: HashMap<Hash256, Option<Vec<UnmintedTx>>>,
}

impl PendingChanges {
    fn apply(self, data: &mut ChainStateData) {
        if let Some(tip) = self.chain_tip {
            data.chain_tip = Some(tip);
        }
        if let Some(counters) = self.counters {
            data.counters = counters;
        }
        apply_map(&mut data.headers, self.headers);
        apply_map(&mut data.unspent_txes, self.unspent_txes);
        apply_map(&mut data.block_spent_txes, self.block_spent_txes);
        apply_map(&mut data.block_unminted_txes, self.block_unminted_txes);
    }
}

fn apply_map<K: Ord, V>(target: &mut BTreeMap<K, V>, changes: HashMap<K, Option<V>>) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                target.insert(key, value);
            }
            None => {
                target.remove(&key);
            }
        }
    }
}

fn lookup<K, V>(changes: Option<&HashMap<K, Option<V>>>, base: &BTreeMap<K, V>, key: &K) -> Option<V>
where
    K: Ord + Hash + Eq,
    V: Clone,
{
    match changes.and_then(|changes| changes.get(key)) {
        Some(pending) => pending.clone(),
        None => base.get(key).cloned(),
    }
}

fn merged_values<'a, K, V>(
    changes: Option<&'a HashMap<K, Option<V>>>,
    base: &'a BTreeMap<K, V>,
) -> Box<dyn Iterator<Item = V> + 'a>
where
    K: Ord + Hash + Eq,
    V: Clone,
{
    match changes {
        None => Box::new(base.values().cloned()),
        Some(changes) => Box::new(
            base.iter()
                .filter(move |(key, _)| !changes.contains_key(*key))
                .map(|(_, value)| value.clone())
                .chain(changes.values().filter_map(|value| value.clone())),
        ),
    }
}

// =============================================================================
// Storage
// =============================================================================

struct Shared {
    committed: RwLock<Arc<ChainStateData>>,
    writer_active: Mutex<bool>,
    writer_released: Condvar,
}

/// Shared handle to the in-memory chain state
#[derive(Clone)]
pub struct MemoryChainStateStorage {
    shared: Arc<Shared>,
}

impl Default for MemoryChainStateStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChainStateStorage {
    pub fn new() -> Self {
        Self::from_data(ChainStateData::default())
    }

    pub fn from_data(data: ChainStateData) -> Self {
        Self {
            shared: Arc::new(Shared {
                committed: RwLock::new(Arc::new(data)),
                writer_active: Mutex::new(false),
                writer_released: Condvar::new(),
            }),
        }
    }

    pub fn cursor(&self) -> MemoryChainStateCursor {
        MemoryChainStateCursor {
            storage: self.clone(),
            txn: None,
        }
    }

    /// Current committed state
    pub fn committed(&self) -> Arc<ChainStateData> {
        self.shared.committed.read().clone()
    }

    fn acquire_writer(&self) {
        let mut active = self.shared.writer_active.lock();
        while *active {
            self.shared.writer_released.wait(&mut active);
        }
        *active = true;
    }

    fn release_writer(&self) {
        let mut active = self.shared.writer_active.lock();
        *active = false;
        self.shared.writer_released.notify_one();
    }
}

// =============================================================================
// Cursor
// =============================================================================

enum OpenTransaction {
    Read {
        data: Arc<ChainStateData>,
    },
    Write {
        base: Arc<ChainStateData>,
        changes: PendingChanges,
    },
}

pub struct MemoryChainStateCursor {
    storage: MemoryChainStateStorage,
    txn: Option<OpenTransaction>,
}

impl MemoryChainStateCursor {
    fn view(&self) -> Result<(&ChainStateData, Option<&PendingChanges>), StorageError> {
        match &self.txn {
            Some(OpenTransaction::Read { data }) => Ok((data, None)),
            Some(OpenTransaction::Write { base, changes }) => Ok((base, Some(changes))),
            None => Err(StorageError::NoTransaction),
        }
    }

    fn writable(&mut self) -> Result<(&ChainStateData, &mut PendingChanges), StorageError> {
        match &mut self.txn {
            Some(OpenTransaction::Write { base, changes }) => Ok((base, changes)),
            Some(OpenTransaction::Read { .. }) => Err(StorageError::ReadOnlyTransaction),
            None => Err(StorageError::NoTransaction),
        }
    }
}

impl Drop for MemoryChainStateCursor {
    fn drop(&mut self) {
        if let Some(OpenTransaction::Write { .. }) = self.txn.take() {
            self.storage.release_writer();
        }
    }
}

impl ChainStateCursor for MemoryChainStateCursor {
    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn begin_transaction(&mut self, read_only: bool) -> Result<(), StorageError> {
        if self.txn.is_some() {
            return Err(StorageError::TransactionInProgress);
        }
        if read_only {
            self.txn = Some(OpenTransaction::Read {
                data: self.storage.committed(),
            });
        } else {
            self.storage.acquire_writer();
            self.txn = Some(OpenTransaction::Write {
                base: self.storage.committed(),
                changes: PendingChanges::default(),
            });
        }
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), StorageError> {
        match self.txn.take() {
            Some(OpenTransaction::Read { .. }) => Ok(()),
            Some(OpenTransaction::Write { base, changes }) => {
                // Drop our snapshot so an unshared state is updated in place
                drop(base);
                {
                    let mut committed = self.storage.shared.committed.write();
                    changes.apply(Arc::make_mut(&mut committed));
                }
                self.storage.release_writer();
                Ok(())
            }
            None => Err(StorageError::NoTransaction),
        }
    }

    fn rollback_transaction(&mut self) -> Result<(), StorageError> {
        match self.txn.take() {
            Some(OpenTransaction::Read { .. }) => Ok(()),
            Some(OpenTransaction::Write { .. }) => {
                self.storage.release_writer();
                Ok(())
            }
            None => Err(StorageError::NoTransaction),
        }
    }

    fn chain_tip(&self) -> Result<Option<ChainedHeader>, StorageError> {
        let (base, changes) = self.view()?;
        Ok(changes
            .and_then(|changes| changes.chain_tip.clone())
            .or_else(|| base.chain_tip.clone()))
    }

    fn set_chain_tip(&mut self, tip: ChainedHeader) -> Result<(), StorageError> {
        let (_, changes) = self.writable()?;
        changes.chain_tip = Some(tip);
        Ok(())
    }

    fn counters(&self) -> Result<ChainStateCounters, StorageError> {
        let (base, changes) = self.view()?;
        Ok(changes
            .and_then(|changes| changes.counters)
            .unwrap_or(base.counters))
    }

    fn set_counters(&mut self, counters: ChainStateCounters) -> Result<(), StorageError> {
        let (_, changes) = self.writable()?;
        changes.counters = Some(counters);
        Ok(())
    }

    fn try_get_header(&self, hash: &Hash256) -> Result<Option<ChainedHeader>, StorageError> {
        let (base, changes) = self.view()?;
        Ok(lookup(changes.map(|c| &c.headers), &base.headers, hash))
    }

    fn try_add_header(&mut self, header: ChainedHeader) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(Some(&changes.headers), &base.headers, &header.hash).is_some() {
            return Ok(false);
        }
        changes.headers.insert(header.hash, Some(header));
        Ok(true)
    }

    fn try_remove_header(&mut self, hash: &Hash256) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(Some(&changes.headers), &base.headers, hash).is_none() {
            return Ok(false);
        }
        changes.headers.insert(*hash, None);
        Ok(true)
    }

    fn read_headers(&self) -> Result<Vec<ChainedHeader>, StorageError> {
        let (base, changes) = self.view()?;
        Ok(merged_values(changes.map(|c| &c.headers), &base.headers).collect())
    }

    fn try_get_unspent_tx(&self, tx_hash: &Hash256) -> Result<Option<UnspentTx>, StorageError> {
        let (base, changes) = self.view()?;
        Ok(lookup(
            changes.map(|c| &c.unspent_txes),
            &base.unspent_txes,
            tx_hash,
        ))
    }

    fn try_add_unspent_tx(&mut self, unspent_tx: UnspentTx) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(
            Some(&changes.unspent_txes),
            &base.unspent_txes,
            &unspent_tx.tx_hash,
        )
        .is_some()
        {
            return Ok(false);
        }
        changes
            .unspent_txes
            .insert(unspent_tx.tx_hash, Some(unspent_tx));
        Ok(true)
    }

    fn try_remove_unspent_tx(&mut self, tx_hash: &Hash256) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(Some(&changes.unspent_txes), &base.unspent_txes, tx_hash).is_none() {
            return Ok(false);
        }
        changes.unspent_txes.insert(*tx_hash, None);
        Ok(true)
    }

    fn try_update_unspent_tx(&mut self, unspent_tx: UnspentTx) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(
            Some(&changes.unspent_txes),
            &base.unspent_txes,
            &unspent_tx.tx_hash,
        )
        .is_none()
        {
            return Ok(false);
        }
        changes
            .unspent_txes
            .insert(unspent_tx.tx_hash, Some(unspent_tx));
        Ok(true)
    }

    fn read_unspent_transactions(
        &self,
    ) -> Result<Box<dyn Iterator<Item = UnspentTx> + '_>, StorageError> {
        let (base, changes) = self.view()?;
        Ok(merged_values(
            changes.map(|c| &c.unspent_txes),
            &base.unspent_txes,
        ))
    }

    fn try_get_block_spent_txes(
        &self,
        block_index: u32,
    ) -> Result<Option<BlockSpentTxes>, StorageError> {
        let (base, changes) = self.view()?;
        Ok(lookup(
            changes.map(|c| &c.block_spent_txes),
            &base.block_spent_txes,
            &block_index,
        ))
    }

    fn try_add_block_spent_txes(
        &mut self,
        block_index: u32,
        spent_txes: BlockSpentTxes,
    ) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(
            Some(&changes.block_spent_txes),
            &base.block_spent_txes,
            &block_index,
        )
        .is_some()
        {
            return Ok(false);
        }
        changes
            .block_spent_txes
            .insert(block_index, Some(spent_txes));
        Ok(true)
    }

    fn try_remove_block_spent_txes(&mut self, block_index: u32) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(
            Some(&changes.block_spent_txes),
            &base.block_spent_txes,
            &block_index,
        )
        .is_none()
        {
            return Ok(false);
        }
        changes.block_spent_txes.insert(block_index, None);
        Ok(true)
    }

    fn try_get_block_unminted_txes(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<Vec<UnmintedTx>>, StorageError> {
        let (base, changes) = self.view()?;
        Ok(lookup(
            changes.map(|c| &c.block_unminted_txes),
            &base.block_unminted_txes,
            block_hash,
        ))
    }

    fn try_add_block_unminted_txes(
        &mut self,
        block_hash: Hash256,
        unminted_txes: Vec<UnmintedTx>,
    ) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(
            Some(&changes.block_unminted_txes),
            &base.block_unminted_txes,
            &block_hash,
        )
        .is_some()
        {
            return Ok(false);
        }
        changes
            .block_unminted_txes
            .insert(block_hash, Some(unminted_txes));
        Ok(true)
    }

    fn try_remove_block_unminted_txes(&mut self, block_hash: &Hash256) -> Result<bool, StorageError> {
        let (base, changes) = self.writable()?;
        if lookup(
            Some(&changes.block_unminted_txes),
            &base.block_unminted_txes,
            block_hash,
        )
        .is_none()
        {
            return Ok(false);
        }
        changes.block_unminted_txes.insert(*block_hash, None);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::unspent::OutputStates;
    use std::thread;
    use std::time::Duration;

    fn unspent(byte: u8) -> UnspentTx {
        UnspentTx {
            tx_hash: Hash256::from_bytes([byte; 32]),
            block_index: 1,
            tx_index: 0,
            tx_version: 1,
            is_coinbase: false,
            output_states: OutputStates::all_unspent(2),
            tx_outputs: None,
        }
    }

    #[test]
    fn test_requires_transaction() {
        let storage = MemoryChainStateStorage::new();
        let mut cursor = storage.cursor();
        assert!(matches!(
            cursor.try_get_unspent_tx(&Hash256::ZERO),
            Err(StorageError::NoTransaction)
        ));
        assert!(matches!(
            cursor.try_add_unspent_tx(unspent(1)),
            Err(StorageError::NoTransaction)
        ));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let storage = MemoryChainStateStorage::new();
        let mut cursor = storage.cursor();
        cursor.begin_transaction(true).unwrap();
        assert!(matches!(
            cursor.try_add_unspent_tx(unspent(1)),
            Err(StorageError::ReadOnlyTransaction)
        ));
        cursor.rollback_transaction().unwrap();
    }

    #[test]
    fn test_commit_and_rollback() {
        let storage = MemoryChainStateStorage::new();
        let mut cursor = storage.cursor();

        cursor.begin_transaction(false).unwrap();
        assert!(cursor.try_add_unspent_tx(unspent(1)).unwrap());
        assert!(!cursor.try_add_unspent_tx(unspent(1)).unwrap());
        cursor.commit_transaction().unwrap();

        cursor.begin_transaction(false).unwrap();
        assert!(cursor.try_remove_unspent_tx(&unspent(1).tx_hash).unwrap());
        assert!(cursor.try_add_unspent_tx(unspent(2)).unwrap());
        assert!(!cursor.contains_unspent_tx(&unspent(1).tx_hash).unwrap());
        cursor.rollback_transaction().unwrap();

        let committed = storage.committed();
        assert!(committed.unspent_txes.contains_key(&unspent(1).tx_hash));
        assert!(!committed.unspent_txes.contains_key(&unspent(2).tx_hash));
    }

    #[test]
    fn test_read_unspent_merges_overlay() {
        let storage = MemoryChainStateStorage::new();
        let mut cursor = storage.cursor();
        cursor.begin_transaction(false).unwrap();
        cursor.try_add_unspent_tx(unspent(1)).unwrap();
        cursor.try_add_unspent_tx(unspent(2)).unwrap();
        cursor.commit_transaction().unwrap();

        cursor.begin_transaction(false).unwrap();
        cursor.try_remove_unspent_tx(&unspent(1).tx_hash).unwrap();
        cursor.try_add_unspent_tx(unspent(3)).unwrap();
        let mut updated = unspent(2);
        updated.output_states = OutputStates::all_spent(2);
        assert!(cursor.try_update_unspent_tx(updated.clone()).unwrap());

        let mut seen: Vec<UnspentTx> = cursor.read_unspent_transactions().unwrap().collect();
        seen.sort_by_key(|tx| tx.tx_hash);
        assert_eq!(seen, vec![updated, unspent(3)]);
        cursor.rollback_transaction().unwrap();
    }

    #[test]
    fn test_reader_sees_snapshot() {
        let storage = MemoryChainStateStorage::new();
        let mut reader = storage.cursor();
        reader.begin_transaction(true).unwrap();

        let mut writer = storage.cursor();
        writer.begin_transaction(false).unwrap();
        writer.try_add_unspent_tx(unspent(1)).unwrap();
        writer.commit_transaction().unwrap();

        assert!(!reader.contains_unspent_tx(&unspent(1).tx_hash).unwrap());
        reader.rollback_transaction().unwrap();
        reader.begin_transaction(true).unwrap();
        assert!(reader.contains_unspent_tx(&unspent(1).tx_hash).unwrap());
    }

    #[test]
    fn test_single_writer() {
        let storage = MemoryChainStateStorage::new();
        let mut first = storage.cursor();
        first.begin_transaction(false).unwrap();

        let other = storage.clone();
        let handle = thread::spawn(move || {
            let mut second = other.cursor();
            second.begin_transaction(false).unwrap();
            let seen = second.contains_unspent_tx(&unspent(1).tx_hash).unwrap();
            second.rollback_transaction().unwrap();
            seen
        });

        thread::sleep(Duration::from_millis(50));
        first.try_add_unspent_tx(unspent(1)).unwrap();
        first.commit_transaction().unwrap();

        // The second writer only starts after the first commits
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_dropped_writer_releases_lock() {
        let storage = MemoryChainStateStorage::new();
        {
            let mut cursor = storage.cursor();
            cursor.begin_transaction(false).unwrap();
            cursor.try_add_unspent_tx(unspent(1)).unwrap();
        }
        let mut cursor = storage.cursor();
        cursor.begin_transaction(false).unwrap();
        assert!(!cursor.contains_unspent_tx(&unspent(1).tx_hash).unwrap());
    }
}
