//! Chain state persistence layer
//!
//! The committed chain state and the block store are written together as one
//! JSON snapshot. Saves go to a temp file that is atomically renamed over the
//! previous snapshot; older snapshots are kept as rotated backups.

use crate::consensus::Network;
use crate::core::chain_state::BlockTreeSnapshot;
use crate::crypto::Hash256;
use crate::merkle::BlockTxNode;
use crate::storage::cursor::StorageError;
use crate::storage::memory::ChainStateData;
use crate::storage::pruning::PruneState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

/// Everything needed to reopen a chain state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStateSnapshot {
    pub network: Network,
    pub saved_at: DateTime<Utc>,
    pub chain_state: ChainStateData,
    pub blocks: BTreeMap<Hash256, Vec<BlockTxNode>>,
    #[serde(default)]
    pub prune_state: PruneState,
    /// Side branches, invalid marks and orphans; older snapshots lack it
    #[serde(default)]
    pub block_tree: BlockTreeSnapshot,
}

/// Snapshot storage configuration
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub data_dir: PathBuf,
    pub snapshot_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".chainstate_data"),
            snapshot_file: "chainstate.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

/// Snapshot storage manager
pub struct SnapshotStorage {
    config: SnapshotConfig,
}

impl SnapshotStorage {
    pub fn new(config: SnapshotConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::new(SnapshotConfig {
            data_dir: data_dir.into(),
            ..Default::default()
        })
    }

    fn snapshot_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.snapshot_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.snapshot_file, index))
    }

    /// Write the snapshot, keeping the previous one as backup 0
    pub fn save(&self, snapshot: &ChainStateSnapshot) -> Result<(), StorageError> {
        let path = self.snapshot_path();

        if self.config.backup_enabled && self.config.max_backups > 0 && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        let temp_path = self.config.data_dir.join("chainstate.tmp");
        {
            let file = fs::File::create(&temp_path)?;
            let writer = BufWriter::new(file);
            serde_json::to_writer(writer, snapshot)?;
        }
        fs::rename(&temp_path, &path)?;

        log::debug!("Saved chain state snapshot to {}", path.display());
        Ok(())
    }

    pub fn load(&self) -> Result<ChainStateSnapshot, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Err(StorageError::InvalidData(format!(
                "No chain state snapshot at {}",
                path.display()
            )));
        }
        Self::read(&path)
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path().exists()
    }

    pub fn delete(&self) -> Result<(), StorageError> {
        let path = self.snapshot_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), StorageError> {
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    pub fn restore_backup(&self, backup_index: usize) -> Result<ChainStateSnapshot, StorageError> {
        let path = self.backup_path(backup_index);
        if !path.exists() {
            return Err(StorageError::InvalidData(format!(
                "Backup {} not found",
                backup_index
            )));
        }
        Self::read(&path)
    }

    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    fn read(path: &std::path::Path) -> Result<ChainStateSnapshot, StorageError> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let snapshot: ChainStateSnapshot = serde_json::from_reader(reader)?;
        if snapshot.chain_state.chain_tip.is_none() {
            return Err(StorageError::InvalidData(
                "Snapshot has no chain tip".to_string(),
            ));
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ChainParams;
    use crate::core::chained_header::ChainedHeader;

    fn snapshot() -> ChainStateSnapshot {
        let params = ChainParams::regtest();
        let genesis = ChainedHeader::genesis(&params.genesis_block.header, Utc::now());
        let mut chain_state = ChainStateData::default();
        chain_state.headers.insert(genesis.hash, genesis.clone());
        chain_state.chain_tip = Some(genesis.clone());

        let mut blocks = BTreeMap::new();
        blocks.insert(
            params.genesis_hash(),
            params
                .genesis_block
                .transactions
                .iter()
                .zip(0u32..)
                .map(|(tx, i)| BlockTxNode::leaf(i, tx))
                .collect(),
        );

        ChainStateSnapshot {
            network: Network::Regtest,
            saved_at: Utc::now(),
            chain_state,
            blocks,
            prune_state: PruneState::default(),
            block_tree: BlockTreeSnapshot {
                headers: vec![genesis],
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_save_load_snapshot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = SnapshotStorage::in_dir(temp_dir.path()).unwrap();
        let snapshot = snapshot();

        storage.save(&snapshot).unwrap();
        assert!(storage.exists());
        assert_eq!(storage.load().unwrap(), snapshot);

        storage.delete().unwrap();
        assert!(!storage.exists());
        assert!(matches!(storage.load(), Err(StorageError::InvalidData(_))));
    }

    #[test]
    fn test_snapshot_without_block_tree_loads() {
        let snapshot = snapshot();
        let mut json = serde_json::to_value(&snapshot).unwrap();
        json.as_object_mut().unwrap().remove("block_tree");

        let loaded: ChainStateSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(loaded.block_tree, BlockTreeSnapshot::default());
        assert_eq!(loaded.chain_state, snapshot.chain_state);
    }

    #[test]
    fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = SnapshotStorage::new(SnapshotConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_backups: 3,
            ..Default::default()
        })
        .unwrap();

        let snapshot = snapshot();
        for _ in 0..5 {
            storage.save(&snapshot).unwrap();
        }

        assert_eq!(storage.list_backups(), vec![0, 1, 2]);
        assert_eq!(storage.restore_backup(2).unwrap(), snapshot);
        assert!(storage.restore_backup(3).is_err());
    }
}
