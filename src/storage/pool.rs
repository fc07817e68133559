//! Bounded pool of chain state cursors
//!
//! Cursors are single-threaded; parallel readers each draw their own from the
//! pool. An exhausted pool makes `acquire` wait, then fail with a timeout.

use crate::storage::cursor::{ChainStateCursor, StorageError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

pub struct CursorPool<C: ChainStateCursor> {
    sender: Sender<C>,
    receiver: Receiver<C>,
    size: usize,
}

impl<C: ChainStateCursor> Clone for CursorPool<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            size: self.size,
        }
    }
}

impl<C: ChainStateCursor> CursorPool<C> {
    /// Create a pool of `size` cursors built by `make`
    pub fn new<F: FnMut() -> C>(size: usize, mut make: F) -> Self {
        let size = size.max(1);
        let (sender, receiver) = bounded(size);
        for _ in 0..size {
            // The channel holds exactly `size` cursors
            let _ = sender.try_send(make());
        }
        Self {
            sender,
            receiver,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Cursors currently idle in the pool
    pub fn available(&self) -> usize {
        self.receiver.len()
    }

    /// Take a cursor, waiting at most `timeout`
    pub fn acquire(&self, timeout: Duration) -> Result<PooledCursor<C>, StorageError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(cursor) => Ok(PooledCursor {
                cursor: Some(cursor),
                home: self.sender.clone(),
            }),
            Err(RecvTimeoutError::Timeout) => Err(StorageError::PoolTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StorageError::PoolClosed),
        }
    }
}

/// A cursor on loan from a [`CursorPool`]; returned when dropped
pub struct PooledCursor<C: ChainStateCursor> {
    cursor: Option<C>,
    home: Sender<C>,
}

impl<C: ChainStateCursor> Deref for PooledCursor<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.cursor {
            Some(cursor) => cursor,
            None => unreachable!("cursor is only taken on drop"),
        }
    }
}

impl<C: ChainStateCursor> DerefMut for PooledCursor<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.cursor {
            Some(cursor) => cursor,
            None => unreachable!("cursor is only taken on drop"),
        }
    }
}

impl<C: ChainStateCursor> Drop for PooledCursor<C> {
    fn drop(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            if cursor.in_transaction() {
                log::warn!("Pooled cursor returned with an open transaction, rolling back");
                if let Err(e) = cursor.rollback_transaction() {
                    log::error!("Failed to roll back pooled cursor: {}", e);
                }
            }
            let _ = self.home.try_send(cursor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryChainStateStorage;
    use std::thread;

    #[test]
    fn test_exhausted_pool_times_out() {
        let storage = MemoryChainStateStorage::new();
        let pool = CursorPool::new(2, || storage.cursor());

        let first = pool.acquire(Duration::from_millis(10)).unwrap();
        let _second = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(pool.available(), 0);
        assert!(matches!(
            pool.acquire(Duration::from_millis(20)),
            Err(StorageError::PoolTimeout(_))
        ));

        drop(first);
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_release_rolls_back() {
        let storage = MemoryChainStateStorage::new();
        let pool = CursorPool::new(1, || storage.cursor());
        {
            let mut cursor = pool.acquire(Duration::from_millis(10)).unwrap();
            cursor.begin_transaction(true).unwrap();
        }
        let cursor = pool.acquire(Duration::from_millis(10)).unwrap();
        assert!(!cursor.in_transaction());
    }

    #[test]
    fn test_waiter_gets_released_cursor() {
        let storage = MemoryChainStateStorage::new();
        let pool = CursorPool::new(1, || storage.cursor());
        let held = pool.acquire(Duration::from_millis(10)).unwrap();

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.acquire(Duration::from_secs(5)).is_ok());
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
