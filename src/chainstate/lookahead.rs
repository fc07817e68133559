//! Ordered look-ahead pipeline
//!
//! A feeder thread tags every input item with its position and queues it on a
//! bounded channel. Worker threads process items in whatever order they finish
//! and report back on an unbounded channel. The consumer side holds results
//! in a reorder buffer and yields them strictly in submission order.
//!
//! The first failure ends the stream: every earlier item is still delivered,
//! then the failure, then nothing. Workers stop taking new items once a
//! failure is seen, the consumer is dropped, or the cancellation token fires.

use crate::chainstate::error::ChainStateError;
use crate::core::transaction::Transaction;
use crate::storage::cursor::ChainStateCursor;
use crate::storage::pool::CursorPool;
use crossbeam_channel::{bounded, unbounded, Receiver};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Tagged<U> = (u64, Result<U, ChainStateError>);

/// Consumer end of [`look_ahead`]
pub struct LookAhead<U> {
    results: Receiver<Tagged<U>>,
    pending: BTreeMap<u64, Result<U, ChainStateError>>,
    next_seq: u64,
    stop: Arc<AtomicBool>,
    cancel: CancellationToken,
    finished: bool,
}

/// Apply `f` to `items` on `workers` threads, yielding results in input order
pub fn look_ahead<I, T, U, F>(
    name: &str,
    items: I,
    workers: usize,
    capacity: usize,
    cancel: CancellationToken,
    f: F,
) -> Result<LookAhead<U>, ChainStateError>
where
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> Result<U, ChainStateError> + Send + Sync + 'static,
{
    let (work_tx, work_rx) = bounded::<(u64, T)>(capacity.max(1));
    let (result_tx, result_rx) = unbounded::<Tagged<U>>();
    let stop = Arc::new(AtomicBool::new(false));
    let f = Arc::new(f);

    for worker in 0..workers.max(1) {
        let work_rx = work_rx.clone();
        let result_tx = result_tx.clone();
        let stop = Arc::clone(&stop);
        let cancel = cancel.clone();
        let f = Arc::clone(&f);
        thread::Builder::new()
            .name(format!("{}-{}", name, worker))
            .spawn(move || {
                while !stop.load(Ordering::Acquire) && !cancel.is_cancelled() {
                    let Ok((seq, item)) = work_rx.recv() else {
                        break;
                    };
                    let result = f(item);
                    let failed = result.is_err();
                    if result_tx.send((seq, result)).is_err() {
                        break;
                    }
                    if failed {
                        stop.store(true, Ordering::Release);
                        break;
                    }
                }
            })
            .map_err(|e| ChainStateError::Pipeline(format!("failed to spawn {}: {}", name, e)))?;
    }
    drop(work_rx);
    drop(result_tx);

    let feeder_stop = Arc::clone(&stop);
    let items = items.into_iter();
    thread::Builder::new()
        .name(format!("{}-feeder", name))
        .spawn(move || {
            for (seq, item) in (0u64..).zip(items) {
                if feeder_stop.load(Ordering::Acquire) {
                    break;
                }
                if work_tx.send((seq, item)).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| ChainStateError::Pipeline(format!("failed to spawn {} feeder: {}", name, e)))?;

    Ok(LookAhead {
        results: result_rx,
        pending: BTreeMap::new(),
        next_seq: 0,
        stop,
        cancel,
        finished: false,
    })
}

impl<U> LookAhead<U> {
    fn finish(&mut self) {
        self.finished = true;
        self.stop.store(true, Ordering::Release);
        self.pending.clear();
    }
}

impl<U> Iterator for LookAhead<U> {
    type Item = Result<U, ChainStateError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(result) = self.pending.remove(&self.next_seq) {
                self.next_seq += 1;
                if result.is_err() {
                    self.finish();
                }
                return Some(result);
            }

            match self.results.recv() {
                Ok((seq, result)) => {
                    self.pending.insert(seq, result);
                }
                Err(_) => {
                    // Every worker is gone; a gap means work was abandoned
                    let gap = !self.pending.is_empty();
                    let cancelled = self.cancel.is_cancelled();
                    self.finish();
                    if cancelled {
                        return Some(Err(ChainStateError::Cancelled));
                    }
                    if gap {
                        return Some(Err(ChainStateError::Pipeline(format!(
                            "look-ahead stopped before item {}",
                            self.next_seq
                        ))));
                    }
                    return None;
                }
            }
        }
    }
}

impl<U> Drop for LookAhead<U> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Prefetch the previous transactions of every input through pooled cursors,
/// yielding `(tx_index, tx)` in block order once each one is warm
pub fn warm_transactions<C>(
    transactions: Vec<Transaction>,
    pool: CursorPool<C>,
    workers: usize,
    capacity: usize,
    cursor_timeout: Duration,
    cancel: CancellationToken,
) -> Result<LookAhead<(u32, Transaction)>, ChainStateError>
where
    C: ChainStateCursor + 'static,
{
    let items: Vec<(u32, Transaction)> = (0u32..).zip(transactions).collect();
    look_ahead("utxo-lookahead", items, workers, capacity, cancel, move |(tx_index, tx)| {
        if !tx.is_coinbase() {
            let mut cursor = pool.acquire(cursor_timeout)?;
            cursor.begin_transaction(true)?;
            for input in tx.inputs() {
                cursor.warm_unspent_tx(&input.previous_output.tx_hash)?;
            }
            cursor.commit_transaction()?;
        }
        Ok((tx_index, tx))
    })
}
