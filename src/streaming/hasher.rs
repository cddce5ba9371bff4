//! Ordered parallel block hasher.
//!
//! ```text
//!              jobs               results            in order
//! reader ---> worker x N ---> reorder thread ---> HashedReceiver
//!   ^                              |
//!   +---------- credits -----------+
//! ```
//!
//! The reader must take a credit before pulling the next block off the
//! device, and the reorder thread returns the credit only once that block has
//! been released in index order. The number of credits is the in-flight
//! window, so memory stays bounded no matter how unevenly workers finish.

use crate::device::Block;
use crate::error::{BlocksyncError, Result};
use crate::streaming::channel::{hashed_channel, HashedBlock, HashedReceiver, HasherConfig};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::error::TryRecvError;

/// How often a reader waiting for a credit re-checks for cancellation
const CREDIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owned handle on a running hasher. Dropping it cancels the pipeline and
/// joins every thread it started.
///
/// The join waits for a reader stuck inside a device read, which on a pipe
/// lasts until the writer sends more data or closes it. On a multi-thread
/// runtime the wait happens in `block_in_place` so other tasks keep running;
/// on a current-thread runtime it blocks the runtime.
pub struct OrderedHasher {
    rx: HashedReceiver,
    cancel: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl OrderedHasher {
    /// Start hashing `blocks`, which must yield blocks in increasing index
    /// order starting at zero.
    pub fn spawn<I>(config: HasherConfig, blocks: I) -> Result<Self>
    where
        I: Iterator<Item = Result<Block>> + Send + 'static,
    {
        let workers = config.workers.max(1);
        let window = config.window.max(1);
        let algorithm = config.algorithm;

        // Credits bound in-flight blocks to `window`, so a job queue of the same
        // size never blocks the reader.
        let (job_tx, job_rx) = bounded::<Block>(window);
        let (done_tx, done_rx) = unbounded::<(u64, Result<HashedBlock>)>();
        let (credit_tx, credit_rx) = bounded::<()>(window);
        for _ in 0..window {
            let _ = credit_tx.send(());
        }
        let (out_tx, out_rx) = hashed_channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(workers + 2);

        // Reader
        {
            let cancel = cancel.clone();
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name("blocksync-read".to_string())
                .spawn(move || {
                    read_loop(blocks, job_tx, done_tx, credit_rx, &cancel);
                })
                .map_err(|e| BlocksyncError::Worker(format!("failed to spawn reader: {}", e)))?;
            threads.push(handle);
        }

        // Hash workers
        for n in 0..workers {
            let cancel = cancel.clone();
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("blocksync-hash-{}", n))
                .spawn(move || {
                    for block in job_rx.iter() {
                        if cancel.load(Ordering::Relaxed) {
                            break;
                        }
                        let index = block.index;
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            algorithm.digest(&block.data)
                        }))
                        .map(|digest| HashedBlock {
                            index,
                            data: block.data,
                            digest,
                        })
                        .map_err(|_| {
                            BlocksyncError::Worker(format!("hashing block {} panicked", index))
                        });
                        if done_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| BlocksyncError::Worker(format!("failed to spawn worker: {}", e)))?;
            threads.push(handle);
        }
        drop(job_rx);
        drop(done_tx);

        // Reorder
        {
            let cancel = cancel.clone();
            let handle = thread::Builder::new()
                .name("blocksync-reorder".to_string())
                .spawn(move || {
                    let mut pending: BTreeMap<u64, Result<HashedBlock>> = BTreeMap::new();
                    let mut next = 0u64;

                    for (index, result) in done_rx.iter() {
                        pending.insert(index, result);
                        while let Some(result) = pending.remove(&next) {
                            let failed = result.is_err();
                            if out_tx.blocking_send(result).is_err() {
                                // Consumer went away
                                cancel.store(true, Ordering::Relaxed);
                                return;
                            }
                            if failed {
                                cancel.store(true, Ordering::Relaxed);
                                return;
                            }
                            next += 1;
                            let _ = credit_tx.send(());
                        }
                    }

                    if !pending.is_empty() && !cancel.load(Ordering::Relaxed) {
                        let _ = out_tx.blocking_send(Err(BlocksyncError::Worker(format!(
                            "hash result for block {} never arrived",
                            next
                        ))));
                    }
                })
                .map_err(|e| BlocksyncError::Worker(format!("failed to spawn reorder: {}", e)))?;
            threads.push(handle);
        }

        tracing::debug!(
            "Hasher started: {} workers, window {}, {}",
            workers,
            window,
            algorithm
        );

        Ok(Self {
            rx: out_rx,
            cancel,
            threads,
        })
    }

    /// Next hashed block in index order. `None` once every block was emitted.
    pub async fn next(&mut self) -> Option<Result<HashedBlock>> {
        self.rx.recv().await
    }

    /// Next hashed block if one is ready right now.
    pub fn try_next(&mut self) -> Option<Result<HashedBlock>> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Next hashed block, flushing `writer` first whenever nothing is ready
    /// yet so downstream never waits on output we are sitting on.
    pub async fn next_or_flush<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
    ) -> Result<Option<HashedBlock>> {
        let item = match self.try_next() {
            Some(item) => Some(item),
            None => {
                writer.flush().await.map_err(BlocksyncError::stream)?;
                self.next().await
            }
        };
        item.transpose()
    }
}

impl Drop for OrderedHasher {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.rx.close();
        // Unblock a reorder thread stuck in blocking_send
        while self.rx.try_recv().is_ok() {}

        let threads = std::mem::take(&mut self.threads);
        let join_all = move || {
            for handle in threads {
                let _ = handle.join();
            }
        };
        match Handle::try_current() {
            Ok(rt) if rt.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(join_all)
            }
            _ => join_all(),
        }
    }
}

fn read_loop<I>(
    mut blocks: I,
    job_tx: crossbeam_channel::Sender<Block>,
    done_tx: crossbeam_channel::Sender<(u64, Result<HashedBlock>)>,
    credit_rx: crossbeam_channel::Receiver<()>,
    cancel: &AtomicBool,
) where
    I: Iterator<Item = Result<Block>>,
{
    let mut next_index = 0u64;
    loop {
        // Wait for room in the window
        loop {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            match credit_rx.recv_timeout(CREDIT_POLL_INTERVAL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        match blocks.next() {
            None => return,
            Some(Ok(block)) => {
                debug_assert_eq!(block.index, next_index);
                next_index = block.index + 1;
                if job_tx.send(block).is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::debug!("Reader failed at block {}: {}", next_index, e);
                let _ = done_tx.send((next_index, Err(e)));
                return;
            }
        }
    }
}
