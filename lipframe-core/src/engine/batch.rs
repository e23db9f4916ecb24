//! Batch scheduling over a bounded worker pool.
//!
//! Frames are cut into fixed-size batches that run one after another; the
//! frames inside a batch are handed to `workers` scoped threads through a
//! crossbeam channel. The first failing frame raises an abort flag, the
//! remaining queued frames of that batch are skipped, and the error is
//! returned once every worker has stopped.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{LipframeError, Result};

/// Half-open range of frame indices processed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBatch {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl FrameBatch {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    batch_size: usize,
    workers: usize,
}

impl BatchScheduler {
    pub fn new(batch_size: usize, workers: usize) -> Result<Self> {
        if batch_size == 0 || workers == 0 {
            return Err(LipframeError::InvalidConfig(format!(
                "batch size ({batch_size}) and worker count ({workers}) must be non-zero"
            )));
        }
        Ok(Self {
            batch_size,
            workers,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Split `0..total` into consecutive batches; the last may be short.
    pub fn plan(&self, total: usize) -> Vec<FrameBatch> {
        (0..total)
            .step_by(self.batch_size)
            .enumerate()
            .map(|(index, start)| FrameBatch {
                index,
                start,
                end: (start + self.batch_size).min(total),
            })
            .collect()
    }

    /// Run `work` for every frame of `batch` on the worker pool.
    pub fn run_batch<F>(&self, batch: &FrameBatch, work: &F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Sync,
    {
        let (tx, rx) = unbounded::<usize>();
        for i in batch.start..batch.end {
            // The receiver is alive until the scope below ends.
            let _ = tx.send(i);
        }
        drop(tx);

        let abort = AtomicBool::new(false);
        let first_error: Mutex<Option<LipframeError>> = Mutex::new(None);
        let threads = self.workers.min(batch.len()).max(1);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let rx = rx.clone();
                    let abort = &abort;
                    let first_error = &first_error;
                    scope.spawn(move || {
                        for i in rx.iter() {
                            if abort.load(Ordering::Acquire) {
                                break;
                            }
                            if let Err(e) = work(i) {
                                abort.store(true, Ordering::Release);
                                first_error.lock().get_or_insert(e);
                                break;
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                if handle.join().is_err() {
                    abort.store(true, Ordering::Release);
                    first_error
                        .lock()
                        .get_or_insert_with(|| anyhow::anyhow!("render worker panicked").into());
                }
            }
        });

        match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run every batch of `0..total` in order, calling `on_batch` after each
    /// completed batch. Stops at the first failing batch.
    pub fn run<F, B>(&self, total: usize, work: F, mut on_batch: B) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Sync,
        B: FnMut(&FrameBatch),
    {
        for batch in self.plan(total) {
            debug!(batch = batch.index, start = batch.start, end = batch.end, "batch started");
            self.run_batch(&batch, &work)?;
            on_batch(&batch);
        }
        Ok(())
    }

    /// Compute `f(i)` for `0..count` on the worker pool, results in index order.
    pub fn map_indexed<T, F>(&self, count: usize, f: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync,
    {
        let slots: Vec<Mutex<Option<T>>> = (0..count).map(|_| Mutex::new(None)).collect();
        let all = FrameBatch {
            index: 0,
            start: 0,
            end: count,
        };
        self.run_batch(&all, &|i| {
            let value = f(i)?;
            *slots[i].lock() = Some(value);
            Ok(())
        })?;
        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.into_inner().ok_or_else(|| {
                    LipframeError::Other(anyhow::anyhow!("no result produced for index {i}"))
                })
            })
            .collect()
    }
}
