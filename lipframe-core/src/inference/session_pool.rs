//! Fixed-size pool of interchangeable inference sessions.
//!
//! Handles live in a bounded crossbeam channel: `acquire` is a blocking
//! `recv`, releasing is a `send`. The channel capacity equals the pool size,
//! so at most `size` handles can ever be checked out and an extra caller
//! waits until one comes back.
//!
//! A [`SessionLease`] borrows the pool, which makes `close(self)` with
//! outstanding leases a compile error rather than a deadlock.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::error::{LipframeError, Result};
use crate::inference::InferenceBackend;

pub struct SessionPool<B> {
    tx: Sender<B>,
    rx: Receiver<B>,
    size: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl<B: InferenceBackend> SessionPool<B> {
    /// Build `size` handles with `factory(slot)` and warm each one up.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero size, otherwise the first factory or
    /// warm-up failure.
    pub fn new(size: usize, mut factory: impl FnMut(usize) -> Result<B>) -> Result<Self> {
        if size == 0 {
            return Err(LipframeError::InvalidConfig(
                "session pool size must be at least 1".into(),
            ));
        }
        let mut handles = Vec::with_capacity(size);
        for slot in 0..size {
            let mut handle = factory(slot)?;
            handle.warm_up()?;
            handles.push(handle);
        }
        Self::from_handles(handles)
    }

    /// Wrap already warmed-up handles.
    pub fn from_handles(handles: Vec<B>) -> Result<Self> {
        let size = handles.len();
        if size == 0 {
            return Err(LipframeError::InvalidConfig(
                "session pool needs at least one handle".into(),
            ));
        }
        let (tx, rx) = bounded(size);
        for handle in handles {
            tx.send(handle).map_err(|_| LipframeError::PoolClosed)?;
        }
        info!(size, "session pool ready");
        Ok(Self {
            tx,
            rx,
            size,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Block until a handle is free.
    pub fn acquire(&self) -> Result<SessionLease<'_, B>> {
        let handle = self.rx.recv().map_err(|_| LipframeError::PoolClosed)?;
        Ok(self.lease(handle))
    }

    /// Like [`acquire`](Self::acquire), giving up after `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<Option<SessionLease<'_, B>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(handle) => Ok(Some(self.lease(handle))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LipframeError::PoolClosed),
        }
    }

    /// Return a handle explicitly. Dropping the lease does the same.
    pub fn release(&self, lease: SessionLease<'_, B>) {
        drop(lease);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles currently checked out.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Highest simultaneous check-out seen.
    pub fn peak_in_use(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Drain and destroy every handle. Returns how many were destroyed.
    pub fn close(self) -> usize {
        let mut destroyed = 0;
        while let Ok(handle) = self.rx.try_recv() {
            drop(handle);
            destroyed += 1;
        }
        if destroyed != self.size {
            warn!(destroyed, size = self.size, "session pool closed with missing handles");
        } else {
            debug!(destroyed, "session pool closed");
        }
        destroyed
    }

    fn lease(&self, handle: B) -> SessionLease<'_, B> {
        let now = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
        SessionLease {
            pool: self,
            handle: Some(handle),
        }
    }

    fn give_back(&self, handle: B) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        // Capacity == size and the pool holds the receiver, so this cannot block or fail.
        if self.tx.try_send(handle).is_err() {
            warn!("session handle dropped on release: pool full");
        }
    }
}

impl<B> std::fmt::Debug for SessionPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("size", &self.size)
            .field("in_use", &self.in_use.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Exclusive use of one pooled handle; returned to the pool on drop.
pub struct SessionLease<'a, B: InferenceBackend> {
    pool: &'a SessionPool<B>,
    handle: Option<B>,
}

impl<B: InferenceBackend> Deref for SessionLease<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        match &self.handle {
            Some(h) => h,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<B: InferenceBackend> DerefMut for SessionLease<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        match &mut self.handle {
            Some(h) => h,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<B: InferenceBackend> Drop for SessionLease<'_, B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.give_back(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{Tensor, TensorView};

    struct Counter {
        id: usize,
        warmed: bool,
    }

    impl InferenceBackend for Counter {
        fn warm_up(&mut self) -> Result<()> {
            self.warmed = true;
            Ok(())
        }

        fn infer(&mut self, _inputs: &[TensorView<'_>]) -> Result<Vec<Tensor>> {
            Ok(vec![Tensor::new(vec![1], vec![self.id as f32])?])
        }
    }

    fn pool(size: usize) -> SessionPool<Counter> {
        SessionPool::new(size, |id| Ok(Counter { id, warmed: false })).unwrap()
    }

    #[test]
    fn handles_are_warmed_and_counted() {
        let pool = pool(3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(a.warmed && b.warmed);
        assert_eq!(pool.in_use(), 2);
        pool.release(a);
        drop(b);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.peak_in_use(), 2);
        assert_eq!(pool.close(), 3);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = pool(1);
        let held = pool.acquire().unwrap();
        assert!(pool
            .try_acquire_for(Duration::from_millis(20))
            .unwrap()
            .is_none());
        drop(held);
        assert!(pool
            .try_acquire_for(Duration::from_millis(20))
            .unwrap()
            .is_some());
    }

    #[test]
    fn zero_size_and_factory_errors_fail_construction() {
        assert!(SessionPool::<Counter>::new(0, |id| Ok(Counter { id, warmed: false })).is_err());
        let err = SessionPool::<Counter>::new(2, |id| {
            if id == 1 {
                Err(LipframeError::ModelNotFound {
                    path: "gen.onnx".into(),
                })
            } else {
                Ok(Counter { id, warmed: false })
            }
        })
        .unwrap_err();
        assert!(matches!(err, LipframeError::ModelNotFound { .. }));
    }

    #[test]
    fn leases_run_inference_on_their_own_handle() {
        let pool = pool(2);
        let mut lease = pool.acquire().unwrap();
        let out = lease.infer(&[]).unwrap();
        assert!(out[0].data[0] == 0.0 || out[0].data[0] == 1.0);
    }
}
