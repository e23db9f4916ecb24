//! Reusable buffer pools for per-frame scratch memory.
//!
//! A pool never blocks on creation: a miss allocates a fresh value through
//! the factory. Returned values go through the pool's reset hook first, so
//! tensors come back zeroed and never leak one frame's data into the next.
//! Images skip the reset since every pixel is rewritten before reuse.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use image::RgbImage;
use parking_lot::Mutex;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
    allocations: AtomicUsize,
    reuses: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Misses that went to the factory.
    pub allocations: usize,
    /// Hits served from the free list.
    pub reuses: usize,
    pub idle: usize,
}

impl<T> Pool<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            reset: None,
            allocations: AtomicUsize::new(0),
            reuses: AtomicUsize::new(0),
        }
    }

    /// Pool whose values pass through `reset` on every check-in.
    pub fn with_reset(
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            reset: Some(Box::new(reset)),
            ..Self::new(factory)
        }
    }

    /// Check a value out, allocating on a miss.
    pub fn get(&self) -> T {
        if let Some(value) = self.free.lock().pop() {
            self.reuses.fetch_add(1, Ordering::Relaxed);
            return value;
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }

    /// Check a value back in.
    pub fn put(&self, mut value: T) {
        if let Some(reset) = &self.reset {
            reset(&mut value);
        }
        self.free.lock().push(value);
    }

    /// Check out a guard that returns the value on drop.
    pub fn checkout(&self) -> Pooled<'_, T> {
        Pooled {
            pool: self,
            value: Some(self.get()),
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            idle: self.idle(),
        }
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// RAII check-out from a [`Pool`].
pub struct Pooled<'a, T> {
    pool: &'a Pool<T>,
    value: Option<T>,
}

impl<T> Pooled<'_, T> {
    /// Take the value out of the pool for good.
    pub fn into_inner(mut self) -> Option<T> {
        self.value.take()
    }
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `into_inner` and `drop` take the value, both consume the guard.
        match &self.value {
            Some(v) => v,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(v) => v,
            None => unreachable!("pooled value accessed after release"),
        }
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put(value);
        }
    }
}

/// Flat `f32` tensors of one fixed length, zeroed on check-in.
pub type TensorPool = Pool<Vec<f32>>;

pub fn tensor_pool(len: usize) -> TensorPool {
    Pool::with_reset(
        move || vec![0.0f32; len],
        move |buf: &mut Vec<f32>| {
            buf.clear();
            buf.resize(len, 0.0);
        },
    )
}

/// RGB images of one fixed size; contents are stale on check-out.
pub type ImagePool = Pool<RgbImage>;

pub fn image_pool(width: u32, height: u32) -> ImagePool {
    Pool::new(move || RgbImage::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn returned_tensors_are_zeroed() {
        let pool = tensor_pool(64);
        let mut buf = pool.get();
        buf.iter_mut().for_each(|v| *v = 7.5);
        buf.truncate(10);
        pool.put(buf);

        let again = pool.get();
        assert_eq!(again.len(), 64);
        assert!(again.iter().all(|&v| v == 0.0));
        assert_eq!(
            pool.stats(),
            PoolStats {
                allocations: 1,
                reuses: 1,
                idle: 0
            }
        );
    }

    #[test]
    fn guard_returns_value_on_drop() {
        let pool = tensor_pool(4);
        {
            let mut guard = pool.checkout();
            guard[0] = 1.0;
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
        assert_eq!(*pool.checkout(), vec![0.0; 4]);

        let owned = pool.checkout().into_inner().unwrap();
        assert_eq!(owned.len(), 4);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn images_are_not_reset() {
        let pool = image_pool(2, 2);
        let mut img = pool.get();
        img.put_pixel(1, 1, image::Rgb([9, 9, 9]));
        pool.put(img);
        assert_eq!(pool.get().get_pixel(1, 1).0, [9, 9, 9]);
    }

    #[test]
    fn concurrent_checkouts_allocate_at_most_one_per_thread() {
        let pool = Arc::new(tensor_pool(1024));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let pool = Arc::clone(&pool);
                s.spawn(move || {
                    for _ in 0..50 {
                        let mut buf = pool.checkout();
                        assert!(buf.iter().all(|&v| v == 0.0));
                        buf.fill(1.0);
                    }
                });
            }
        });
        let stats = pool.stats();
        assert!(stats.allocations <= 4, "{stats:?}");
        assert_eq!(stats.allocations + stats.reuses, 200);
    }
}
