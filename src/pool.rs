// src/pool.rs
use crate::sync::Semaphore;
use std::ops::Deref;
use std::sync::Mutex;

/// Fixed-size pool of opaque resource handles.
///
/// `acquire` waits on the counting semaphore before taking the free-list
/// mutex, which bounds the number of threads contending for the lock to
/// the pool size. The guard returns its handle on every exit path.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    available: Semaphore,
}

impl<T> Pool<T> {
    pub fn new(handles: Vec<T>) -> Self {
        let count = handles.len();
        Self {
            free: Mutex::new(handles),
            available: Semaphore::new(count),
        }
    }

    /// Block until a handle is free, then take it.
    pub fn acquire(&self) -> PoolGuard<'_, T> {
        self.available.acquire();
        let handle = self.free.lock().unwrap().pop();
        PoolGuard { pool: self, handle }
    }

    fn release(&self, handle: T) {
        self.free.lock().unwrap().push(handle);
        self.available.release();
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

pub struct PoolGuard<'a, T> {
    pool: &'a Pool<T>,
    handle: Option<T>,
}

impl<T> Deref for PoolGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // The semaphore admitted us, so a handle must be present.
        self.handle.as_ref().expect("pool guard already released")
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_release_round_trip() {
        let pool = Pool::new(vec![10, 20]);
        {
            let a = pool.acquire();
            let b = pool.acquire();
            assert_eq!(*a + *b, 30);
            assert_eq!(pool.free_count(), 0);
        }
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn guard_releases_on_early_return() {
        fn take_and_bail(pool: &Pool<u32>) -> Option<u32> {
            let guard = pool.acquire();
            if *guard == 7 {
                return None; // guard drops here
            }
            Some(*guard)
        }

        let pool = Pool::new(vec![7]);
        assert_eq!(take_and_bail(&pool), None);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(Pool::new(vec![1]));
        let held = pool.acquire();

        let pool2 = pool.clone();
        let handle = thread::spawn(move || {
            let g = pool2.acquire();
            *g
        });

        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(handle.join().unwrap(), 1);
    }
}
