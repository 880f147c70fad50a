// src/sync.rs
use std::sync::{Condvar, Mutex};

/// Counting semaphore built on a mutex and a condition variable.
///
/// `acquire` blocks until the count is positive, then decrements it;
/// `release` increments the count and wakes one waiter. The count is
/// not bounded above.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        // Loop on the predicate to absorb spurious wakeups.
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_decrements_and_release_wakes() {
        let sem = Arc::new(Semaphore::new(2));
        sem.acquire();
        sem.acquire();

        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.acquire();
        });

        thread::sleep(Duration::from_millis(20));
        sem.release();
        handle.join().unwrap();
    }

    #[test]
    fn bounds_concurrent_holders() {
        let sem = Arc::new(Semaphore::new(3));
        let held = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sem = sem.clone();
            let held = held.clone();
            let peak = peak.clone();
            handles.push(thread::spawn(move || {
                use std::sync::atomic::Ordering;
                sem.acquire();
                let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                held.fetch_sub(1, Ordering::SeqCst);
                sem.release();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
    }
}
