// src/queue.rs
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct Inner<T> {
    buf: VecDeque<T>,
}

/// Fixed-capacity FIFO over a ring buffer.
///
/// Producers fail fast when the queue is full; consumers block on the
/// non-empty condition, optionally with a deadline. Broadcast is used
/// rather than a single signal because several consumers may be waiting
/// and a producer cannot know which will win the re-check.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
            }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Non-blocking append. Returns `false` when the queue is full.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.buf.len() >= self.capacity {
            // Wake waiters anyway so a full queue never strands a consumer.
            self.not_empty.notify_all();
            return false;
        }
        inner.buf.push_back(item);
        self.not_empty.notify_all();
        true
    }

    /// Remove and return the head, blocking until the queue is non-empty.
    pub fn pop(&self) -> T {
        let mut inner = self.inner.lock().unwrap();
        while inner.buf.is_empty() {
            inner = self.not_empty.wait(inner).unwrap();
        }
        inner.buf.pop_front().unwrap()
    }

    /// Like `pop`, but gives up once `timeout` has elapsed.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.buf.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, res) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if res.timed_out() && inner.buf.is_empty() {
                return None;
            }
        }
        inner.buf.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BoundedQueue<T> {
    pub fn front(&self) -> Option<T> {
        self.inner.lock().unwrap().buf.front().cloned()
    }

    pub fn back(&self) -> Option<T> {
        self.inner.lock().unwrap().buf.back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::new(4);
        assert!(q.push(1));
        assert!(q.push(2));
        assert!(q.push(3));
        assert_eq!(q.front(), Some(1));
        assert_eq!(q.back(), Some(3));
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 3);
        assert!(q.is_empty());
    }

    #[test]
    fn push_fails_fast_on_full() {
        let q = BoundedQueue::new(2);
        assert!(q.push("a"));
        assert!(q.push("b"));
        assert!(q.is_full());
        assert!(!q.push("c"));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn concurrent_pushes_to_full_queue_all_fail() {
        let q = Arc::new(BoundedQueue::new(2));
        q.push(0);
        q.push(0);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            handles.push(thread::spawn(move || q.push(1)));
        }
        for h in handles {
            assert!(!h.join().unwrap());
        }
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pop_timeout_expires() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        assert_eq!(q.pop_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn pop_blocks_until_push() {
        let q = Arc::new(BoundedQueue::new(1));
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(20));
        assert!(q.push(99));
        assert_eq!(handle.join().unwrap(), 99);
    }
}
