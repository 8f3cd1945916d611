use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// A blocking FIFO shared between producers and consumers.
///
/// Elements only need to be movable. Consumers block on [`TimedQueue::dequeue`]
/// with an optional timeout; expiry surfaces as [`Error::Timeout`], which
/// executors treat as graceful shutdown.
pub struct TimedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    emptied: Condvar,
}

impl<T> TimedQueue<T> {
    pub fn new() -> TimedQueue<T> {
        TimedQueue {
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            emptied: Condvar::new(),
        }
    }

    /// Append an element and wake one waiting consumer. Never fails, the
    /// queue is unbounded.
    pub fn enqueue(&self, value: T) {
        let mut queue = self.inner.lock();
        queue.push_back(value);
        self.not_empty.notify_one();
    }

    /// Remove and return the head, blocking until an element is available.
    /// With a timeout, expiry fails with [`Error::Timeout`].
    pub fn dequeue(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.inner.lock();
        loop {
            if let Some(value) = queue.pop_front() {
                if queue.is_empty() {
                    self.emptied.notify_all();
                }
                return Ok(value);
            }

            match deadline {
                Some(deadline) => {
                    if self.not_empty.wait_until(&mut queue, deadline).timed_out() {
                        return Err(Error::Timeout);
                    }
                }
                None => self.not_empty.wait(&mut queue),
            }
        }
    }

    /// Block until the queue is non-empty and return a copy of the head
    /// without removing it. Repeated peeks observe the same element.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        let mut queue = self.inner.lock();
        loop {
            if let Some(value) = queue.front() {
                return value.clone();
            }
            self.not_empty.wait(&mut queue);
        }
    }

    /// Discard all queued elements.
    pub fn drain(&self) {
        let mut queue = self.inner.lock();
        queue.clear();
        self.emptied.notify_all();
    }

    /// Block until the queue becomes empty. An empty queue returns
    /// immediately; expiry fails with [`Error::Timeout`].
    pub fn wait_to_drain(&self, timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut queue = self.inner.lock();
        while !queue.is_empty() {
            if self.emptied.wait_until(&mut queue, deadline).timed_out() {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Current length. Sampled, not linearizable.
    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<T> Default for TimedQueue<T> {
    fn default() -> Self {
        TimedQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_queue_operations() {
        let q: TimedQueue<i32> = TimedQueue::new();

        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        q.enqueue(4);
        q.enqueue(5);

        assert_eq!(q.dequeue(None).unwrap(), 1);
        assert_eq!(q.dequeue(None).unwrap(), 2);
        assert_eq!(q.peek(), 3);
        assert_eq!(q.peek(), 3);
        assert_eq!(q.peek(), 3);
        assert_eq!(q.dequeue(None).unwrap(), 3);
        assert_eq!(q.dequeue(None).unwrap(), 4);
        assert_eq!(q.dequeue(None).unwrap(), 5);

        let res = q.dequeue(Some(Duration::from_millis(1)));
        assert!(matches!(res, Err(Error::Timeout)));
    }

    #[test]
    fn test_drain_queue() {
        let q: TimedQueue<i32> = TimedQueue::new();

        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);

        assert_eq!(q.size(), 3);

        q.drain();

        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_wait_to_drain_empty_queue() {
        // Just needs to return immediately
        let q: TimedQueue<i32> = TimedQueue::new();
        q.wait_to_drain(100).unwrap();
    }

    #[test]
    fn test_wait_to_drain_queue_with_elements() {
        let q = std::sync::Arc::new(TimedQueue::new());
        let n_elems = 5;
        let mut expected = Vec::new();

        for i in 0..n_elems {
            q.enqueue(i);
            expected.push(i);
        }

        // Background thread consumes elements with a delay
        let consumer_q = q.clone();
        let t = thread::spawn(move || {
            let mut dequeued = Vec::new();
            for _ in 0..n_elems {
                thread::sleep(Duration::from_millis(100));
                dequeued.push(consumer_q.dequeue(None).unwrap());
            }
            dequeued
        });

        q.wait_to_drain(2000).unwrap();

        let dequeued = t.join().unwrap();
        assert_eq!(dequeued, expected);
    }

    #[test]
    fn test_queue_on_move_only_elements() {
        let q: std::sync::Arc<TimedQueue<crossbeam::channel::Sender<i32>>> =
            std::sync::Arc::new(TimedQueue::new());

        let (tx_a, rx_a) = crossbeam::channel::bounded(1);
        let (tx_b, rx_b) = crossbeam::channel::bounded(1);

        q.enqueue(tx_a);
        q.enqueue(tx_b);

        let qa = q.clone();
        let ta = thread::spawn(move || {
            qa.dequeue(None).unwrap().send(1).unwrap();
        });
        let qb = q.clone();
        let tb = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            qb.dequeue(None).unwrap().send(2).unwrap();
        });

        ta.join().unwrap();
        tb.join().unwrap();

        assert_eq!(rx_a.recv().unwrap(), 1);
        assert_eq!(rx_b.recv().unwrap(), 2);
    }
}
