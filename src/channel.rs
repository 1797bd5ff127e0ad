//! Directional message queues and the per-session communication link.

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{Error, Result};
use crate::messages::Message;

/// What a full channel does with a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Discard the new message.
    RejectNew,
}

/// Result of a non-blocking `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    DroppedOldest,
    Rejected,
}

/// A FIFO pipe between two execution contexts. `send` never blocks;
/// `receive` blocks for at most the given timeout.
pub struct Channel<T> {
    queue: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn send(&self, msg: T) -> SendOutcome {
        let mut queue = self.queue.lock();
        let outcome = if queue.len() < self.capacity {
            queue.push_back(msg);
            SendOutcome::Queued
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::DropOldest => {
                    queue.pop_front();
                    queue.push_back(msg);
                    SendOutcome::DroppedOldest
                }
                OverflowPolicy::RejectNew => SendOutcome::Rejected,
            }
        };
        drop(queue);

        if outcome == SendOutcome::Rejected {
            warn!(capacity = self.capacity, "channel full, rejected message");
        } else {
            if outcome == SendOutcome::DroppedOldest {
                warn!(capacity = self.capacity, "channel full, dropped oldest message");
            }
            self.available.notify_one();
        }
        outcome
    }

    /// Dequeue the next message, waiting up to `timeout`.
    pub fn receive(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return Ok(msg);
            }
            if self.available.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front().ok_or(Error::Timeout);
            }
        }
    }

    pub fn receive_nowait(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Messages lost to the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One session's bidirectional link: a channel into the execution context,
/// a channel out of it, and the shared stop signal.
pub struct CommunicationManager {
    session_id: String,
    pub to_execution: Channel<Message>,
    pub from_execution: Channel<Message>,
    stop_event: AtomicBool,
}

impl CommunicationManager {
    pub fn new(session_id: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            session_id: session_id.into(),
            to_execution: Channel::new(capacity, policy),
            from_execution: Channel::new(capacity, policy),
            stop_event: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Set the stop signal. Returns true only for the call that set it.
    pub fn request_stop(&self) -> bool {
        !self.stop_event.swap(true, Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_event.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let ch = Channel::new(8, OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert_eq!(ch.send(i), SendOutcome::Queued);
        }
        assert_eq!(ch.len(), 3);
        assert_eq!(ch.receive_nowait(), Some(0));
        assert_eq!(ch.receive(Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(ch.receive_nowait(), Some(2));
        assert!(ch.is_empty());
    }

    #[test]
    fn test_receive_times_out() {
        let ch: Channel<u8> = Channel::new(4, OverflowPolicy::DropOldest);
        let started = Instant::now();
        let err = ch.receive(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_receive_nowait_empty_is_none() {
        let ch: Channel<u8> = Channel::new(4, OverflowPolicy::DropOldest);
        assert_eq!(ch.receive_nowait(), None);
    }

    #[test]
    fn test_drop_oldest_policy() {
        let ch = Channel::new(2, OverflowPolicy::DropOldest);
        ch.send(1);
        ch.send(2);
        assert_eq!(ch.send(3), SendOutcome::DroppedOldest);
        assert_eq!(ch.dropped(), 1);
        assert_eq!(ch.receive_nowait(), Some(2));
        assert_eq!(ch.receive_nowait(), Some(3));
    }

    #[test]
    fn test_reject_new_policy() {
        let ch = Channel::new(2, OverflowPolicy::RejectNew);
        ch.send(1);
        ch.send(2);
        assert_eq!(ch.send(3), SendOutcome::Rejected);
        assert_eq!(ch.receive_nowait(), Some(1));
        assert_eq!(ch.receive_nowait(), Some(2));
        assert_eq!(ch.receive_nowait(), None);
    }

    #[test]
    fn test_receive_wakes_on_send_from_other_thread() {
        let ch = Arc::new(Channel::new(4, OverflowPolicy::DropOldest));
        let producer = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                ch.send("hello");
            })
        };
        assert_eq!(ch.receive(Duration::from_secs(2)).unwrap(), "hello");
        producer.join().unwrap();
    }

    #[test]
    fn test_request_stop_is_idempotent() {
        let comm = CommunicationManager::new("s1", 16, OverflowPolicy::DropOldest);
        assert!(!comm.stop_requested());
        assert!(comm.request_stop());
        assert!(!comm.request_stop());
        assert!(comm.stop_requested());
        assert_eq!(comm.session_id(), "s1");
    }

    #[test]
    fn test_overflow_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: OverflowPolicy,
        }
        let w: Wrapper = toml::from_str(r#"policy = "reject_new""#).unwrap();
        assert_eq!(w.policy, OverflowPolicy::RejectNew);
    }
}
