//! Blocking message queue feeding one Lua state.
//!
//! Producers on any thread push; the thread owning the state drains it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A cross-state event notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Map id the event was registered under.
    pub map_id: u32,
    /// Event name.
    pub event_name: String,
    /// Opaque payload passed to the handler.
    pub data: String,
}

impl Message {
    pub fn new(map_id: u32, event_name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            map_id,
            event_name: event_name.into(),
            data: data.into(),
        }
    }
}

struct Inner {
    messages: VecDeque<Message>,
    closed: bool,
}

/// Thread-safe FIFO with a blocking `pop` and a close signal.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue a message and wake one waiter.
    ///
    /// Returns `false` if the queue has been closed; the message is dropped.
    pub fn push(&self, message: Message) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.messages.push_back(message);
        }
        self.available.notify_one();
        true
    }

    /// Dequeue a message, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub fn pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(message) = inner.messages.pop_front() {
                return Some(message);
            }
            if inner.closed {
                return None;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Like `pop`, but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(message) = inner.messages.pop_front() {
                return Some(message);
            }
            if inner.closed {
                return None;
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                return inner.messages.pop_front();
            }
        }
    }

    /// Dequeue a message without blocking.
    pub fn try_pop(&self) -> Option<Message> {
        self.inner.lock().messages.pop_front()
    }

    /// Take every message queued right now.
    ///
    /// Messages pushed while the caller processes the batch stay queued.
    pub fn drain(&self) -> Vec<Message> {
        self.inner.lock().messages.drain(..).collect()
    }

    /// Whether the queue is empty. Advisory only: producers may push at any time.
    pub fn empty(&self) -> bool {
        self.inner.lock().messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    /// Reject further pushes and wake every blocked `pop`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new();
        queue.push(Message::new(1, "a", "1"));
        queue.push(Message::new(1, "a", "2"));
        queue.push(Message::new(2, "b", "3"));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().data, "1");
        assert_eq!(queue.pop().unwrap().data, "2");
        assert_eq!(queue.try_pop().unwrap().data, "3");
        assert!(queue.try_pop().is_none());
        assert!(queue.empty());
    }

    #[test]
    fn test_drain_takes_snapshot() {
        let queue = MessageQueue::new();
        queue.push(Message::new(1, "e", "x"));
        queue.push(Message::new(1, "e", "y"));

        let batch = queue.drain();
        assert_eq!(batch.len(), 2);
        assert!(queue.empty());
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        queue.push(Message::new(1, "ready", "payload"));
        let message = consumer.join().unwrap();
        assert_eq!(message, Some(Message::new(1, "ready", "payload")));
    }

    #[test]
    fn test_close_wakes_blocked_pop() {
        let queue = Arc::new(MessageQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_close_rejects_push_but_drains_remaining() {
        let queue = MessageQueue::new();
        assert!(queue.push(Message::new(1, "e", "kept")));
        queue.close();

        assert!(queue.is_closed());
        assert!(!queue.push(Message::new(1, "e", "dropped")));
        assert_eq!(queue.pop().unwrap().data, "kept");
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue = MessageQueue::new();
        let started = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
