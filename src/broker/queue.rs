//! Pending delivery queue
//!
//! A mutex-protected FIFO with no capacity bound. Entries are attempted once
//! per delivery cycle instead of being retried in a busy loop, so a broken
//! subscriber cannot hold publishers hostage.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::broker::registry::ConnectionId;
use crate::transport::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Fan out to every subscriber whose topic equals the message topic.
    Topic,
    /// Retry a single subscriber that was momentarily unwritable.
    Connection(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub message: Arc<Message>,
    pub len: usize,
    pub destination: Destination,
}

impl PendingDelivery {
    pub fn fan_out(message: Arc<Message>) -> Self {
        Self {
            len: message.len(),
            message,
            destination: Destination::Topic,
        }
    }

    pub fn retry(message: Arc<Message>, id: ConnectionId) -> Self {
        Self {
            len: message.len(),
            message,
            destination: Destination::Connection(id),
        }
    }
}

#[derive(Debug)]
pub struct PendingQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T: Clone> PendingQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means another task panicked mid-push; the deque is still usable.
    fn guard(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, item: T) {
        self.guard().push_back(item);
    }

    pub fn front(&self) -> Option<T> {
        self.guard().front().cloned()
    }

    pub fn pop(&self) -> Option<T> {
        self.guard().pop_front()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}
