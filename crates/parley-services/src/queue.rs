//! Ingress / egress message queues.
//!
//! `push` never waits; `pop` suspends until an item arrives. Depth is
//! unbounded unless a capacity is configured, in which case the overflow
//! policy decides which message is discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use parley_core::config::{OverflowPolicy, QueueConfig};
use parley_core::Message;

pub struct MessageQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
}

impl<T> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> MessageQueue<T> {
    pub fn unbounded() -> Self {
        Self::bounded(0, OverflowPolicy::DropOldest)
    }

    /// `capacity == 0` means unbounded.
    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity,
                overflow,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::bounded(config.capacity, config.overflow)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.shared
            .items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without waiting. Returns the message discarded to make
    /// room, if the queue is bounded and full.
    pub fn push(&self, item: T) -> Option<T> {
        let discarded = {
            let mut items = self.lock();
            let full = self.shared.capacity > 0 && items.len() >= self.shared.capacity;
            match (full, self.shared.overflow) {
                (false, _) => {
                    items.push_back(item);
                    None
                }
                (true, OverflowPolicy::DropOldest) => {
                    let oldest = items.pop_front();
                    items.push_back(item);
                    oldest
                }
                (true, OverflowPolicy::DropNewest) => Some(item),
            }
        };
        if discarded.is_some() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        discarded
    }

    /// Dequeue, waiting until an item is available.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.shared.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Messages discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// The two pipeline queues.
#[derive(Clone, Default)]
pub struct MessageQueues {
    /// Reactor → router.
    pub ingress: MessageQueue<Message>,
    /// Router → egress writer.
    pub egress: MessageQueue<Message>,
}

impl MessageQueues {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            ingress: MessageQueue::from_config(config),
            egress: MessageQueue::from_config(config),
        }
    }
}
