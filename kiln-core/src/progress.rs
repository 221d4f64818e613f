//! Fan-out of build progress to subscribers. Delivery is best-effort: a
//! slow subscriber drops events rather than stalling the build, while every
//! subscriber that keeps up sees its own events in emission order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Started,
    Running,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub status: Status,
    pub progress: Option<Progress>,
    pub stream: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl Event {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, status: Status, timestamp: DateTime<Utc>) -> Self {
        Self { id: id.into(), name: name.into(), status, progress: None, stream: None, timestamp, error: None }
    }
}

/// A registered subscriber's inbound half, obtained from [`Bus::subscribe`].
pub type Subscription = mpsc::Receiver<Event>;

/// Fans published events out to every subscriber, dropping an event for a
/// subscriber whose buffer is full rather than blocking the publisher or
/// other subscribers.
#[derive(Default)]
pub struct Bus {
    subscribers: std::sync::Mutex<BTreeMap<u64, mpsc::Sender<Event>>>,
    next_id: std::sync::atomic::AtomicU64,
    dropped: std::sync::atomic::AtomicU64,
}

impl Bus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber with the given buffer depth, returning a
    /// handle to unsubscribe and the receiving half.
    pub fn subscribe(&self, buffer: usize) -> (SubscriptionHandle, Subscription) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.subscribers.lock().expect("lock poisoned").insert(id, tx);
        (SubscriptionHandle { id }, rx)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscribers.lock().expect("lock poisoned").remove(&handle.id);
    }

    /// Publishes to every current subscriber. Never blocks: a subscriber
    /// whose buffer is full has this event dropped for it alone.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock().expect("lock poisoned");
        for tx in subscribers.values() {
            if tx.try_send(event.clone()).is_err() {
                self.dropped.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("lock poisoned").len()
    }
}

pub struct SubscriptionHandle {
    id: u64,
}
