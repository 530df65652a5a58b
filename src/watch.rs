//! Event Watch Adapter
//!
//! Fans store change events out to per-subscriber bounded queues, each
//! guarded by a filter predicate. Subscribers are expected to drain or
//! cancel: one that does neither has its queue fill up and is
//! disconnected, which a streaming handler observes as its receiver
//! closing and turns into a resync. Dropping a receiver releases the
//! subscription at the next publish sweep.

use crate::store::StoreEvent;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Predicate deciding which events reach a subscriber.
pub type EventFilter = Arc<dyn Fn(&StoreEvent) -> bool + Send + Sync>;

const DEFAULT_QUEUE_CAPACITY: usize = 128;

struct Subscriber {
    tx: mpsc::Sender<StoreEvent>,
    filter: EventFilter,
}

/// The change-event bus for one store.
#[derive(Default)]
pub struct WatchQueue {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl WatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with the default queue capacity.
    pub fn watch(&self, filter: EventFilter) -> mpsc::Receiver<StoreEvent> {
        self.watch_with_capacity(filter, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn watch_with_capacity(
        &self,
        filter: EventFilter,
        capacity: usize,
    ) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers
            .lock()
            .unwrap()
            .push(Subscriber { tx, filter });
        rx
    }

    /// Deliver an event to every live subscriber whose filter matches.
    pub fn publish(&self, event: &StoreEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sub| {
            if !(sub.filter)(event) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    // A subscriber that stopped draining would otherwise
                    // observe a gap; disconnect it so it resyncs instead.
                    tracing::warn!("disconnecting event subscriber that stopped draining");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
