//! Bounded publish/subscribe fan-out.
//!
//! Each subscriber owns its own bounded buffer. Publishing never blocks: when
//! a subscriber's buffer is full the item is dropped for that subscriber and
//! a warning is logged — periodic poll sensors compensate for anything a slow
//! subscriber misses. Closed subscribers are pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use metrics::counter;
use tokio::sync::mpsc;

use crate::metrics::names;

type Filter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    sender: mpsc::Sender<T>,
    filter: Option<Filter<T>>,
}

/// A fan-out channel with one bounded buffer per subscriber.
pub struct Publisher<T> {
    name: &'static str,
    default_capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T: Clone> Publisher<T> {
    /// Creates a publisher whose subscribers get buffers of
    /// `default_capacity` items. The name labels drop metrics and logs.
    #[must_use]
    pub fn new(name: &'static str, default_capacity: usize) -> Self {
        Self {
            name,
            default_capacity,
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes with the default buffer capacity and no filter.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        self.subscribe_inner(self.default_capacity, None)
    }

    /// Subscribes with a predicate; only matching items are delivered.
    #[must_use]
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> mpsc::Receiver<T> {
        self.subscribe_inner(self.default_capacity, Some(Box::new(filter)))
    }

    /// Subscribes with an explicit buffer capacity and a predicate.
    #[must_use]
    pub fn subscribe_with_capacity(
        &self,
        capacity: usize,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> mpsc::Receiver<T> {
        self.subscribe_inner(capacity, Some(Box::new(filter)))
    }

    fn subscribe_inner(&self, capacity: usize, filter: Option<Filter<T>>) -> mpsc::Receiver<T> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        subscribers.push(Subscriber { id, sender, filter });
        receiver
    }

    /// Publishes an item to every matching subscriber without blocking.
    ///
    /// Subscribers whose buffer is full miss this item (discard-newest);
    /// subscribers whose receiver was dropped are removed.
    pub fn publish(&self, item: &T) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        subscribers.retain(|subscriber| {
            if let Some(filter) = &subscriber.filter {
                if !filter(item) {
                    return true;
                }
            }
            match subscriber.sender.try_send(item.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        channel = self.name,
                        subscriber = subscriber.id,
                        "subscriber buffer full, dropping item"
                    );
                    counter!(
                        names::PUBSUB_DROPS_TOTAL,
                        "channel" => self.name.to_string(),
                    )
                    .increment(1);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl<T> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("name", &self.name)
            .field("default_capacity", &self.default_capacity)
            .finish_non_exhaustive()
    }
}
