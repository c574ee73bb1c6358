//! Bounded cache of projected entities.
//!
//! The cache wraps an LRU of `aggregate id -> Arc<entity>` with a fixed
//! capacity. A miss replays the aggregate's events from the backend through
//! the projector under a per-key load lock, so concurrent readers trigger at
//! most one replay. The cache also subscribes to the backend: each incoming
//! event folds into the cached entry (loading it first when necessary) and
//! is re-published as a [`Notification`] on the cache's own bounded fan-out.
//!
//! An entry always equals the fold of every event the cache has seen for its
//! aggregate; staleness is bounded by subscription-delivery latency, and
//! evicted entries are rebuilt on the next access.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{EventBackend, EventFilter};
use crate::error::{Error, Result};
use crate::events::{Aggregate, Event};
use crate::invocation::Invocation;
use crate::projector::Projector;
use crate::pubsub::Publisher;
use crate::workflow::Workflow;

/// Entities that track how many events have been folded into them.
pub trait Versioned {
    /// The number of events applied; equals last sequence + 1.
    fn version(&self) -> u64;
}

impl Versioned for Workflow {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for Invocation {
    fn version(&self) -> u64 {
        self.version
    }
}

/// An entity-update notification re-published by the cache.
#[derive(Debug)]
pub struct Notification<E> {
    /// The aggregate that changed.
    pub aggregate: Aggregate,
    /// The entity before the event, when the cache held it.
    pub old: Option<Arc<E>>,
    /// The entity after the event.
    pub updated: Arc<E>,
    /// The event that caused the change.
    pub event: Event,
}

impl<E> Clone for Notification<E> {
    fn clone(&self) -> Self {
        Self {
            aggregate: self.aggregate.clone(),
            old: self.old.clone(),
            updated: Arc::clone(&self.updated),
            event: self.event.clone(),
        }
    }
}

/// Hand-rolled LRU: map plus recency order.
struct LruMap<E> {
    entries: HashMap<String, Arc<E>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<E> LruMap<E> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn get(&mut self, key: &str) -> Option<Arc<E>> {
        let entry = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(entry)
    }

    fn peek(&self, key: &str) -> Option<Arc<E>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, entity: Arc<E>) {
        self.entries.insert(key.clone(), entity);
        self.touch(&key);
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            } else {
                break;
            }
        }
    }
}

/// A bounded, subscription-maintained cache of projected entities.
pub struct EntityCache<P: Projector>
where
    P::Entity: Versioned,
{
    backend: Arc<dyn EventBackend>,
    projector: P,
    entries: Mutex<LruMap<P::Entity>>,
    load_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    publisher: Publisher<Notification<P::Entity>>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transport("entity cache lock poisoned")
}

impl<P: Projector> EntityCache<P>
where
    P::Entity: Versioned,
{
    /// Creates a cache holding up to `capacity` entities, with notification
    /// buffers of `notification_capacity` items per subscriber.
    #[must_use]
    pub fn new(
        backend: Arc<dyn EventBackend>,
        projector: P,
        capacity: usize,
        notification_capacity: usize,
    ) -> Self {
        Self {
            backend,
            projector,
            entries: Mutex::new(LruMap::new(capacity)),
            load_locks: DashMap::new(),
            publisher: Publisher::new("cache", notification_capacity),
        }
    }

    fn check_kind(&self, aggregate: &Aggregate) -> Result<()> {
        if aggregate.kind == self.projector.kind() {
            Ok(())
        } else {
            Err(Error::failed_precondition(format!(
                "aggregate {aggregate} requested from a {} cache",
                self.projector.kind()
            )))
        }
    }

    /// Returns the projected entity for an aggregate, replaying its events
    /// on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the backend has no events for the
    /// aggregate; backend and projection errors surface unchanged.
    pub async fn get(&self, aggregate: &Aggregate) -> Result<Arc<P::Entity>> {
        self.check_kind(aggregate)?;

        if let Some(entity) = self.entries.lock().map_err(poison_err)?.get(&aggregate.id) {
            return Ok(entity);
        }

        let load_lock = self
            .load_locks
            .entry(aggregate.id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = load_lock.lock().await;

        // Another loader may have won the race while we waited.
        if let Some(entity) = self.entries.lock().map_err(poison_err)?.get(&aggregate.id) {
            return Ok(entity);
        }

        self.replay_and_insert(aggregate).await
    }

    /// Forces a replay from the backend, replacing the cached entry.
    ///
    /// # Errors
    ///
    /// Same as [`EntityCache::get`].
    pub async fn refresh(&self, aggregate: &Aggregate) -> Result<Arc<P::Entity>> {
        self.check_kind(aggregate)?;

        let load_lock = self
            .load_locks
            .entry(aggregate.id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = load_lock.lock().await;

        self.replay_and_insert(aggregate).await
    }

    async fn replay_and_insert(&self, aggregate: &Aggregate) -> Result<Arc<P::Entity>> {
        let events = self.backend.get(aggregate).await?;
        let entity = Arc::new(self.projector.replay(aggregate, &events)?);
        self.entries
            .lock()
            .map_err(poison_err)?
            .insert(aggregate.id.clone(), Arc::clone(&entity));
        Ok(entity)
    }

    /// Subscribes to entity-update notifications.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<Notification<P::Entity>> {
        self.publisher.subscribe()
    }

    /// Folds one backend event into the cache and re-publishes it as a
    /// notification. Out-of-order deliveries are reconciled by version:
    /// duplicates are ignored, gaps trigger a replay.
    pub async fn ingest(&self, event: Event) {
        if self.check_kind(&event.aggregate).is_err() {
            return;
        }

        let old = match self.entries.lock() {
            Ok(mut entries) => entries.get(&event.aggregate.id),
            Err(_) => None,
        };

        let updated = match &old {
            Some(current) if event.sequence + 1 <= current.version() => {
                // Already folded in (e.g. the appending call replayed it).
                return;
            }
            Some(current) if event.sequence == current.version() => {
                match self.projector.apply(current, &event) {
                    Ok(next) => {
                        let next = Arc::new(next);
                        if let Ok(mut entries) = self.entries.lock() {
                            entries.insert(event.aggregate.id.clone(), Arc::clone(&next));
                        }
                        next
                    }
                    Err(error) => {
                        tracing::warn!(
                            aggregate = %event.aggregate,
                            event = event.data.name(),
                            %error,
                            "failed to fold event, forcing replay"
                        );
                        match self.refresh(&event.aggregate).await {
                            Ok(entity) => entity,
                            Err(error) => {
                                tracing::warn!(aggregate = %event.aggregate, %error, "replay failed");
                                return;
                            }
                        }
                    }
                }
            }
            _ => {
                // Missing entry or a sequence gap: rebuild from the log.
                match self.refresh(&event.aggregate).await {
                    Ok(entity) => entity,
                    Err(error) => {
                        tracing::warn!(aggregate = %event.aggregate, %error, "replay failed");
                        return;
                    }
                }
            }
        };

        self.publisher.publish(&Notification {
            aggregate: event.aggregate.clone(),
            old,
            updated,
            event,
        });
    }

    /// Spawns the subscription loop that keeps the cache current. The loop
    /// ends when the backend's publisher side is dropped or the returned
    /// handle is aborted.
    #[must_use]
    pub fn start(self: &Arc<Self>, subscriber_capacity: usize) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut events = self.backend.subscribe_with_capacity(
            EventFilter::KindIn(vec![self.projector.kind()]),
            subscriber_capacity,
        );
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                cache.ingest(event).await;
            }
        })
    }
}

impl<P: Projector> std::fmt::Debug for EntityCache<P>
where
    P::Entity: Versioned,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("kind", &self.projector.kind())
            .finish_non_exhaustive()
    }
}

/// Returns the cached entity without touching the backend; testing hook.
#[doc(hidden)]
pub fn peek<P: Projector>(cache: &EntityCache<P>, aggregate: &Aggregate) -> Option<Arc<P::Entity>>
where
    P::Entity: Versioned,
{
    cache.entries.lock().ok()?.peek(&aggregate.id)
}
