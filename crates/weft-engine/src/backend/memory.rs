//! In-process event backend.
//!
//! Keeps one ordered `Vec<Event>` per aggregate behind an `RwLock` and fans
//! appended events out through a bounded [`Publisher`]. Suitable for tests
//! and single-node deployments; it provides the same ordering guarantees as
//! the durable streaming backend but no persistence.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use weft_core::EventId;

use super::{validate_append, EventBackend, EventFilter};
use crate::error::{Error, Result};
use crate::events::{Aggregate, Event, NewEvent};
use crate::metrics::record_event_appended;
use crate::pubsub::Publisher;

/// Converts a lock poison error to a transport error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transport("event log lock poisoned")
}

/// In-memory implementation of the [`EventBackend`] contract.
#[derive(Debug)]
pub struct MemoryBackend {
    streams: RwLock<BTreeMap<Aggregate, Vec<Event>>>,
    publisher: Publisher<Event>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(BTreeMap::new()),
            publisher: Publisher::new("backend", super::DEFAULT_SUBSCRIBER_CAPACITY),
        }
    }

    /// Returns the number of events held for an aggregate.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the log lock is poisoned.
    pub fn len(&self, aggregate: &Aggregate) -> Result<usize> {
        let streams = self.streams.read().map_err(poison_err)?;
        Ok(streams.get(aggregate).map_or(0, Vec::len))
    }

    /// Returns true if the backend holds no events at all.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the log lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        let streams = self.streams.read().map_err(poison_err)?;
        Ok(streams.values().all(Vec::is_empty))
    }
}

#[async_trait]
impl EventBackend for MemoryBackend {
    async fn append(&self, aggregate: &Aggregate, event: NewEvent) -> Result<Event> {
        validate_append(aggregate, &event)?;

        let appended = {
            let mut streams = self.streams.write().map_err(poison_err)?;
            let log = streams.entry(aggregate.clone()).or_default();
            let sequence = log.len() as u64;

            if let Some(expected) = event.expected_sequence {
                if expected != sequence {
                    return Err(Error::Conflict {
                        aggregate: aggregate.to_string(),
                        expected,
                        actual: sequence,
                    });
                }
            }

            let appended = Event {
                id: EventId::generate(),
                aggregate: aggregate.clone(),
                sequence,
                timestamp: Utc::now(),
                metadata: event.metadata,
                data: event.data,
            };
            log.push(appended.clone());
            appended
        };

        record_event_appended(&aggregate.kind.to_string(), appended.data.name());
        tracing::debug!(
            aggregate = %aggregate,
            event = appended.data.name(),
            sequence = appended.sequence,
            "event appended"
        );

        self.publisher.publish(&appended);
        Ok(appended)
    }

    async fn get(&self, aggregate: &Aggregate) -> Result<Vec<Event>> {
        let streams = self.streams.read().map_err(poison_err)?;
        streams
            .get(aggregate)
            .filter(|log| !log.is_empty())
            .cloned()
            .ok_or_else(|| Error::not_found(aggregate.to_string()))
    }

    async fn list(&self) -> Result<Vec<Aggregate>> {
        let streams = self.streams.read().map_err(poison_err)?;
        Ok(streams.keys().cloned().collect())
    }

    fn subscribe_with_capacity(
        &self,
        filter: EventFilter,
        capacity: usize,
    ) -> mpsc::Receiver<Event> {
        self.publisher
            .subscribe_with_capacity(capacity, move |event| filter.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AggregateKind, EventData};
    use weft_core::InvocationId;

    fn invocation_aggregate() -> Aggregate {
        Aggregate::invocation(InvocationId::generate())
    }

    #[tokio::test]
    async fn append_then_get_returns_events_in_order() -> Result<()> {
        let backend = MemoryBackend::new();
        let aggregate = invocation_aggregate();

        for task_id in ["a", "b", "c"] {
            backend
                .append(
                    &aggregate,
                    NewEvent::new(EventData::TaskSkipped {
                        task_id: task_id.into(),
                    }),
                )
                .await?;
        }

        let events = backend.get(&aggregate).await?;
        assert_eq!(events.len(), 3);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, i as u64);
        }
        assert_eq!(events[0].data.task_id(), Some("a"));
        assert_eq!(events[2].data.task_id(), Some("c"));

        Ok(())
    }

    #[tokio::test]
    async fn sequences_are_per_aggregate() -> Result<()> {
        let backend = MemoryBackend::new();
        let first = invocation_aggregate();
        let second = invocation_aggregate();

        backend
            .append(&first, NewEvent::new(EventData::InvocationCanceled))
            .await?;
        let event = backend
            .append(&second, NewEvent::new(EventData::InvocationCanceled))
            .await?;

        assert_eq!(event.sequence, 0);
        Ok(())
    }

    #[tokio::test]
    async fn expected_sequence_mismatch_conflicts() -> Result<()> {
        let backend = MemoryBackend::new();
        let aggregate = invocation_aggregate();

        backend
            .append(&aggregate, NewEvent::new(EventData::InvocationCanceled))
            .await?;

        let result = backend
            .append(
                &aggregate,
                NewEvent::new(EventData::InvocationCanceled).with_expected_sequence(0),
            )
            .await;
        assert!(matches!(result, Err(Error::Conflict { expected: 0, actual: 1, .. })));

        // The conflicting append must not have been persisted.
        assert_eq!(backend.len(&aggregate)?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn get_unknown_aggregate_is_not_found() {
        let backend = MemoryBackend::new();
        let result = backend.get(&invocation_aggregate()).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn cross_kind_append_is_rejected() {
        let backend = MemoryBackend::new();
        let result = backend
            .append(
                &invocation_aggregate(),
                NewEvent::new(EventData::WorkflowDeleted),
            )
            .await;
        assert!(matches!(result, Err(Error::FailedPrecondition { .. })));
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events() -> Result<()> {
        let backend = MemoryBackend::new();
        let mut invocations =
            backend.subscribe(EventFilter::KindIn(vec![AggregateKind::Invocation]));

        let aggregate = invocation_aggregate();
        backend
            .append(&aggregate, NewEvent::new(EventData::InvocationCanceled))
            .await?;

        let event = invocations.recv().await.expect("subscription closed");
        assert_eq!(event.aggregate, aggregate);
        Ok(())
    }

    #[tokio::test]
    async fn list_returns_all_aggregates() -> Result<()> {
        let backend = MemoryBackend::new();
        let a = invocation_aggregate();
        let b = invocation_aggregate();

        backend
            .append(&a, NewEvent::new(EventData::InvocationCanceled))
            .await?;
        backend
            .append(&b, NewEvent::new(EventData::InvocationCanceled))
            .await?;

        let mut listed = backend.list().await?;
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
        Ok(())
    }
}
