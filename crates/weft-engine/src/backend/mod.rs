//! The event backend contract: an append-only ordered log partitioned by
//! aggregate, with pub/sub of appended events.
//!
//! Two implementations satisfy the contract: [`memory::MemoryBackend`], an
//! in-process log used by tests and single-node deployments, and a clustered
//! streaming log that lives outside this crate (only its subscriber
//! configuration, [`stream::StreamConfig`], is recognized here).
//!
//! ## Failure modes
//!
//! - [`Error::Conflict`]: optimistic sequence mismatch — retry after re-read
//! - [`Error::Unavailable`]: backend down — retry with backoff
//! - [`Error::FailedPrecondition`]: invalid event for the aggregate — do not
//!   retry
//! - [`Error::NotFound`]: the aggregate has no events

pub mod memory;
pub mod stream;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::events::{Aggregate, AggregateKind, Event, NewEvent};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1000;

/// A predicate over event metadata, evaluated at publish time.
///
/// Filters compose with conjunction ([`EventFilter::AllOf`]), disjunction
/// ([`EventFilter::AnyOf`]), and set membership ([`EventFilter::KindIn`]).
/// For example, "aggregate kind in {Invocation} or parent kind is
/// Invocation":
///
/// ```rust
/// use weft_engine::backend::EventFilter;
/// use weft_engine::events::AggregateKind;
///
/// let filter = EventFilter::AnyOf(vec![
///     EventFilter::KindIn(vec![AggregateKind::Invocation]),
///     EventFilter::ParentKind(AggregateKind::Invocation),
/// ]);
/// # let _ = filter;
/// ```
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Matches every event.
    All,
    /// Matches events whose aggregate kind is in the set.
    KindIn(Vec<AggregateKind>),
    /// Matches events whose recorded parent aggregate has this kind.
    ParentKind(AggregateKind),
    /// Matches when every inner filter matches.
    AllOf(Vec<EventFilter>),
    /// Matches when any inner filter matches.
    AnyOf(Vec<EventFilter>),
}

impl EventFilter {
    /// Evaluates the filter against an event.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::KindIn(kinds) => kinds.contains(&event.aggregate.kind),
            Self::ParentKind(kind) => event.parent().is_some_and(|p| p.kind == *kind),
            Self::AllOf(filters) => filters.iter().all(|f| f.matches(event)),
            Self::AnyOf(filters) => filters.iter().any(|f| f.matches(event)),
        }
    }
}

/// The event backend contract.
#[async_trait]
pub trait EventBackend: Send + Sync {
    /// Appends an event, atomically assigning the next sequence within the
    /// aggregate.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] when `expected_sequence` is set and does not
    ///   match the next sequence
    /// - [`Error::FailedPrecondition`] when the payload is invalid for the
    ///   aggregate kind
    /// - [`Error::Unavailable`] / [`Error::Transport`] on backend failure
    async fn append(&self, aggregate: &Aggregate, event: NewEvent) -> Result<Event>;

    /// Returns all events of an aggregate in append order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the aggregate has no events.
    async fn get(&self, aggregate: &Aggregate) -> Result<Vec<Event>>;

    /// Lists every aggregate known to the backend.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the backend cannot be reached.
    async fn list(&self) -> Result<Vec<Aggregate>>;

    /// Subscribes to appended events matching `filter`, with an explicit
    /// per-subscriber buffer capacity. Publishing never blocks; a full
    /// buffer drops events for that subscriber.
    fn subscribe_with_capacity(
        &self,
        filter: EventFilter,
        capacity: usize,
    ) -> mpsc::Receiver<Event>;

    /// Subscribes with the default buffer capacity.
    fn subscribe(&self, filter: EventFilter) -> mpsc::Receiver<Event> {
        self.subscribe_with_capacity(filter, DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// Validates that a payload may be appended to an aggregate.
///
/// # Errors
///
/// Returns [`Error::FailedPrecondition`] when the payload belongs to a
/// different aggregate kind, or is synthetic/unknown.
pub fn validate_append(aggregate: &Aggregate, event: &NewEvent) -> Result<()> {
    match event.data.aggregate_kind() {
        Some(kind) if kind == aggregate.kind => Ok(()),
        Some(kind) => Err(Error::failed_precondition(format!(
            "event '{}' targets {kind} aggregates, not {}",
            event.data.name(),
            aggregate.kind
        ))),
        None => Err(Error::failed_precondition(format!(
            "event '{}' cannot be appended",
            event.data.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{metadata, EventData};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use weft_core::{EventId, InvocationId, WorkflowId};

    fn event_for(aggregate: Aggregate) -> Event {
        Event {
            id: EventId::generate(),
            aggregate,
            sequence: 0,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            data: EventData::InvocationCanceled,
        }
    }

    #[test]
    fn kind_membership_filter() {
        let filter = EventFilter::KindIn(vec![AggregateKind::Invocation]);
        assert!(filter.matches(&event_for(Aggregate::invocation(InvocationId::generate()))));
        assert!(!filter.matches(&event_for(Aggregate::workflow(WorkflowId::generate()))));
    }

    #[test]
    fn disjunction_matches_either_side() {
        let filter = EventFilter::AnyOf(vec![
            EventFilter::KindIn(vec![AggregateKind::Invocation]),
            EventFilter::ParentKind(AggregateKind::Invocation),
        ]);

        // Plain invocation event: matches via kind membership.
        assert!(filter.matches(&event_for(Aggregate::invocation(InvocationId::generate()))));

        // Workflow event with an invocation parent: matches via parent kind.
        let mut event = event_for(Aggregate::workflow(WorkflowId::generate()));
        event.metadata.insert(
            metadata::PARENT_KIND.to_string(),
            "invocation".to_string(),
        );
        event.metadata.insert(
            metadata::PARENT_ID.to_string(),
            InvocationId::generate().to_string(),
        );
        assert!(filter.matches(&event));

        // Plain workflow event: matches neither.
        assert!(!filter.matches(&event_for(Aggregate::workflow(WorkflowId::generate()))));
    }

    #[test]
    fn conjunction_requires_all_sides() {
        let filter = EventFilter::AllOf(vec![
            EventFilter::KindIn(vec![AggregateKind::Invocation]),
            EventFilter::ParentKind(AggregateKind::Invocation),
        ]);
        assert!(!filter.matches(&event_for(Aggregate::invocation(InvocationId::generate()))));
    }

    #[test]
    fn validate_append_rejects_cross_kind_payloads() {
        let aggregate = Aggregate::workflow(WorkflowId::generate());
        let event = NewEvent::new(EventData::InvocationCanceled);
        assert!(matches!(
            validate_append(&aggregate, &event),
            Err(Error::FailedPrecondition { .. })
        ));
    }

    #[test]
    fn validate_append_rejects_synthetic_payloads() {
        let aggregate = Aggregate::invocation(InvocationId::generate());
        let event = NewEvent::new(EventData::Refresh);
        assert!(matches!(
            validate_append(&aggregate, &event),
            Err(Error::FailedPrecondition { .. })
        ));
    }
}
