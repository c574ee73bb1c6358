//! Projectors: deterministic folds of events into entity state.
//!
//! A projector is an initial-state constructor plus a pure function
//! `(current, event) -> next`. Replaying an aggregate's events from
//! sequence 0 yields the canonical entity, regardless of how the replay is
//! split. Unknown event types are skipped so newer writers never break older
//! readers; events for the wrong aggregate kind are a precondition failure.
//!
//! Every applied event — including skipped ones — advances the entity's
//! `version` to `sequence + 1`, so the cache can tell a duplicate delivery
//! from a gap.

use weft_core::{InvocationId, WorkflowId};

use crate::error::{Error, Result};
use crate::events::{Aggregate, AggregateKind, Event, EventData};
use crate::invocation::{
    Invocation, InvocationSpec, InvocationStatus, TaskInvocation, TaskInvocationStatus,
};
use crate::workflow::{Workflow, WorkflowSpec, WorkflowStatus};

/// A deterministic fold of events into entity state.
pub trait Projector: Send + Sync + 'static {
    /// The entity this projector produces.
    type Entity: Clone + Send + Sync + 'static;

    /// The aggregate kind this projector accepts events for.
    fn kind(&self) -> AggregateKind;

    /// Constructs the pre-first-event state for an aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error when the aggregate id cannot be parsed.
    fn initial(&self, aggregate: &Aggregate) -> Result<Self::Entity>;

    /// Folds one event into the entity. Pure: the result depends only on
    /// the arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailedPrecondition`] for events of the wrong
    /// aggregate kind.
    fn apply(&self, entity: &Self::Entity, event: &Event) -> Result<Self::Entity>;

    /// Replays a full event sequence from the initial state.
    ///
    /// # Errors
    ///
    /// Propagates the first `initial` or `apply` failure.
    fn replay(&self, aggregate: &Aggregate, events: &[Event]) -> Result<Self::Entity> {
        let mut entity = self.initial(aggregate)?;
        for event in events {
            entity = self.apply(&entity, event)?;
        }
        Ok(entity)
    }
}

fn check_kind(expected: AggregateKind, event: &Event) -> Result<()> {
    if event.aggregate.kind == expected {
        Ok(())
    } else {
        Err(Error::failed_precondition(format!(
            "event '{}' for {} aggregate applied to a {} projection",
            event.data.name(),
            event.aggregate.kind,
            expected
        )))
    }
}

/// Projects workflow aggregates.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowProjector;

impl Projector for WorkflowProjector {
    type Entity = Workflow;

    fn kind(&self) -> AggregateKind {
        AggregateKind::Workflow
    }

    fn initial(&self, aggregate: &Aggregate) -> Result<Workflow> {
        let id: WorkflowId = aggregate.id.parse()?;
        Ok(Workflow {
            id,
            spec: WorkflowSpec::default(),
            status: WorkflowStatus::Parsing,
            tasks: std::collections::BTreeMap::new(),
            error: None,
            created_at: chrono::DateTime::UNIX_EPOCH,
            updated_at: chrono::DateTime::UNIX_EPOCH,
            version: 0,
        })
    }

    fn apply(&self, entity: &Workflow, event: &Event) -> Result<Workflow> {
        check_kind(AggregateKind::Workflow, event)?;

        let mut next = entity.clone();
        match &event.data {
            EventData::WorkflowCreated { spec } => {
                next.spec = spec.clone();
                next.status = WorkflowStatus::Parsing;
                next.created_at = event.timestamp;
            }
            EventData::WorkflowParsed { tasks } => {
                next.tasks = tasks.clone();
                next.status = WorkflowStatus::Ready;
            }
            EventData::WorkflowParseFailed { error } => {
                next.status = WorkflowStatus::Failed;
                next.error = Some(error.clone());
            }
            EventData::WorkflowDeleted => {
                next.status = WorkflowStatus::Deleted;
            }
            EventData::Refresh | EventData::Unknown => {
                tracing::debug!(
                    aggregate = %event.aggregate,
                    event = event.data.name(),
                    "skipping event in workflow projection"
                );
            }
            _ => return Err(Error::failed_precondition(format!(
                "event '{}' is not a workflow event",
                event.data.name()
            ))),
        }

        next.updated_at = event.timestamp;
        next.version = event.sequence + 1;
        Ok(next)
    }
}

/// Projects invocation aggregates.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvocationProjector;

impl InvocationProjector {
    fn apply_task_event(invocation: &mut Invocation, event: &Event) {
        let Some(task_id) = event.data.task_id() else {
            return;
        };

        let task = invocation.tasks.entry(task_id.to_string()).or_insert_with(|| {
            // Task events may arrive for tasks the embedded workflow does
            // not define (e.g. dynamically added ones); track them anyway.
            TaskInvocation::scheduled(task_id, weft_core::FunctionRef::new("unknown", task_id))
        });

        match &event.data {
            EventData::TaskStarted {
                fn_ref, inputs, ..
            } => {
                task.status = TaskInvocationStatus::InProgress;
                task.fn_ref = fn_ref.clone();
                task.inputs = inputs.clone();
                task.started_at = Some(event.timestamp);
                invocation.status = InvocationStatus::InProgress;
            }
            EventData::TaskSucceeded {
                output,
                output_headers,
                ..
            } => {
                task.status = TaskInvocationStatus::Succeeded;
                task.output = output.clone();
                task.output_headers = output_headers.clone();
                task.finished_at = Some(event.timestamp);
            }
            EventData::TaskFailed { error, .. } => {
                task.status = TaskInvocationStatus::Failed;
                task.error = Some(error.clone());
                task.finished_at = Some(event.timestamp);
            }
            EventData::TaskSkipped { .. } => {
                task.status = TaskInvocationStatus::Aborted;
                task.finished_at = Some(event.timestamp);
            }
            _ => {}
        }
    }
}

impl Projector for InvocationProjector {
    type Entity = Invocation;

    fn kind(&self) -> AggregateKind {
        AggregateKind::Invocation
    }

    fn initial(&self, aggregate: &Aggregate) -> Result<Invocation> {
        let id: InvocationId = aggregate.id.parse()?;
        Ok(Invocation {
            id,
            workflow: None,
            spec: InvocationSpec::new(WorkflowId::from_ulid(ulid::Ulid::nil())),
            status: InvocationStatus::Scheduled,
            tasks: std::collections::BTreeMap::new(),
            output: None,
            output_headers: None,
            error: None,
            created_at: chrono::DateTime::UNIX_EPOCH,
            updated_at: chrono::DateTime::UNIX_EPOCH,
            version: 0,
        })
    }

    fn apply(&self, entity: &Invocation, event: &Event) -> Result<Invocation> {
        check_kind(AggregateKind::Invocation, event)?;

        let mut next = entity.clone();

        // A terminal invocation is frozen: nothing but the version moves.
        if entity.is_terminal() && !matches!(event.data, EventData::Refresh | EventData::Unknown)
        {
            tracing::warn!(
                aggregate = %event.aggregate,
                event = event.data.name(),
                status = ?entity.status,
                "event for terminal invocation ignored"
            );
            next.version = event.sequence + 1;
            return Ok(next);
        }

        match &event.data {
            EventData::InvocationCreated { spec, workflow } => {
                next.spec = spec.clone();
                next.created_at = event.timestamp;
                next.status = InvocationStatus::Scheduled;
                next.tasks = workflow
                    .spec
                    .tasks
                    .iter()
                    .map(|(task_id, task)| {
                        (
                            task_id.clone(),
                            TaskInvocation::scheduled(task_id, task.function.clone()),
                        )
                    })
                    .collect();
                next.workflow = Some((**workflow).clone());
            }
            EventData::TaskStarted { .. }
            | EventData::TaskSucceeded { .. }
            | EventData::TaskFailed { .. }
            | EventData::TaskSkipped { .. } => {
                Self::apply_task_event(&mut next, event);
            }
            EventData::InvocationCompleted {
                output,
                output_headers,
            } => {
                next.status = InvocationStatus::Succeeded;
                next.output = output.clone();
                next.output_headers = output_headers.clone();
            }
            EventData::InvocationFailed { error } => {
                next.status = InvocationStatus::Failed;
                next.error = Some(error.clone());
            }
            EventData::InvocationCanceled => {
                next.status = InvocationStatus::Aborted;
                next.error = Some("invocation canceled".to_string());
            }
            EventData::Refresh | EventData::Unknown => {
                tracing::debug!(
                    aggregate = %event.aggregate,
                    event = event.data.name(),
                    "skipping event in invocation projection"
                );
            }
            _ => return Err(Error::failed_precondition(format!(
                "event '{}' is not an invocation event",
                event.data.name()
            ))),
        }

        next.updated_at = event.timestamp;
        next.version = event.sequence + 1;
        Ok(next)
    }
}
