//! Events: the sole mutation primitive of the engine.
//!
//! Every state change is an immutable [`Event`] appended to the log of one
//! [`Aggregate`]. The backend assigns each event a sequence that is total
//! within its aggregate; projections fold events in sequence order and are
//! derived state only.
//!
//! ## Envelope
//!
//! An event carries:
//! - `id`: unique event identifier (ULID, lexicographically sortable)
//! - `aggregate`: the entity the event addresses (`kind` + `id`)
//! - `sequence`: position within the aggregate's log, starting at 0
//! - `timestamp`: when the event was appended
//! - `metadata`: string labels, including tracing span context and a
//!   parent-aggregate reference for sub-workflow lineage
//! - `data`: the typed payload
//!
//! ## Forward compatibility
//!
//! Unknown event types deserialize to [`EventData::Unknown`] and are skipped
//! by projections, so older engines tolerate events from newer writers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::{EventId, FunctionRef, InvocationId, TypedValue, WorkflowId};

use crate::invocation::InvocationSpec;
use crate::workflow::{ResolvedTask, Workflow, WorkflowSpec};

/// Metadata keys with engine-defined meaning.
pub mod metadata {
    /// Serialized tracing span context.
    pub const SPAN_CONTEXT: &str = "span.context";
    /// Aggregate kind of the parent invocation (sub-workflow lineage).
    pub const PARENT_KIND: &str = "parent.kind";
    /// Aggregate id of the parent invocation (sub-workflow lineage).
    pub const PARENT_ID: &str = "parent.id";
}

/// The kind of an event-sourced entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    /// A workflow definition.
    Workflow,
    /// A workflow invocation.
    Invocation,
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Invocation => write!(f, "invocation"),
        }
    }
}

/// The identity of an event-sourced entity: kind plus id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    /// The entity kind.
    pub kind: AggregateKind,
    /// The entity id, rendered as a string.
    pub id: String,
}

impl Aggregate {
    /// Creates the aggregate for a workflow.
    #[must_use]
    pub fn workflow(id: WorkflowId) -> Self {
        Self {
            kind: AggregateKind::Workflow,
            id: id.to_string(),
        }
    }

    /// Creates the aggregate for an invocation.
    #[must_use]
    pub fn invocation(id: InvocationId) -> Self {
        Self {
            kind: AggregateKind::Invocation,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventData {
    /// A workflow definition was submitted.
    WorkflowCreated {
        /// The submitted definition.
        spec: WorkflowSpec,
    },

    /// All function references of a workflow were resolved.
    WorkflowParsed {
        /// Resolved tasks, keyed by task id.
        tasks: BTreeMap<String, ResolvedTask>,
    },

    /// Function resolution failed; the workflow is unusable.
    WorkflowParseFailed {
        /// Human-readable failure reason.
        error: String,
    },

    /// The workflow was deleted.
    WorkflowDeleted,

    /// An invocation was created with an embedded workflow snapshot.
    InvocationCreated {
        /// The user-supplied parameters.
        spec: InvocationSpec,
        /// The workflow definition at creation time.
        workflow: Box<Workflow>,
    },

    /// The invocation was canceled by a user.
    InvocationCanceled,

    /// The invocation completed successfully.
    InvocationCompleted {
        /// The final output, if a designated output task exists.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<TypedValue>,
        /// The final output headers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_headers: Option<TypedValue>,
    },

    /// The invocation failed.
    InvocationFailed {
        /// Human-readable failure reason.
        error: String,
    },

    /// A task's runtime call started.
    TaskStarted {
        /// The task id within the invocation.
        task_id: String,
        /// The function reference being invoked.
        fn_ref: FunctionRef,
        /// Inputs after expression resolution.
        inputs: BTreeMap<String, TypedValue>,
    },

    /// A task's runtime call succeeded.
    TaskSucceeded {
        /// The task id within the invocation.
        task_id: String,
        /// The (post-transformed) output.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<TypedValue>,
        /// The (post-transformed) output headers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_headers: Option<TypedValue>,
    },

    /// A task's runtime call reported an application failure.
    TaskFailed {
        /// The task id within the invocation.
        task_id: String,
        /// Human-readable failure reason.
        error: String,
    },

    /// A task was skipped (its run state becomes Aborted).
    TaskSkipped {
        /// The task id within the invocation.
        task_id: String,
    },

    /// Synthetic event emitted by poll and staleness sensors to force a
    /// controller evaluation. Never appended to the backend.
    Refresh,

    /// An event type this engine does not know. Tolerated and skipped.
    #[serde(other)]
    Unknown,
}

impl EventData {
    /// Returns the `snake_case` event name for logging and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowCreated { .. } => "workflow_created",
            Self::WorkflowParsed { .. } => "workflow_parsed",
            Self::WorkflowParseFailed { .. } => "workflow_parse_failed",
            Self::WorkflowDeleted => "workflow_deleted",
            Self::InvocationCreated { .. } => "invocation_created",
            Self::InvocationCanceled => "invocation_canceled",
            Self::InvocationCompleted { .. } => "invocation_completed",
            Self::InvocationFailed { .. } => "invocation_failed",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskSucceeded { .. } => "task_succeeded",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskSkipped { .. } => "task_skipped",
            Self::Refresh => "refresh",
            Self::Unknown => "unknown",
        }
    }

    /// Returns the task id this event addresses, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task_id, .. }
            | Self::TaskSucceeded { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskSkipped { task_id } => Some(task_id),
            _ => None,
        }
    }

    /// Returns the aggregate kind this payload is valid for, or `None` for
    /// kind-agnostic payloads (`Refresh`, `Unknown`).
    #[must_use]
    pub fn aggregate_kind(&self) -> Option<AggregateKind> {
        match self {
            Self::WorkflowCreated { .. }
            | Self::WorkflowParsed { .. }
            | Self::WorkflowParseFailed { .. }
            | Self::WorkflowDeleted => Some(AggregateKind::Workflow),
            Self::InvocationCreated { .. }
            | Self::InvocationCanceled
            | Self::InvocationCompleted { .. }
            | Self::InvocationFailed { .. }
            | Self::TaskStarted { .. }
            | Self::TaskSucceeded { .. }
            | Self::TaskFailed { .. }
            | Self::TaskSkipped { .. } => Some(AggregateKind::Invocation),
            Self::Refresh | Self::Unknown => None,
        }
    }
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event identifier (ULID).
    pub id: EventId,
    /// The aggregate this event addresses.
    pub aggregate: Aggregate,
    /// Position within the aggregate's log, starting at 0.
    pub sequence: u64,
    /// When the event was appended.
    pub timestamp: DateTime<Utc>,
    /// String labels: tracing context, parent-aggregate lineage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// The typed payload.
    pub data: EventData,
}

impl Event {
    /// Returns the parent aggregate recorded in metadata, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Aggregate> {
        let kind = match self.metadata.get(metadata::PARENT_KIND)?.as_str() {
            "workflow" => AggregateKind::Workflow,
            "invocation" => AggregateKind::Invocation,
            _ => return None,
        };
        let id = self.metadata.get(metadata::PARENT_ID)?.clone();
        Some(Aggregate { kind, id })
    }

    /// Creates a synthetic refresh event for an aggregate. Refresh events
    /// only travel through eval queues; they are never appended.
    #[must_use]
    pub fn refresh(aggregate: Aggregate) -> Self {
        Self {
            id: EventId::generate(),
            aggregate,
            sequence: 0,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            data: EventData::Refresh,
        }
    }
}

/// An event awaiting append: the payload plus optional metadata and an
/// optional optimistic-concurrency check.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// The typed payload.
    pub data: EventData,
    /// String labels to attach to the event.
    pub metadata: BTreeMap<String, String>,
    /// When set, the append fails with a conflict unless the assigned
    /// sequence equals this value.
    pub expected_sequence: Option<u64>,
}

impl NewEvent {
    /// Creates a new event with empty metadata.
    #[must_use]
    pub fn new(data: EventData) -> Self {
        Self {
            data,
            metadata: BTreeMap::new(),
            expected_sequence: None,
        }
    }

    /// Attaches a metadata label.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Records a parent aggregate in metadata.
    #[must_use]
    pub fn with_parent(self, parent: &Aggregate) -> Self {
        self.with_metadata(metadata::PARENT_KIND, parent.kind.to_string())
            .with_metadata(metadata::PARENT_ID, parent.id.clone())
    }

    /// Requires the assigned sequence to equal `sequence`.
    #[must_use]
    pub const fn with_expected_sequence(mut self, sequence: u64) -> Self {
        self.expected_sequence = Some(sequence);
        self
    }
}
