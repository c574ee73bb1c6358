//! Workflow invocations.
//!
//! An invocation is one runtime execution of a workflow. It embeds a
//! snapshot of the workflow definition taken at creation time, so that a
//! later redefinition of the workflow never changes an execution in flight.
//! Invocations are created by an `InvocationCreated` event and mutated only
//! by projection of subsequent events; once the status is terminal the
//! projection is frozen.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::{FunctionRef, InvocationId, TypedValue, WorkflowId};

use crate::workflow::Workflow;

/// The lifecycle state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Created but no task has started yet.
    Scheduled,
    /// At least one task has started.
    InProgress,
    /// All tasks succeeded; output is final.
    Succeeded,
    /// The invocation failed; `error` carries the reason.
    Failed,
    /// The invocation was canceled by a user or the scheduler.
    Aborted,
}

impl InvocationStatus {
    /// Returns true if the status is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

/// The lifecycle state of one task run within an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInvocationStatus {
    /// Waiting for dependencies or dispatch.
    Scheduled,
    /// The runtime call is in flight.
    InProgress,
    /// The runtime call succeeded.
    Succeeded,
    /// The runtime reported an application failure.
    Failed,
    /// The task was skipped or canceled.
    Aborted,
}

impl TaskInvocationStatus {
    /// Returns true if the task run is finished.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }
}

/// The run state of one task within an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInvocation {
    /// The task id within the workflow.
    pub task_id: String,
    /// The function reference the run dispatches on.
    pub fn_ref: FunctionRef,
    /// Inputs after expression resolution; empty until the task starts.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, TypedValue>,
    /// Current run state.
    pub status: TaskInvocationStatus,
    /// The (possibly transformed) output; set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TypedValue>,
    /// The (possibly transformed) output headers; set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_headers: Option<TypedValue>,
    /// The failure message; set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the runtime call started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskInvocation {
    /// Creates a fresh task run in the `Scheduled` state.
    #[must_use]
    pub fn scheduled(task_id: impl Into<String>, fn_ref: FunctionRef) -> Self {
        Self {
            task_id: task_id.into(),
            fn_ref,
            inputs: BTreeMap::new(),
            status: TaskInvocationStatus::Scheduled,
            output: None,
            output_headers: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Returns true if the run succeeded.
    #[must_use]
    pub const fn is_successful(&self) -> bool {
        matches!(self.status, TaskInvocationStatus::Succeeded)
    }
}

/// The user-supplied parameters of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationSpec {
    /// The workflow to execute.
    pub workflow_id: WorkflowId,
    /// Concrete invocation inputs, available as `$.Invocation.Inputs`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, TypedValue>,
    /// Absolute deadline for the whole invocation. Defaults to
    /// creation time plus the engine's configured maximum runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// The parent invocation when this is a sub-workflow run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<InvocationId>,
}

impl InvocationSpec {
    /// Creates a spec for the given workflow.
    #[must_use]
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            inputs: BTreeMap::new(),
            deadline: None,
            parent_id: None,
        }
    }

    /// Adds an invocation input.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, value: TypedValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Sets the absolute deadline.
    #[must_use]
    pub const fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Marks this invocation as a child of `parent_id`.
    #[must_use]
    pub const fn parent(mut self, parent_id: InvocationId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// A projected invocation entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// Unique identifier.
    pub id: InvocationId,
    /// Snapshot of the workflow definition at creation time. Absent only
    /// when the event log is malformed; controllers fail the invocation in
    /// that case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Workflow>,
    /// The user-supplied parameters.
    pub spec: InvocationSpec,
    /// Current lifecycle state.
    pub status: InvocationStatus,
    /// Per-task run state, keyed by task id.
    pub tasks: BTreeMap<String, TaskInvocation>,
    /// The invocation output; set when the invocation succeeds and a
    /// designated output task exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TypedValue>,
    /// The invocation output headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_headers: Option<TypedValue>,
    /// The failure reason; set when the invocation fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the invocation was created.
    pub created_at: DateTime<Utc>,
    /// When the invocation last changed.
    pub updated_at: DateTime<Utc>,
    /// Number of events folded into this projection.
    pub version: u64,
}

impl Invocation {
    /// Returns the run state of a task by id.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&TaskInvocation> {
        self.tasks.get(task_id)
    }

    /// Returns true if the invocation reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if every task run is finished.
    #[must_use]
    pub fn all_tasks_finished(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_finished())
    }

    /// Returns true if any task run failed or was aborted.
    #[must_use]
    pub fn any_task_failed(&self) -> bool {
        self.tasks.values().any(|t| {
            matches!(
                t.status,
                TaskInvocationStatus::Failed | TaskInvocationStatus::Aborted
            )
        })
    }

    /// Returns the effective deadline: the spec's deadline when set,
    /// otherwise creation time plus `default_max_runtime`.
    #[must_use]
    pub fn effective_deadline(&self, default_max_runtime: Duration) -> DateTime<Utc> {
        self.spec.deadline.unwrap_or_else(|| {
            self.created_at
                + chrono::Duration::from_std(default_max_runtime)
                    .unwrap_or_else(|_| chrono::Duration::minutes(10))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_report_terminality() {
        assert!(!InvocationStatus::Scheduled.is_terminal());
        assert!(!InvocationStatus::InProgress.is_terminal());
        assert!(InvocationStatus::Succeeded.is_terminal());
        assert!(InvocationStatus::Failed.is_terminal());
        assert!(InvocationStatus::Aborted.is_terminal());
    }

    #[test]
    fn task_statuses_report_finished() {
        assert!(!TaskInvocationStatus::Scheduled.is_finished());
        assert!(!TaskInvocationStatus::InProgress.is_finished());
        assert!(TaskInvocationStatus::Succeeded.is_finished());
        assert!(TaskInvocationStatus::Failed.is_finished());
        assert!(TaskInvocationStatus::Aborted.is_finished());
    }

    #[test]
    fn spec_builder_sets_fields() {
        let workflow_id = WorkflowId::generate();
        let parent = InvocationId::generate();
        let spec = InvocationSpec::new(workflow_id)
            .input("q", TypedValue::string("hello"))
            .parent(parent);

        assert_eq!(spec.workflow_id, workflow_id);
        assert_eq!(spec.parent_id, Some(parent));
        assert_eq!(
            spec.inputs.get("q"),
            Some(&TypedValue::string("hello"))
        );
    }
}
