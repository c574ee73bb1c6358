//! The recursive sub-workflow runtime.
//!
//! A task whose function reference uses the `workflow` runtime invokes
//! another workflow: the runtime creates a child invocation carrying the
//! parent's id (so the child scope chains to the parent's), then blocks
//! until the child reaches a terminal state and maps its outcome back onto
//! the task.

use std::time::Duration;

use async_trait::async_trait;

use weft_core::{FunctionRef, WorkflowId};

use super::{Runtime, TaskInvocationSpec, TaskResult};
use crate::api::InvocationApi;
use crate::error::{Error, Result};
use crate::events::Aggregate;
use crate::invocation::{InvocationSpec, InvocationStatus};
use crate::stores::{EntityStore, Invocations, Workflows};

/// The runtime name sub-workflow references dispatch on.
pub const RUNTIME_WORKFLOW: &str = "workflow";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runtime that executes a child workflow invocation per task run.
#[derive(Clone)]
pub struct SubWorkflowRuntime {
    invocation_api: InvocationApi,
    invocations: Invocations,
    workflows: Workflows,
}

impl SubWorkflowRuntime {
    /// Creates the runtime.
    #[must_use]
    pub fn new(
        invocation_api: InvocationApi,
        invocations: Invocations,
        workflows: Workflows,
    ) -> Self {
        Self {
            invocation_api,
            invocations,
            workflows,
        }
    }

    fn workflow_id(fn_ref: &FunctionRef) -> Result<WorkflowId> {
        fn_ref.id.parse().map_err(|_| {
            Error::validation(format!(
                "'{}' is not a workflow id in reference {fn_ref}",
                fn_ref.id
            ))
        })
    }
}

impl std::fmt::Debug for SubWorkflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubWorkflowRuntime").finish_non_exhaustive()
    }
}

#[async_trait]
impl Runtime for SubWorkflowRuntime {
    fn name(&self) -> &'static str {
        RUNTIME_WORKFLOW
    }

    async fn invoke(&self, spec: &TaskInvocationSpec) -> Result<TaskResult> {
        let workflow_id = Self::workflow_id(&spec.fn_ref)?;

        let mut child_spec = InvocationSpec::new(workflow_id).parent(spec.invocation_id);
        child_spec.inputs = spec.inputs.clone();
        child_spec.deadline = spec.deadline;

        let child_id = self.invocation_api.invoke(child_spec).await?;
        tracing::debug!(
            parent = %spec.invocation_id,
            task = %spec.task_id,
            child = %child_id,
            workflow = %workflow_id,
            "sub-workflow invocation created"
        );

        // Await the child's terminal state. The task-level deadline in the
        // caller also bounds this wait; the refresh below keeps the view
        // current even when notifications were dropped.
        let child_aggregate = Aggregate::invocation(child_id);
        loop {
            let child = self.invocations.refresh(&child_aggregate).await?;
            match child.status {
                InvocationStatus::Succeeded => {
                    return Ok(TaskResult::Succeeded {
                        output: child.output.clone(),
                        output_headers: child.output_headers.clone(),
                    });
                }
                InvocationStatus::Failed | InvocationStatus::Aborted => {
                    return Ok(TaskResult::Failed {
                        error: child
                            .error
                            .clone()
                            .unwrap_or_else(|| "sub-workflow failed".to_string()),
                    });
                }
                InvocationStatus::Scheduled | InvocationStatus::InProgress => {}
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn resolve(&self, fn_ref: &FunctionRef) -> Result<String> {
        let workflow_id = Self::workflow_id(fn_ref)?;
        let workflow = self.workflows.get(workflow_id).await?;
        Ok(workflow.id.to_string())
    }
}
