//! Workflow definitions.
//!
//! A workflow is the static description of a task graph: an ordered map of
//! task id to task spec plus an optional designated output task. Workflows
//! are parsed once (function references resolved through the registered
//! runtimes) and are immutable after reaching [`WorkflowStatus::Ready`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::{FunctionRef, Input, Inputs, TypedValue, WorkflowId};

use crate::error::{Error, Result};

/// The spec of a single task in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    /// The function this task invokes.
    pub function: FunctionRef,

    /// Named inputs; values may be expressions over the invocation scope.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: Inputs,

    /// Explicit upstream dependencies by task id. Data-flow dependencies
    /// implied by input expressions are added automatically at scheduling
    /// time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Optional output transform. When set (typically an expression), the
    /// task's runtime output is replaced by this value resolved against a
    /// scope that includes the actual output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<TypedValue>,

    /// Optional output-headers transform, analogous to `output`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_headers: Option<TypedValue>,

    /// Per-invocation deadline for one runtime call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    /// Creates a task spec for the given function.
    #[must_use]
    pub fn new(function: FunctionRef) -> Self {
        Self {
            function,
            inputs: Inputs::new(),
            requires: Vec::new(),
            output: None,
            output_headers: None,
            timeout: None,
        }
    }

    /// Adds an input with the default priority.
    #[must_use]
    pub fn input(mut self, name: impl Into<String>, value: TypedValue) -> Self {
        self.inputs.insert(name.into(), Input::new(value));
        self
    }

    /// Adds an input with an explicit resolution priority.
    #[must_use]
    pub fn input_with_priority(
        mut self,
        name: impl Into<String>,
        value: TypedValue,
        priority: i32,
    ) -> Self {
        self.inputs
            .insert(name.into(), Input::new(value).with_priority(priority));
        self
    }

    /// Adds an explicit upstream dependency.
    #[must_use]
    pub fn requires(mut self, task_id: impl Into<String>) -> Self {
        self.requires.push(task_id.into());
        self
    }

    /// Sets the output transform.
    #[must_use]
    pub fn output(mut self, output: TypedValue) -> Self {
        self.output = Some(output);
        self
    }

    /// Sets the output-headers transform.
    #[must_use]
    pub fn output_headers(mut self, output_headers: TypedValue) -> Self {
        self.output_headers = Some(output_headers);
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns every upstream task this spec depends on: the explicit
    /// `requires` list plus tasks referenced from input expressions.
    #[must_use]
    pub fn dependencies(&self) -> std::collections::BTreeSet<String> {
        let mut deps: std::collections::BTreeSet<String> =
            self.requires.iter().cloned().collect();
        for input in self.inputs.values() {
            deps.extend(input.value.referenced_tasks());
        }
        deps
    }
}

/// A workflow definition as submitted by a user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    /// The tasks of the graph, keyed by user-chosen task id.
    pub tasks: BTreeMap<String, TaskSpec>,

    /// The task whose output becomes the invocation output, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_task: Option<String>,
}

impl WorkflowSpec {
    /// Creates an empty workflow spec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task to the spec.
    #[must_use]
    pub fn task(mut self, id: impl Into<String>, spec: TaskSpec) -> Self {
        self.tasks.insert(id.into(), spec);
        self
    }

    /// Designates the output task.
    #[must_use]
    pub fn output_task(mut self, id: impl Into<String>) -> Self {
        self.output_task = Some(id.into());
        self
    }

    /// Validates the structural invariants of the spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the designated output task or a
    /// declared dependency does not exist in the task map.
    pub fn validate(&self) -> Result<()> {
        if let Some(output_task) = &self.output_task {
            if !self.tasks.contains_key(output_task) {
                return Err(Error::validation(format!(
                    "output task '{output_task}' is not defined in the workflow"
                )));
            }
        }
        for (task_id, spec) in &self.tasks {
            for dep in spec.dependencies() {
                if !self.tasks.contains_key(&dep) {
                    return Err(Error::validation(format!(
                        "task '{task_id}' depends on undefined task '{dep}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The lifecycle state of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Function references are being resolved.
    Parsing,
    /// The workflow is ready to be invoked. Immutable from here on.
    Ready,
    /// Parsing failed; the workflow cannot be invoked.
    Failed,
    /// The workflow has been deleted.
    Deleted,
}

/// A task whose function reference has been resolved at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTask {
    /// The original function reference from the spec.
    pub function: FunctionRef,
    /// The canonical function id reported by the owning runtime.
    pub resolved_id: String,
}

/// A projected workflow entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique identifier.
    pub id: WorkflowId,
    /// The submitted definition.
    pub spec: WorkflowSpec,
    /// Current lifecycle state.
    pub status: WorkflowStatus,
    /// Resolved tasks; populated when the workflow becomes Ready.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<String, ResolvedTask>,
    /// Parse error; populated when the workflow fails to parse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// When the workflow last changed.
    pub updated_at: DateTime<Utc>,
    /// Number of events folded into this projection.
    pub version: u64,
}

impl Workflow {
    /// Returns the spec of a task by id.
    #[must_use]
    pub fn task_spec(&self, task_id: &str) -> Option<&TaskSpec> {
        self.spec.tasks.get(task_id)
    }

    /// Returns true if the workflow can be invoked.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self.status, WorkflowStatus::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> FunctionRef {
        FunctionRef::new("native", "noop")
    }

    #[test]
    fn task_spec_collects_dependencies_from_inputs_and_requires() {
        let spec = TaskSpec::new(noop())
            .requires("a")
            .input("x", TypedValue::expr("$.Tasks.b.Output").unwrap())
            .input("y", TypedValue::TaskRef("c".into()));

        let deps = spec.dependencies();
        assert_eq!(
            deps.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn spec_validation_rejects_unknown_output_task() {
        let spec = WorkflowSpec::new()
            .task("a", TaskSpec::new(noop()))
            .output_task("missing");
        assert!(matches!(spec.validate(), Err(Error::Validation { .. })));
    }

    #[test]
    fn spec_validation_rejects_unknown_dependency() {
        let spec = WorkflowSpec::new().task("a", TaskSpec::new(noop()).requires("ghost"));
        assert!(matches!(spec.validate(), Err(Error::Validation { .. })));
    }

    #[test]
    fn empty_spec_is_valid() {
        assert!(WorkflowSpec::new().validate().is_ok());
    }

    #[test]
    fn workflow_spec_serializes_camel_case() {
        let spec = WorkflowSpec::new()
            .task("a", TaskSpec::new(noop()))
            .output_task("a");
        let json = serde_json::to_value(&spec).unwrap();
        assert!(json.get("outputTask").is_some());
    }
}
