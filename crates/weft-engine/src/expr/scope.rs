//! Invocation scopes: the data expressions evaluate against.
//!
//! A scope is a JSON tree with three root bindings — `Workflow`,
//! `Invocation`, and `Tasks` — plus a `Parent` pass-through that chains to
//! the parent invocation's scope on sub-workflows. Scopes are kept in a
//! process-wide [`ScopeStore`] keyed by invocation id; parents are
//! referenced by id rather than by pointer so a terminal child scope can be
//! reclaimed without touching its parent. The store is not durable: scopes
//! are rebuilt on demand from projected invocations.

use dashmap::DashMap;

use serde_json::{json, Value};

use crate::invocation::Invocation;

/// The expression-evaluation context of one invocation.
#[derive(Debug, Clone)]
pub struct Scope {
    /// The invocation this scope belongs to.
    pub invocation_id: String,
    /// The parent invocation's id, when this is a sub-workflow scope.
    pub parent_id: Option<String>,
    root: Value,
}

impl Scope {
    /// Builds a scope from a projected invocation.
    #[must_use]
    pub fn from_invocation(invocation: &Invocation) -> Self {
        let workflow = invocation.workflow.as_ref().map_or_else(
            || json!({}),
            |workflow| {
                json!({
                    "Id": workflow.id.to_string(),
                    "OutputTask": workflow.spec.output_task,
                })
            },
        );

        let inputs: serde_json::Map<String, Value> = invocation
            .spec
            .inputs
            .iter()
            .filter_map(|(name, value)| Some((name.clone(), value.to_json().ok()?)))
            .collect();

        let tasks: serde_json::Map<String, Value> = invocation
            .tasks
            .iter()
            .map(|(task_id, task)| {
                let inputs: serde_json::Map<String, Value> = task
                    .inputs
                    .iter()
                    .filter_map(|(name, value)| Some((name.clone(), value.to_json().ok()?)))
                    .collect();
                let entry = json!({
                    "Inputs": Value::Object(inputs),
                    "Output": task.output.as_ref().and_then(|o| o.to_json().ok()),
                    "OutputHeaders": task
                        .output_headers
                        .as_ref()
                        .and_then(|o| o.to_json().ok()),
                });
                (task_id.clone(), entry)
            })
            .collect();

        Self {
            invocation_id: invocation.id.to_string(),
            parent_id: invocation.spec.parent_id.map(|id| id.to_string()),
            root: json!({
                "Workflow": workflow,
                "Invocation": {
                    "Id": invocation.id.to_string(),
                    "Inputs": Value::Object(inputs),
                    "ParentId": invocation.spec.parent_id.map(|id| id.to_string()),
                },
                "Tasks": Value::Object(tasks),
            }),
        }
    }

    /// Returns the root JSON tree.
    #[must_use]
    pub const fn root(&self) -> &Value {
        &self.root
    }

    fn task_entry(&mut self, task_id: &str) -> Option<&mut serde_json::Map<String, Value>> {
        self.root
            .as_object_mut()?
            .entry("Tasks")
            .or_insert_with(|| json!({}))
            .as_object_mut()?
            .entry(task_id)
            .or_insert_with(|| json!({"Inputs": {}, "Output": null, "OutputHeaders": null}))
            .as_object_mut()
    }

    /// Records a resolved input so later expressions can reference it.
    pub fn set_task_input(&mut self, task_id: &str, name: &str, value: Value) {
        let Some(entry) = self.task_entry(task_id) else {
            return;
        };
        if let Some(inputs) = entry
            .entry("Inputs")
            .or_insert_with(|| json!({}))
            .as_object_mut()
        {
            inputs.insert(name.to_string(), value);
        }
    }

    /// Records a task's actual output, used by output transforms.
    pub fn set_task_output(&mut self, task_id: &str, output: Value) {
        if let Some(entry) = self.task_entry(task_id) {
            entry.insert("Output".to_string(), output);
        }
    }

    /// Records a task's actual output headers.
    pub fn set_task_output_headers(&mut self, task_id: &str, output_headers: Value) {
        if let Some(entry) = self.task_entry(task_id) {
            entry.insert("OutputHeaders".to_string(), output_headers);
        }
    }
}

/// Process-wide registry of invocation scopes.
///
/// Concurrent-safe; readers are wait-free when the entry is present.
#[derive(Debug, Default)]
pub struct ScopeStore {
    scopes: DashMap<String, Scope>,
}

impl ScopeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a clone of the scope for an invocation id.
    #[must_use]
    pub fn get(&self, invocation_id: &str) -> Option<Scope> {
        self.scopes.get(invocation_id).map(|s| s.clone())
    }

    /// Stores (or replaces) a scope.
    pub fn set(&self, scope: Scope) {
        self.scopes.insert(scope.invocation_id.clone(), scope);
    }

    /// Drops the scope of a terminal invocation.
    pub fn release(&self, invocation_id: &str) {
        self.scopes.remove(invocation_id);
    }

    /// Returns the number of live scopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Returns true if no scopes are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{InvocationSpec, InvocationStatus};
    use std::collections::BTreeMap;
    use weft_core::{InvocationId, TypedValue, WorkflowId};

    fn bare_invocation() -> Invocation {
        Invocation {
            id: InvocationId::generate(),
            workflow: None,
            spec: InvocationSpec::new(WorkflowId::generate())
                .input("q", TypedValue::string("hello")),
            status: InvocationStatus::Scheduled,
            tasks: BTreeMap::new(),
            output: None,
            output_headers: None,
            error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            version: 1,
        }
    }

    #[test]
    fn scope_exposes_invocation_inputs() {
        let scope = Scope::from_invocation(&bare_invocation());
        assert_eq!(
            scope.root()["Invocation"]["Inputs"]["q"],
            Value::String("hello".into())
        );
    }

    #[test]
    fn task_updates_land_in_the_tree() {
        let mut scope = Scope::from_invocation(&bare_invocation());
        scope.set_task_input("a", "x", json!(1));
        scope.set_task_output("a", json!("done"));

        assert_eq!(scope.root()["Tasks"]["a"]["Inputs"]["x"], json!(1));
        assert_eq!(scope.root()["Tasks"]["a"]["Output"], json!("done"));
    }

    #[test]
    fn store_set_get_release() {
        let store = ScopeStore::new();
        let scope = Scope::from_invocation(&bare_invocation());
        let id = scope.invocation_id.clone();

        store.set(scope);
        assert!(store.get(&id).is_some());

        store.release(&id);
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }
}
