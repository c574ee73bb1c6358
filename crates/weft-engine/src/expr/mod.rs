//! Expression resolution.
//!
//! Resolution takes a [`Scope`], the id of the task being resolved, and a
//! typed value. Expressions and task references evaluate against the scope;
//! maps and arrays resolve element-wise; every other value returns verbatim.
//! Evaluation is pure and deterministic.
//!
//! Root bindings: `$.Workflow`, `$.Invocation`, `$.Tasks[id].Inputs`,
//! `$.Tasks[id].Output`, and `$.Parent...` which passes through to the
//! parent invocation's scope (sub-workflows). All resolution errors are
//! non-retryable and fail the task they belong to.

pub mod scope;

pub use scope::{Scope, ScopeStore};

use std::collections::BTreeMap;

use serde_json::Value;

use weft_core::value::prioritized;
use weft_core::{Expression, Inputs, Segment, TypedValue};

use crate::error::{Error, Result};

const ROOT_BINDINGS: [&str; 4] = ["Workflow", "Invocation", "Tasks", "Parent"];

/// Resolves a typed value against a scope.
///
/// # Errors
///
/// - [`Error::UnknownBinding`] when an expression's root binding is not one
///   of `Workflow`, `Invocation`, `Tasks`, `Parent`
/// - [`Error::ExpressionEval`] when a selector path does not exist in the
///   scope, or a `Parent` binding is used without a parent scope
pub fn resolve(
    store: &ScopeStore,
    scope: &Scope,
    task_id: &str,
    value: &TypedValue,
) -> Result<TypedValue> {
    match value {
        TypedValue::Expression(expression) => {
            let json = eval(store, scope, expression)?;
            Ok(TypedValue::from_json(&json))
        }
        TypedValue::TaskRef(referenced) => {
            let expression = Expression::parse(format!("$.Tasks[\"{referenced}\"].Output"))?;
            let json = eval(store, scope, &expression)?;
            Ok(TypedValue::from_json(&json))
        }
        TypedValue::Array(items) => items
            .iter()
            .map(|item| resolve(store, scope, task_id, item))
            .collect::<Result<Vec<_>>>()
            .map(TypedValue::Array),
        TypedValue::Map(entries) => entries
            .iter()
            .map(|(key, entry)| Ok((key.clone(), resolve(store, scope, task_id, entry)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(TypedValue::Map),
        other => Ok(other.clone()),
    }
}

/// Resolves a task's inputs in priority order, writing each resolved value
/// back into the scope so later expressions can reference it.
///
/// # Errors
///
/// Propagates the first resolution failure, naming the input field.
pub fn resolve_inputs(
    store: &ScopeStore,
    scope: &mut Scope,
    task_id: &str,
    inputs: &Inputs,
) -> Result<BTreeMap<String, TypedValue>> {
    let mut resolved = BTreeMap::new();
    for (name, input) in prioritized(inputs) {
        let value = resolve(store, scope, task_id, &input.value).map_err(|error| {
            Error::ExpressionEval {
                expression: format!("input '{name}' of task '{task_id}'"),
                message: error.to_string(),
            }
        })?;
        if let Ok(json) = value.to_json() {
            scope.set_task_input(task_id, name, json);
        }
        resolved.insert(name.clone(), value);
    }
    Ok(resolved)
}

fn eval(store: &ScopeStore, scope: &Scope, expression: &Expression) -> Result<Value> {
    let segments = expression.selector.segments();

    // Walk Parent bindings first: each one hops to the parent scope by id.
    let mut current_scope = scope.clone();
    let mut remaining = segments;
    while let Some((Segment::Field(root), rest)) = remaining.split_first() {
        if root != "Parent" {
            break;
        }
        let parent_id = current_scope.parent_id.clone().ok_or_else(|| {
            Error::ExpressionEval {
                expression: expression.source.clone(),
                message: format!("scope '{}' has no parent", current_scope.invocation_id),
            }
        })?;
        current_scope = store.get(&parent_id).ok_or_else(|| Error::ExpressionEval {
            expression: expression.source.clone(),
            message: format!("parent scope '{parent_id}' is not available"),
        })?;
        remaining = rest;
    }

    if let Some(Segment::Field(root)) = remaining.first() {
        if !ROOT_BINDINGS.contains(&root.as_str()) {
            return Err(Error::UnknownBinding {
                binding: root.clone(),
                expression: expression.source.clone(),
            });
        }
    }

    let mut value = current_scope.root();
    for segment in remaining {
        value = match (segment, value) {
            (Segment::Field(name), Value::Object(map)) => {
                map.get(name).ok_or_else(|| Error::ExpressionEval {
                    expression: expression.source.clone(),
                    message: format!("no value at '{name}'"),
                })?
            }
            (Segment::Index(index), Value::Array(items)) => {
                items.get(*index).ok_or_else(|| Error::ExpressionEval {
                    expression: expression.source.clone(),
                    message: format!("index {index} out of bounds"),
                })?
            }
            (segment, _) => {
                return Err(Error::ExpressionEval {
                    expression: expression.source.clone(),
                    message: format!("cannot navigate '{segment}' into a non-container value"),
                })
            }
        };
    }

    Ok(value.clone())
}
