//! The built-in native runtime.
//!
//! Runs a small set of in-process functions. Used by tests, local mode, and
//! as glue inside larger workflows (`noop`, `echo`, `sleep`, `fail`,
//! `compose`). Pre-warm notifications are recorded so callers can observe
//! tap behavior.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use weft_core::{FunctionRef, TypedValue};

use super::{Runtime, TaskInvocationSpec, TaskResult};
use crate::error::{Error, Result};

/// The runtime name native function references dispatch on.
pub const RUNTIME_NATIVE: &str = "native";

/// An in-process function.
#[async_trait]
pub trait NativeFunction: Send + Sync {
    /// Runs the function against resolved inputs.
    ///
    /// # Errors
    ///
    /// Transport-level failures only; application failures are
    /// `Ok(TaskResult::Failed { .. })`.
    async fn run(&self, inputs: &BTreeMap<String, TypedValue>) -> Result<TaskResult>;
}

/// The native runtime: a registry of in-process functions.
pub struct NativeRuntime {
    functions: BTreeMap<String, Arc<dyn NativeFunction>>,
    taps: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl NativeRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            functions: BTreeMap::new(),
            taps: Mutex::new(Vec::new()),
        }
    }

    /// Creates a runtime with the built-in functions registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut runtime = Self::new();
        runtime.register("noop", Arc::new(Noop));
        runtime.register("echo", Arc::new(Echo));
        runtime.register("sleep", Arc::new(Sleep));
        runtime.register("fail", Arc::new(Fail));
        runtime.register("compose", Arc::new(Compose));
        runtime
    }

    /// Registers a function under a name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn NativeFunction>) {
        self.functions.insert(name.into(), function);
    }

    /// Returns the pre-warm notifications received so far, in order.
    #[must_use]
    pub fn taps(&self) -> Vec<(String, DateTime<Utc>)> {
        self.taps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for NativeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRuntime")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Runtime for NativeRuntime {
    fn name(&self) -> &'static str {
        RUNTIME_NATIVE
    }

    async fn invoke(&self, spec: &TaskInvocationSpec) -> Result<TaskResult> {
        let function = self
            .functions
            .get(&spec.fn_ref.id)
            .ok_or_else(|| Error::not_found(format!("native function '{}'", spec.fn_ref.id)))?
            .clone();

        tracing::debug!(
            invocation = %spec.invocation_id,
            task = %spec.task_id,
            function = %spec.fn_ref,
            "invoking native function"
        );
        function.run(&spec.inputs).await
    }

    async fn notify(&self, fn_ref: &FunctionRef, expected_at: DateTime<Utc>) -> Result<()> {
        tracing::debug!(function = %fn_ref, %expected_at, "native pre-warm tap");
        self.taps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((fn_ref.id.clone(), expected_at));
        Ok(())
    }

    async fn resolve(&self, fn_ref: &FunctionRef) -> Result<String> {
        if self.functions.contains_key(&fn_ref.id) {
            Ok(fn_ref.id.clone())
        } else {
            Err(Error::not_found(format!(
                "native function '{}'",
                fn_ref.id
            )))
        }
    }
}

/// Succeeds immediately with the output `"ok"`.
struct Noop;

#[async_trait]
impl NativeFunction for Noop {
    async fn run(&self, _inputs: &BTreeMap<String, TypedValue>) -> Result<TaskResult> {
        Ok(TaskResult::succeeded(Some(TypedValue::string("ok"))))
    }
}

/// Returns its `value` input unchanged.
struct Echo;

#[async_trait]
impl NativeFunction for Echo {
    async fn run(&self, inputs: &BTreeMap<String, TypedValue>) -> Result<TaskResult> {
        Ok(TaskResult::succeeded(Some(
            inputs.get("value").cloned().unwrap_or(TypedValue::Null),
        )))
    }
}

/// Sleeps for `duration` milliseconds (default 100), then succeeds.
struct Sleep;

#[async_trait]
impl NativeFunction for Sleep {
    async fn run(&self, inputs: &BTreeMap<String, TypedValue>) -> Result<TaskResult> {
        let millis = match inputs.get("duration") {
            Some(TypedValue::Int(ms)) => u64::try_from(*ms).unwrap_or(0),
            _ => 100,
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(TaskResult::succeeded(Some(TypedValue::string("done"))))
    }
}

/// Fails with its `message` input (application failure, not an error).
struct Fail;

#[async_trait]
impl NativeFunction for Fail {
    async fn run(&self, inputs: &BTreeMap<String, TypedValue>) -> Result<TaskResult> {
        let message = inputs
            .get("message")
            .and_then(|v| v.as_str().map(ToString::to_string))
            .unwrap_or_else(|| "fail function invoked".to_string());
        Ok(TaskResult::failed(message))
    }
}

/// Composes its inputs: none -> null, one -> that value, many -> a map.
struct Compose;

#[async_trait]
impl NativeFunction for Compose {
    async fn run(&self, inputs: &BTreeMap<String, TypedValue>) -> Result<TaskResult> {
        let output = match inputs.len() {
            0 => TypedValue::Null,
            1 => inputs.values().next().cloned().unwrap_or(TypedValue::Null),
            _ => TypedValue::Map(
                inputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        };
        Ok(TaskResult::succeeded(Some(output)))
    }
}
