//! The function runtime contract.
//!
//! A runtime adapts one kind of function platform to the engine. Every
//! runtime can `invoke`; runtimes may additionally support `notify`
//! (advisory pre-warm) and `resolve` (validate a reference at
//! workflow-parse time).
//!
//! Runtimes must distinguish transport failures from application failures:
//! a transport failure is an `Err` and propagates as a retryable engine
//! error, while an application failure is `Ok(TaskResult::Failed { .. })`
//! and becomes a `TaskFailed` event.

pub mod native;
pub mod subflow;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use weft_core::{FunctionRef, InvocationId, TypedValue};

use crate::error::{Error, Result};

/// Everything a runtime needs to execute one task run.
#[derive(Debug, Clone)]
pub struct TaskInvocationSpec {
    /// The invocation this run belongs to.
    pub invocation_id: InvocationId,
    /// The task id within the invocation.
    pub task_id: String,
    /// The function to invoke.
    pub fn_ref: FunctionRef,
    /// Inputs after expression resolution.
    pub inputs: BTreeMap<String, TypedValue>,
    /// Absolute deadline for this runtime call.
    pub deadline: Option<DateTime<Utc>>,
}

/// The application-level outcome of a runtime call.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// The function completed.
    Succeeded {
        /// The function's output.
        output: Option<TypedValue>,
        /// The function's output headers.
        output_headers: Option<TypedValue>,
    },
    /// The function failed; this is not an engine error.
    Failed {
        /// Human-readable failure message.
        error: String,
    },
}

impl TaskResult {
    /// Creates a success result with an output and no headers.
    #[must_use]
    pub const fn succeeded(output: Option<TypedValue>) -> Self {
        Self::Succeeded {
            output,
            output_headers: None,
        }
    }

    /// Creates a failure result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    /// Returns true if the call succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// A function runtime adapter.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// The runtime name the engine dispatches on (`fn_ref.runtime`).
    fn name(&self) -> &'static str;

    /// Executes a task run to completion, honoring `spec.deadline`.
    ///
    /// # Errors
    ///
    /// Only transport-level failures are errors; application failures are
    /// `Ok(TaskResult::Failed { .. })`.
    async fn invoke(&self, spec: &TaskInvocationSpec) -> Result<TaskResult>;

    /// Advisory pre-warm: a call to `fn_ref` is expected near `expected_at`.
    ///
    /// The default implementation does nothing.
    ///
    /// # Errors
    ///
    /// Implementations may fail; callers log and never propagate.
    async fn notify(&self, fn_ref: &FunctionRef, expected_at: DateTime<Utc>) -> Result<()> {
        let _ = (fn_ref, expected_at);
        Ok(())
    }

    /// Validates a function reference, returning its canonical id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the function does not exist.
    async fn resolve(&self, fn_ref: &FunctionRef) -> Result<String>;
}

/// Merges the `resolve` providers of multiple runtimes, selecting by the
/// reference's `runtime` discriminator.
#[derive(Clone)]
pub struct MetaResolver {
    providers: BTreeMap<String, Arc<dyn Runtime>>,
}

impl MetaResolver {
    /// Creates a resolver over a set of named runtimes.
    #[must_use]
    pub fn new(providers: BTreeMap<String, Arc<dyn Runtime>>) -> Self {
        Self { providers }
    }

    /// Returns the runtime registered under `name`.
    #[must_use]
    pub fn runtime(&self, name: &str) -> Option<Arc<dyn Runtime>> {
        self.providers.get(name).cloned()
    }

    /// Resolves a reference through the runtime it names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an unknown runtime and propagates
    /// the runtime's own resolution failure otherwise.
    pub async fn resolve(&self, fn_ref: &FunctionRef) -> Result<String> {
        let runtime = self.providers.get(&fn_ref.runtime).ok_or_else(|| {
            Error::validation(format!("unknown runtime '{}'", fn_ref.runtime))
        })?;
        runtime.resolve(fn_ref).await
    }
}

impl std::fmt::Debug for MetaResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaResolver")
            .field("runtimes", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
