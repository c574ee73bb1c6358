//! The event-emitting APIs: workflows, invocations, and tasks.
//!
//! Everything here mutates state exclusively by appending events to the
//! backend; projections pick the changes up through the cache. The
//! [`TaskApi`] is the engine's dispatch path: it resolves inputs through the
//! expression engine, invokes the right runtime, applies output transforms,
//! and folds the result back into the event log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use weft_core::{InvocationId, TypedValue, WorkflowId};

use crate::backend::EventBackend;
use crate::error::{Error, Result};
use crate::events::{Aggregate, EventData, NewEvent};
use crate::expr::{resolve, resolve_inputs, Scope, ScopeStore};
use crate::invocation::{Invocation, InvocationSpec, TaskInvocation, TaskInvocationStatus};
use crate::metrics::record_task_invocation;
use crate::runtime::{MetaResolver, TaskInvocationSpec, TaskResult};
use crate::stores::{EntityStore, Invocations, Workflows};
use crate::workflow::{ResolvedTask, WorkflowSpec};

/// Default bound on how long a task invocation waits for its parent
/// workflow to become Ready before dispatch.
pub const DEFAULT_AWAIT_WORKFLOW: Duration = Duration::from_secs(10);

/// API over workflow aggregates.
#[derive(Clone)]
pub struct WorkflowApi {
    backend: Arc<dyn EventBackend>,
}

impl WorkflowApi {
    /// Creates the API over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn EventBackend>) -> Self {
        Self { backend }
    }

    /// Submits a workflow definition; it starts in the Parsing state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for structurally invalid specs.
    pub async fn create(&self, spec: WorkflowSpec) -> Result<WorkflowId> {
        spec.validate()?;
        let id = WorkflowId::generate();
        self.backend
            .append(
                &Aggregate::workflow(id),
                NewEvent::new(EventData::WorkflowCreated { spec }),
            )
            .await?;
        Ok(id)
    }

    /// Records successful function resolution; the workflow becomes Ready.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn mark_parsed(
        &self,
        id: WorkflowId,
        tasks: BTreeMap<String, ResolvedTask>,
    ) -> Result<()> {
        self.backend
            .append(
                &Aggregate::workflow(id),
                NewEvent::new(EventData::WorkflowParsed { tasks }),
            )
            .await?;
        Ok(())
    }

    /// Records a parse failure; the workflow becomes Failed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn mark_parse_failed(&self, id: WorkflowId, error: impl Into<String>) -> Result<()> {
        self.backend
            .append(
                &Aggregate::workflow(id),
                NewEvent::new(EventData::WorkflowParseFailed {
                    error: error.into(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Deletes a workflow.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn delete(&self, id: WorkflowId) -> Result<()> {
        self.backend
            .append(
                &Aggregate::workflow(id),
                NewEvent::new(EventData::WorkflowDeleted),
            )
            .await?;
        Ok(())
    }
}

/// API over invocation aggregates.
#[derive(Clone)]
pub struct InvocationApi {
    backend: Arc<dyn EventBackend>,
    workflows: Workflows,
    invocations: Invocations,
}

impl InvocationApi {
    /// Creates the API over a backend and its stores.
    #[must_use]
    pub fn new(backend: Arc<dyn EventBackend>, workflows: Workflows, invocations: Invocations) -> Self {
        Self {
            backend,
            workflows,
            invocations,
        }
    }

    /// Creates an invocation of a Ready workflow, embedding its definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailedPrecondition`] when the workflow is not Ready
    /// and [`Error::NotFound`] when it does not exist.
    pub async fn invoke(&self, spec: InvocationSpec) -> Result<InvocationId> {
        let mut workflow = self.workflows.get(spec.workflow_id).await?;
        if !workflow.is_ready() {
            // The cached entry may predate the parse; re-read before rejecting.
            workflow = self
                .workflows
                .refresh(&Aggregate::workflow(spec.workflow_id))
                .await?;
        }
        if !workflow.is_ready() {
            return Err(Error::failed_precondition(format!(
                "workflow {} is not ready (status: {:?})",
                workflow.id, workflow.status
            )));
        }

        let id = InvocationId::generate();
        let mut event = NewEvent::new(EventData::InvocationCreated {
            spec: spec.clone(),
            workflow: Box::new((*workflow).clone()),
        });
        if let Some(parent_id) = spec.parent_id {
            event = event.with_parent(&Aggregate::invocation(parent_id));
        }

        self.backend
            .append(&Aggregate::invocation(id), event)
            .await?;
        Ok(id)
    }

    /// Cancels a running invocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FailedPrecondition`] when the invocation is already
    /// terminal.
    pub async fn cancel(&self, id: InvocationId) -> Result<()> {
        let invocation = self
            .invocations
            .refresh(&Aggregate::invocation(id))
            .await?;
        if invocation.is_terminal() {
            return Err(Error::failed_precondition(format!(
                "invocation {id} is already terminal"
            )));
        }
        self.backend
            .append(
                &Aggregate::invocation(id),
                NewEvent::new(EventData::InvocationCanceled),
            )
            .await?;
        Ok(())
    }

    /// Completes an invocation with its final output. A no-op when the
    /// invocation is already terminal (completion races are expected).
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn complete(
        &self,
        id: InvocationId,
        output: Option<TypedValue>,
        output_headers: Option<TypedValue>,
    ) -> Result<()> {
        if self
            .invocations
            .refresh(&Aggregate::invocation(id))
            .await?
            .is_terminal()
        {
            tracing::debug!(invocation = %id, "complete skipped: already terminal");
            return Ok(());
        }
        self.backend
            .append(
                &Aggregate::invocation(id),
                NewEvent::new(EventData::InvocationCompleted {
                    output,
                    output_headers,
                }),
            )
            .await?;
        Ok(())
    }

    /// Fails an invocation with a human-readable reason. A no-op when the
    /// invocation is already terminal.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn fail(&self, id: InvocationId, reason: impl Into<String>) -> Result<()> {
        if self
            .invocations
            .refresh(&Aggregate::invocation(id))
            .await?
            .is_terminal()
        {
            tracing::debug!(invocation = %id, "fail skipped: already terminal");
            return Ok(());
        }
        self.backend
            .append(
                &Aggregate::invocation(id),
                NewEvent::new(EventData::InvocationFailed {
                    error: reason.into(),
                }),
            )
            .await?;
        Ok(())
    }
}

/// A user hook applied to a finished task invocation before its completion
/// event is appended.
pub type PostTransformer = Arc<dyn Fn(&mut TaskInvocation) -> Result<()> + Send + Sync>;

/// Options recognized by [`TaskApi::invoke`].
#[derive(Clone, Default)]
pub struct InvokeOptions {
    /// Absolute deadline for the runtime call. Combined with the task
    /// spec's own timeout; the earlier bound wins.
    pub deadline: Option<DateTime<Utc>>,
    /// Bound on waiting for the parent workflow to become Ready. Defaults
    /// to [`DEFAULT_AWAIT_WORKFLOW`].
    pub await_workflow: Option<Duration>,
    /// User hook on the finished task invocation.
    pub post_transformer: Option<PostTransformer>,
}

impl std::fmt::Debug for InvokeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeOptions")
            .field("deadline", &self.deadline)
            .field("await_workflow", &self.await_workflow)
            .field("post_transformer", &self.post_transformer.is_some())
            .finish()
    }
}

/// API executing one task run end to end.
#[derive(Clone)]
pub struct TaskApi {
    backend: Arc<dyn EventBackend>,
    workflows: Workflows,
    scopes: Arc<ScopeStore>,
    resolver: MetaResolver,
}

impl TaskApi {
    /// Creates the API.
    #[must_use]
    pub fn new(
        backend: Arc<dyn EventBackend>,
        workflows: Workflows,
        scopes: Arc<ScopeStore>,
        resolver: MetaResolver,
    ) -> Self {
        Self {
            backend,
            workflows,
            scopes,
            resolver,
        }
    }

    /// Non-blocking pre-warm hint: tells the task's runtime a call is
    /// expected near `expected_at`. Purely advisory — failures are logged,
    /// never propagated.
    pub async fn prepare(&self, invocation: &Invocation, task_id: &str, expected_at: DateTime<Utc>) {
        let Some(spec) = invocation
            .workflow
            .as_ref()
            .and_then(|w| w.task_spec(task_id))
        else {
            tracing::warn!(invocation = %invocation.id, task = task_id, "prepare: unknown task");
            return;
        };

        let Some(runtime) = self.resolver.runtime(&spec.function.runtime) else {
            tracing::warn!(
                invocation = %invocation.id,
                task = task_id,
                runtime = %spec.function.runtime,
                "prepare: unknown runtime"
            );
            return;
        };

        if let Err(error) = runtime.notify(&spec.function, expected_at).await {
            tracing::warn!(
                invocation = %invocation.id,
                task = task_id,
                %error,
                "prepare failed"
            );
        }
    }

    /// Executes one task run: validate, resolve inputs, invoke the runtime,
    /// transform outputs, and emit the completion event.
    ///
    /// # Errors
    ///
    /// - [`Error::FailedPrecondition`] for an invalid spec (unknown task,
    ///   absent workflow)
    /// - [`Error::Validation`] for an unknown runtime
    /// - expression errors from input resolution
    /// - transport errors from the backend or runtime
    ///
    /// Application failures and elapsed deadlines are **not** errors: they
    /// append `TaskFailed` and return the failed task invocation.
    pub async fn invoke(
        &self,
        invocation: &Invocation,
        task_id: &str,
        options: InvokeOptions,
    ) -> Result<TaskInvocation> {
        let workflow = invocation
            .workflow
            .as_ref()
            .ok_or_else(|| Error::failed_precondition("invocation has no embedded workflow"))?;
        let task_spec = workflow.task_spec(task_id).ok_or_else(|| {
            Error::failed_precondition(format!("no task '{task_id}' in workflow {}", workflow.id))
        })?;
        let runtime = self
            .resolver
            .runtime(&task_spec.function.runtime)
            .ok_or_else(|| {
                Error::validation(format!("unknown runtime '{}'", task_spec.function.runtime))
            })?;

        // Bounded wait for the workflow to reach Ready. The embedded
        // snapshot is normally Ready already; this covers dispatch racing a
        // slow parse.
        if !workflow.is_ready() {
            let bound = options.await_workflow.unwrap_or(DEFAULT_AWAIT_WORKFLOW);
            self.await_workflow_ready(workflow.id, bound).await?;
        }

        // Build the scope (inheriting the parent's by id) and resolve the
        // inputs in priority order.
        let mut scope = Scope::from_invocation(invocation);
        let inputs = resolve_inputs(&self.scopes, &mut scope, task_id, &task_spec.inputs)?;
        self.scopes.set(scope.clone());

        let aggregate = Aggregate::invocation(invocation.id);
        self.backend
            .append(
                &aggregate,
                NewEvent::new(EventData::TaskStarted {
                    task_id: task_id.to_string(),
                    fn_ref: task_spec.function.clone(),
                    inputs: inputs.clone(),
                }),
            )
            .await?;

        let deadline = effective_deadline(options.deadline, task_spec.timeout);
        let runtime_spec = TaskInvocationSpec {
            invocation_id: invocation.id,
            task_id: task_id.to_string(),
            fn_ref: task_spec.function.clone(),
            inputs: inputs.clone(),
            deadline,
        };

        let mut task = TaskInvocation::scheduled(task_id, task_spec.function.clone());
        task.inputs = runtime_spec.inputs.clone();
        task.started_at = Some(Utc::now());

        let started = std::time::Instant::now();
        let result = match deadline {
            Some(deadline) => {
                let remaining = (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                match tokio::time::timeout(remaining, runtime.invoke(&runtime_spec)).await {
                    Ok(result) => result?,
                    Err(_) => TaskResult::failed("deadline exceeded"),
                }
            }
            None => runtime.invoke(&runtime_spec).await?,
        };

        match result {
            TaskResult::Succeeded {
                output,
                output_headers,
            } => {
                task.status = TaskInvocationStatus::Succeeded;
                task.output = output;
                task.output_headers = output_headers;
                self.transform_outputs(invocation, &mut scope, &mut task)?;
            }
            TaskResult::Failed { error } => {
                task.status = TaskInvocationStatus::Failed;
                task.error = Some(error);
            }
        }

        if let Some(transformer) = &options.post_transformer {
            transformer(&mut task)?;
        }
        task.finished_at = Some(Utc::now());

        record_task_invocation(
            &task_spec.function.runtime,
            if task.is_successful() { "succeeded" } else { "failed" },
            started.elapsed(),
        );

        let completion = if task.is_successful() {
            EventData::TaskSucceeded {
                task_id: task_id.to_string(),
                output: task.output.clone(),
                output_headers: task.output_headers.clone(),
            }
        } else {
            EventData::TaskFailed {
                task_id: task_id.to_string(),
                error: task
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string()),
            }
        };
        self.backend
            .append(&aggregate, NewEvent::new(completion))
            .await?;

        Ok(task)
    }

    /// Replaces the runtime's outputs with the task spec's declared output
    /// transforms, resolved against a scope that includes the actual
    /// output. Idempotent: a second application resolves to the same value.
    fn transform_outputs(
        &self,
        invocation: &Invocation,
        scope: &mut Scope,
        task: &mut TaskInvocation,
    ) -> Result<()> {
        let Some(task_spec) = invocation
            .workflow
            .as_ref()
            .and_then(|w| w.task_spec(&task.task_id))
        else {
            return Ok(());
        };

        if let Some(declared) = &task_spec.output {
            if let Some(actual) = task.output.as_ref().and_then(|o| o.to_json().ok()) {
                scope.set_task_output(&task.task_id, actual);
            }
            task.output = Some(resolve(&self.scopes, scope, &task.task_id, declared)?);
        }

        if let Some(declared) = &task_spec.output_headers {
            if let Some(actual) = task
                .output_headers
                .as_ref()
                .and_then(|o| o.to_json().ok())
            {
                scope.set_task_output_headers(&task.task_id, actual);
            }
            task.output_headers =
                Some(resolve(&self.scopes, scope, &task.task_id, declared)?);
        }

        self.scopes.set(scope.clone());
        Ok(())
    }

    async fn await_workflow_ready(&self, id: WorkflowId, bound: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + bound;
        loop {
            if let Ok(workflow) = self.workflows.get(id).await {
                if workflow.is_ready() {
                    return Ok(());
                }
                if workflow.error.is_some() {
                    return Err(Error::failed_precondition(format!(
                        "workflow {id} failed to parse"
                    )));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::failed_precondition(format!(
                    "workflow {id} did not become ready in time"
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl std::fmt::Debug for TaskApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskApi").finish_non_exhaustive()
    }
}

fn effective_deadline(
    explicit: Option<DateTime<Utc>>,
    timeout: Option<Duration>,
) -> Option<DateTime<Utc>> {
    let from_timeout = timeout
        .and_then(|t| chrono::Duration::from_std(t).ok())
        .map(|t| Utc::now() + t);
    match (explicit, from_timeout) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::cache::EntityCache;
    use crate::projector::{InvocationProjector, WorkflowProjector};
    use crate::runtime::native::NativeRuntime;
    use crate::runtime::Runtime;
    use crate::workflow::TaskSpec;
    use weft_core::FunctionRef;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        workflow_api: WorkflowApi,
        invocation_api: InvocationApi,
        task_api: TaskApi,
        invocations: Invocations,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let dyn_backend: Arc<dyn EventBackend> = backend.clone();

        let workflow_cache = Arc::new(EntityCache::new(
            dyn_backend.clone(),
            WorkflowProjector,
            64,
            16,
        ));
        let invocation_cache = Arc::new(EntityCache::new(
            dyn_backend.clone(),
            InvocationProjector,
            64,
            16,
        ));
        let workflows = Workflows::new(workflow_cache, dyn_backend.clone());
        let invocations = Invocations::new(invocation_cache, dyn_backend.clone());

        let native: Arc<dyn Runtime> = Arc::new(NativeRuntime::with_defaults());
        let resolver = MetaResolver::new(BTreeMap::from([("native".to_string(), native)]));

        Fixture {
            backend,
            workflow_api: WorkflowApi::new(dyn_backend.clone()),
            invocation_api: InvocationApi::new(
                dyn_backend.clone(),
                workflows.clone(),
                invocations.clone(),
            ),
            task_api: TaskApi::new(
                dyn_backend,
                workflows,
                Arc::new(ScopeStore::new()),
                resolver,
            ),
            invocations,
        }
    }

    async fn ready_workflow(fx: &Fixture, spec: WorkflowSpec) -> WorkflowId {
        let id = fx.workflow_api.create(spec).await.unwrap();
        fx.workflow_api
            .mark_parsed(id, BTreeMap::new())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn invoke_runs_task_and_appends_events() {
        let fx = fixture();
        let workflow_id = ready_workflow(
            &fx,
            WorkflowSpec::new().task("a", TaskSpec::new(FunctionRef::new("native", "noop"))),
        )
        .await;

        let invocation_id = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await
            .unwrap();
        let invocation = fx.invocations.get(invocation_id).await.unwrap();

        let task = fx
            .task_api
            .invoke(&invocation, "a", InvokeOptions::default())
            .await
            .unwrap();
        assert!(task.is_successful());
        assert_eq!(task.output, Some(TypedValue::string("ok")));

        let events = fx
            .backend
            .get(&Aggregate::invocation(invocation_id))
            .await
            .unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.data.name()).collect();
        assert_eq!(
            names,
            vec!["invocation_created", "task_started", "task_succeeded"]
        );
    }

    #[tokio::test]
    async fn application_failure_appends_task_failed() {
        let fx = fixture();
        let workflow_id = ready_workflow(
            &fx,
            WorkflowSpec::new().task(
                "a",
                TaskSpec::new(FunctionRef::new("native", "fail"))
                    .input("message", TypedValue::string("boom")),
            ),
        )
        .await;

        let invocation_id = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await
            .unwrap();
        let invocation = fx.invocations.get(invocation_id).await.unwrap();

        let task = fx
            .task_api
            .invoke(&invocation, "a", InvokeOptions::default())
            .await
            .unwrap();
        assert!(!task.is_successful());
        assert_eq!(task.error.as_deref(), Some("boom"));

        let events = fx
            .backend
            .get(&Aggregate::invocation(invocation_id))
            .await
            .unwrap();
        assert_eq!(events.last().unwrap().data.name(), "task_failed");
    }

    #[tokio::test]
    async fn task_deadline_fails_with_deadline_exceeded() {
        let fx = fixture();
        let workflow_id = ready_workflow(
            &fx,
            WorkflowSpec::new().task(
                "a",
                TaskSpec::new(FunctionRef::new("native", "sleep"))
                    .input("duration", TypedValue::Int(2000))
                    .timeout(Duration::from_millis(50)),
            ),
        )
        .await;

        let invocation_id = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await
            .unwrap();
        let invocation = fx.invocations.get(invocation_id).await.unwrap();

        let task = fx
            .task_api
            .invoke(&invocation, "a", InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(task.error.as_deref(), Some("deadline exceeded"));
    }

    #[tokio::test]
    async fn output_transform_replaces_runtime_output() {
        let fx = fixture();
        let workflow_id = ready_workflow(
            &fx,
            WorkflowSpec::new().task(
                "a",
                TaskSpec::new(FunctionRef::new("native", "noop"))
                    .input("greeting", TypedValue::string("hello"))
                    .output(TypedValue::expr("$.Tasks.a.Inputs.greeting").unwrap()),
            ),
        )
        .await;

        let invocation_id = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await
            .unwrap();
        let invocation = fx.invocations.get(invocation_id).await.unwrap();

        let task = fx
            .task_api
            .invoke(&invocation, "a", InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(task.output, Some(TypedValue::string("hello")));
    }

    #[tokio::test]
    async fn output_transform_is_idempotent() {
        let fx = fixture();
        let workflow_id = ready_workflow(
            &fx,
            WorkflowSpec::new().task(
                "a",
                TaskSpec::new(FunctionRef::new("native", "noop"))
                    .output(TypedValue::expr("$.Tasks.a.Output").unwrap()),
            ),
        )
        .await;

        let invocation_id = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await
            .unwrap();
        let invocation = fx.invocations.get(invocation_id).await.unwrap();

        let mut scope = Scope::from_invocation(&invocation);
        let mut task = TaskInvocation::scheduled("a", FunctionRef::new("native", "noop"));
        task.status = TaskInvocationStatus::Succeeded;
        task.output = Some(TypedValue::string("raw"));

        fx.task_api
            .transform_outputs(&invocation, &mut scope, &mut task)
            .unwrap();
        let once = task.clone();
        fx.task_api
            .transform_outputs(&invocation, &mut scope, &mut task)
            .unwrap();
        assert_eq!(task, once);
    }

    #[tokio::test]
    async fn unknown_task_is_a_precondition_failure() {
        let fx = fixture();
        let workflow_id = ready_workflow(
            &fx,
            WorkflowSpec::new().task("a", TaskSpec::new(FunctionRef::new("native", "noop"))),
        )
        .await;

        let invocation_id = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await
            .unwrap();
        let invocation = fx.invocations.get(invocation_id).await.unwrap();

        let result = fx
            .task_api
            .invoke(&invocation, "ghost", InvokeOptions::default())
            .await;
        assert!(matches!(result, Err(Error::FailedPrecondition { .. })));
    }

    #[tokio::test]
    async fn invoking_unready_workflow_is_rejected() {
        let fx = fixture();
        let workflow_id = fx
            .workflow_api
            .create(WorkflowSpec::new().task(
                "a",
                TaskSpec::new(FunctionRef::new("native", "noop")),
            ))
            .await
            .unwrap();

        let result = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await;
        assert!(matches!(result, Err(Error::FailedPrecondition { .. })));
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_invocations() {
        let fx = fixture();
        let workflow_id = ready_workflow(&fx, WorkflowSpec::new()).await;
        let invocation_id = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await
            .unwrap();

        fx.invocation_api
            .complete(invocation_id, None, None)
            .await
            .unwrap();
        let result = fx.invocation_api.cancel(invocation_id).await;
        assert!(matches!(result, Err(Error::FailedPrecondition { .. })));
    }

    #[tokio::test]
    async fn fail_is_idempotent_on_terminal_invocations() {
        let fx = fixture();
        let workflow_id = ready_workflow(&fx, WorkflowSpec::new()).await;
        let invocation_id = fx
            .invocation_api
            .invoke(InvocationSpec::new(workflow_id))
            .await
            .unwrap();

        fx.invocation_api
            .fail(invocation_id, "first failure")
            .await
            .unwrap();
        fx.invocation_api
            .fail(invocation_id, "second failure")
            .await
            .unwrap();

        let invocation = fx.invocations.get(invocation_id).await.unwrap();
        assert_eq!(invocation.error.as_deref(), Some("first failure"));
    }

    #[test]
    fn effective_deadline_takes_the_earlier_bound() {
        let now = Utc::now();
        let explicit = now + chrono::Duration::seconds(5);
        let combined = effective_deadline(Some(explicit), Some(Duration::from_secs(60)));
        assert_eq!(combined, Some(explicit));

        let timeout_only = effective_deadline(None, Some(Duration::from_secs(60)));
        assert!(timeout_only.is_some());
        assert_eq!(effective_deadline(None, None), None);
    }
}
