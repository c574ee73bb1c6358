//! Engine assembly: backend, caches, stores, APIs, runtimes, and the two
//! control domains wired together.
//!
//! Data flows in a loop: clients append events to the backend; the caches
//! subscribe and fold projections; each projection update notifies the
//! stores' subscribers; the meta-controllers route notifications to
//! per-entity controllers; controllers consult the scheduler and submit
//! jobs into the executors; the jobs call the task API, which appends new
//! events to the backend — and the cycle repeats until every invocation is
//! terminal.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use weft_core::InvocationId;

use crate::api::{InvocationApi, TaskApi, WorkflowApi};
use crate::backend::EventBackend;
use crate::cache::EntityCache;
use crate::config::EngineConfig;
use crate::controller::invocation::{InvocationControllerDeps, InvocationMetaController};
use crate::controller::workflow::{WorkflowControllerDeps, WorkflowMetaController};
use crate::error::{Error, Result};
use crate::events::Aggregate;
use crate::expr::ScopeStore;
use crate::invocation::Invocation;
use crate::projector::{InvocationProjector, WorkflowProjector};
use crate::runtime::native::NativeRuntime;
use crate::runtime::subflow::SubWorkflowRuntime;
use crate::runtime::{MetaResolver, Runtime};
use crate::scheduler::DependencyScheduler;
use crate::stores::{EntityStore, Invocations, Workflows};

/// A running engine instance.
///
/// A single instance owns evaluation of every invocation it sees;
/// coordinating multiple replicas is delegated to the backend's ordering
/// guarantees.
pub struct Engine {
    config: EngineConfig,
    workflows: Arc<Workflows>,
    invocations: Arc<Invocations>,
    scopes: Arc<ScopeStore>,
    workflow_api: WorkflowApi,
    invocation_api: InvocationApi,
    task_api: Arc<TaskApi>,
    native: Arc<NativeRuntime>,
    invocation_executor: Arc<crate::executor::LocalExecutor>,
    workflow_executor: Arc<crate::executor::LocalExecutor>,
    invocation_meta: InvocationMetaController,
    workflow_meta: WorkflowMetaController,
    cache_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Engine {
    /// Starts an engine with the default native runtime.
    ///
    /// # Errors
    ///
    /// Propagates wiring failures from the backend.
    pub async fn start(config: EngineConfig, backend: Arc<dyn EventBackend>) -> Result<Self> {
        Self::start_with_native(config, backend, NativeRuntime::with_defaults()).await
    }

    /// Starts an engine with a caller-assembled native runtime (custom
    /// functions registered).
    ///
    /// # Errors
    ///
    /// Propagates wiring failures from the backend.
    pub async fn start_with_native(
        config: EngineConfig,
        backend: Arc<dyn EventBackend>,
        native: NativeRuntime,
    ) -> Result<Self> {
        // Caches and their subscription loops.
        let workflow_cache = Arc::new(EntityCache::new(
            Arc::clone(&backend),
            WorkflowProjector,
            config.workflow_cache_capacity,
            config.workflow_subscriber_buffer,
        ));
        let invocation_cache = Arc::new(EntityCache::new(
            Arc::clone(&backend),
            InvocationProjector,
            config.invocation_cache_capacity,
            config.invocation_subscriber_buffer,
        ));
        let cache_tasks = vec![
            workflow_cache.start(config.workflow_subscriber_buffer),
            invocation_cache.start(config.invocation_subscriber_buffer),
        ];

        // Stores and APIs.
        let workflows = Arc::new(Workflows::new(workflow_cache, Arc::clone(&backend)));
        let invocations = Arc::new(Invocations::new(invocation_cache, Arc::clone(&backend)));
        let scopes = Arc::new(ScopeStore::new());

        let workflow_api = WorkflowApi::new(Arc::clone(&backend));
        let invocation_api = InvocationApi::new(
            Arc::clone(&backend),
            (*workflows).clone(),
            (*invocations).clone(),
        );

        // Runtimes: the native built-in and the recursive sub-workflow one.
        let native = Arc::new(native);
        let subflow = Arc::new(SubWorkflowRuntime::new(
            invocation_api.clone(),
            (*invocations).clone(),
            (*workflows).clone(),
        ));
        let runtimes: BTreeMap<String, Arc<dyn Runtime>> = BTreeMap::from([
            (
                native.name().to_string(),
                Arc::clone(&native) as Arc<dyn Runtime>,
            ),
            (
                subflow.name().to_string(),
                Arc::clone(&subflow) as Arc<dyn Runtime>,
            ),
        ]);
        let resolver = MetaResolver::new(runtimes);

        let task_api = Arc::new(TaskApi::new(
            Arc::clone(&backend),
            (*workflows).clone(),
            Arc::clone(&scopes),
            resolver.clone(),
        ));

        // Executors: invocation-wide pool plus the lighter workflow loop.
        let invocation_executor = Arc::new(crate::executor::LocalExecutor::new(
            "invocations",
            config.invocation_executor_parallelism,
            config.invocation_executor_queue_depth,
        ));
        let workflow_executor = Arc::new(crate::executor::LocalExecutor::new(
            "workflows",
            config.workflow_executor_parallelism,
            config.workflow_executor_queue_depth,
        ));

        // Control domains.
        let invocation_meta = InvocationMetaController::start(
            InvocationControllerDeps {
                executor: Arc::clone(&invocation_executor),
                invocation_api: invocation_api.clone(),
                task_api: Arc::clone(&task_api),
                policy: Arc::new(DependencyScheduler::new(config.prewarm_lead)),
                scopes: Arc::clone(&scopes),
                config: config.clone(),
            },
            Arc::clone(&invocations),
        );
        let workflow_meta = WorkflowMetaController::start(
            WorkflowControllerDeps {
                executor: Arc::clone(&workflow_executor),
                workflow_api: workflow_api.clone(),
                resolver,
                config: config.clone(),
            },
            Arc::clone(&workflows),
        );

        tracing::info!("engine started");
        Ok(Self {
            config,
            workflows,
            invocations,
            scopes,
            workflow_api,
            invocation_api,
            task_api,
            native,
            invocation_executor,
            workflow_executor,
            invocation_meta,
            workflow_meta,
            cache_tasks,
        })
    }

    /// The workflow API.
    #[must_use]
    pub fn workflow_api(&self) -> &WorkflowApi {
        &self.workflow_api
    }

    /// The invocation API.
    #[must_use]
    pub fn invocation_api(&self) -> &InvocationApi {
        &self.invocation_api
    }

    /// The task API.
    #[must_use]
    pub fn task_api(&self) -> &Arc<TaskApi> {
        &self.task_api
    }

    /// The workflow store.
    #[must_use]
    pub fn workflows(&self) -> &Arc<Workflows> {
        &self.workflows
    }

    /// The invocation store.
    #[must_use]
    pub fn invocations(&self) -> &Arc<Invocations> {
        &self.invocations
    }

    /// The process-wide scope store.
    #[must_use]
    pub fn scopes(&self) -> &Arc<ScopeStore> {
        &self.scopes
    }

    /// The native runtime (taps observable for tests and diagnostics).
    #[must_use]
    pub fn native_runtime(&self) -> &Arc<NativeRuntime> {
        &self.native
    }

    /// Blocks until the invocation reaches a terminal state, bounded by
    /// `timeout` (the configured maximum runtime when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeadlineExceeded`] when the bound elapses first.
    pub async fn await_invocation(
        &self,
        id: InvocationId,
        timeout: Option<Duration>,
    ) -> Result<Arc<Invocation>> {
        let bound = timeout.unwrap_or(self.config.default_max_runtime + Duration::from_secs(5));
        let deadline = tokio::time::Instant::now() + bound;
        let aggregate = Aggregate::invocation(id);

        loop {
            let invocation = self.invocations.refresh(&aggregate).await?;
            if invocation.is_terminal() {
                return Ok(invocation);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Shuts the engine down: sensors and controllers stop, executors drain
    /// within the configured grace period, cache subscriptions end.
    pub async fn shutdown(self) {
        let grace = self.config.shutdown_grace;

        self.invocation_meta.close(grace).await;
        self.workflow_meta.close(grace).await;

        self.invocation_executor.close(grace).await;
        self.workflow_executor.close(grace).await;

        for task in self.cache_tasks {
            task.abort();
        }
        tracing::info!("engine stopped");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
