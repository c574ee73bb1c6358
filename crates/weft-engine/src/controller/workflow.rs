//! The per-workflow control loop.
//!
//! Workflows need control only while Parsing: the controller resolves every
//! task's function reference through the [`MetaResolver`], rejects cyclic
//! task graphs, and appends `WorkflowParsed` or `WorkflowParseFailed`. Once
//! the workflow leaves Parsing the controller is done.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use weft_core::WorkflowId;

use super::{Controller, ControllerFactory, EvalEvent, EvalResult, System};
use crate::api::WorkflowApi;
use crate::config::EngineConfig;
use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::events::AggregateKind;
use crate::executor::{ExecutorTask, LocalExecutor};
use crate::runtime::MetaResolver;
use crate::stores::Workflows;
use crate::workflow::{ResolvedTask, Workflow, WorkflowStatus};

/// Shared dependencies of every workflow controller.
#[derive(Clone)]
pub struct WorkflowControllerDeps {
    /// The (lighter) executor parse jobs are submitted to.
    pub executor: Arc<LocalExecutor>,
    /// The workflow API for parse-result events.
    pub workflow_api: WorkflowApi,
    /// Resolves function references across runtimes.
    pub resolver: MetaResolver,
    /// Engine configuration.
    pub config: EngineConfig,
}

/// Drives one workflow through parsing.
pub struct WorkflowController {
    workflow_id: String,
    deps: WorkflowControllerDeps,
}

impl WorkflowController {
    /// Creates the controller for one workflow id.
    #[must_use]
    pub fn new(workflow_id: String, deps: WorkflowControllerDeps) -> Self {
        Self { workflow_id, deps }
    }
}

/// Resolves every task of a workflow, validating the graph first.
///
/// # Errors
///
/// Returns [`Error::Validation`] for cyclic graphs and propagates the first
/// resolution failure.
pub async fn resolve_workflow(
    resolver: &MetaResolver,
    workflow: &Workflow,
) -> Result<BTreeMap<String, ResolvedTask>> {
    let mut dag: Dag<String> = Dag::new();
    for task_id in workflow.spec.tasks.keys() {
        dag.add_node(task_id.clone());
    }
    for (task_id, spec) in &workflow.spec.tasks {
        let to = dag.add_node(task_id.clone());
        for dep in spec.dependencies() {
            let from = dag.add_node(dep);
            dag.add_edge(from, to)?;
        }
    }
    dag.toposort()?;

    let mut tasks = BTreeMap::new();
    for (task_id, spec) in &workflow.spec.tasks {
        let resolved_id = resolver.resolve(&spec.function).await.map_err(|error| {
            Error::validation(format!(
                "failed to resolve function of task '{task_id}': {error}"
            ))
        })?;
        tasks.insert(
            task_id.clone(),
            ResolvedTask {
                function: spec.function.clone(),
                resolved_id,
            },
        );
    }
    Ok(tasks)
}

#[async_trait]
impl Controller<Workflow> for WorkflowController {
    async fn eval(&mut self, event: &EvalEvent<Workflow>) -> EvalResult {
        let _timing = crate::metrics::time_controller_eval("workflow");

        let Some(workflow) = event.updated.clone() else {
            return EvalResult::Failed {
                error: Error::internal(format!(
                    "event for key {} carries no workflow",
                    event.key
                )),
            };
        };
        if workflow.id.to_string() != self.workflow_id {
            return EvalResult::Failed {
                error: Error::internal(format!(
                    "workflow id expected {}, but was {}",
                    self.workflow_id, workflow.id
                )),
            };
        }

        if workflow.status != WorkflowStatus::Parsing {
            return EvalResult::Done {
                reason: format!("workflow parsing concluded ({:?})", workflow.status),
            };
        }

        // Parse through the executor; the task id dedups re-submissions
        // from repeated evaluation cycles.
        let api = self.deps.workflow_api.clone();
        let resolver = self.deps.resolver.clone();
        let workflow_id = workflow.id;
        self.deps.executor.submit(ExecutorTask::new(
            format!("{workflow_id}.parse"),
            workflow_id.to_string(),
            async move {
                match resolve_workflow(&resolver, &workflow).await {
                    Ok(tasks) => api.mark_parsed(workflow_id, tasks).await,
                    Err(error) => {
                        tracing::warn!(workflow = %workflow_id, %error, "workflow parse failed");
                        api.mark_parse_failed(workflow_id, error.to_string()).await
                    }
                }
            },
        ));

        EvalResult::Success {
            message: "workflow parse scheduled".into(),
        }
    }
}

/// Builds the workflow control system.
#[must_use]
pub fn workflow_system(deps: WorkflowControllerDeps) -> Arc<System<Workflow>> {
    let workers = deps.config.workflow_eval_workers;
    let factory: ControllerFactory<Workflow> = Box::new(move |event| {
        event
            .key
            .parse::<WorkflowId>()
            .map_err(|_| Error::internal("workflow id missing in event"))?;
        Ok(Box::new(WorkflowController::new(
            event.key.clone(),
            deps.clone(),
        )))
    });
    Arc::new(System::new("workflow", workers, factory))
}

/// The meta-controller for the workflow domain.
pub struct WorkflowMetaController {
    system: Arc<System<Workflow>>,
    sensors: Vec<super::sensors::SensorHandle>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkflowMetaController {
    /// Wires the system and sensors and starts evaluation workers.
    #[must_use]
    pub fn start(deps: WorkflowControllerDeps, workflows: Arc<Workflows>) -> Self {
        let config = deps.config.clone();
        let system = workflow_system(deps);
        let workers = system.start();

        let store: Arc<dyn crate::stores::EntityStore<Workflow>> =
            Arc::new((*workflows).clone());
        let sensors = vec![
            super::sensors::notification_sensor(Arc::clone(&store), Arc::clone(&system)),
            super::sensors::store_poll_sensor(
                Arc::clone(&store),
                Arc::clone(&system),
                AggregateKind::Workflow,
                config.workflow_poll_interval,
            ),
            super::sensors::staleness_sensor(
                Arc::clone(&store),
                Arc::clone(&system),
                AggregateKind::Workflow,
                config.staleness_interval,
                config.max_staleness,
            ),
        ];

        Self {
            system,
            sensors,
            workers,
        }
    }

    /// The underlying control system.
    #[must_use]
    pub fn system(&self) -> &Arc<System<Workflow>> {
        &self.system
    }

    /// Stops sensors, workers, and controllers.
    pub async fn close(mut self, grace: Duration) {
        for sensor in self.sensors.drain(..) {
            sensor.stop().await;
        }
        self.system.close().await;
        let deadline = tokio::time::Instant::now() + grace;
        for worker in self.workers.drain(..) {
            if tokio::time::Instant::now() >= deadline {
                worker.abort();
            } else {
                let _ = tokio::time::timeout_at(deadline, worker).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::native::NativeRuntime;
    use crate::runtime::Runtime;
    use crate::workflow::{TaskSpec, WorkflowSpec};
    use weft_core::{FunctionRef, TypedValue};

    fn resolver() -> MetaResolver {
        let native: Arc<dyn Runtime> = Arc::new(NativeRuntime::with_defaults());
        MetaResolver::new(BTreeMap::from([("native".to_string(), native)]))
    }

    fn parsing_workflow(spec: WorkflowSpec) -> Workflow {
        Workflow {
            id: WorkflowId::generate(),
            spec,
            status: WorkflowStatus::Parsing,
            tasks: BTreeMap::new(),
            error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            version: 1,
        }
    }

    #[tokio::test]
    async fn resolve_workflow_resolves_every_task() {
        let workflow = parsing_workflow(
            WorkflowSpec::new()
                .task("a", TaskSpec::new(FunctionRef::new("native", "noop")))
                .task("b", TaskSpec::new(FunctionRef::new("native", "echo"))),
        );

        let tasks = resolve_workflow(&resolver(), &workflow).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks["a"].resolved_id, "noop");
        assert_eq!(tasks["b"].resolved_id, "echo");
    }

    #[tokio::test]
    async fn unresolvable_function_fails_the_parse() {
        let workflow = parsing_workflow(
            WorkflowSpec::new().task("a", TaskSpec::new(FunctionRef::new("native", "ghost"))),
        );

        let result = resolve_workflow(&resolver(), &workflow).await;
        assert!(matches!(result, Err(Error::Validation { .. })));
    }

    #[tokio::test]
    async fn cyclic_graph_fails_the_parse() {
        let workflow = parsing_workflow(
            WorkflowSpec::new()
                .task(
                    "a",
                    TaskSpec::new(FunctionRef::new("native", "noop"))
                        .input("x", TypedValue::expr("$.Tasks.b.Output").unwrap()),
                )
                .task(
                    "b",
                    TaskSpec::new(FunctionRef::new("native", "noop")).requires("a"),
                ),
        );

        let result = resolve_workflow(&resolver(), &workflow).await;
        assert!(matches!(result, Err(Error::Validation { .. })));
    }
}
