//! The per-invocation control loop.
//!
//! One [`InvocationController`] exists per invocation id. Its `eval` walks a
//! fixed precondition chain, short-circuiting on the first failure; every
//! failure submits a `fail` job through the executor so terminal writes stay
//! ordered with the invocation's other pending work. When all tasks are
//! finished it completes (or fails) the invocation; otherwise it defers to
//! the scheduler policy and submits the resulting run and pre-warm jobs.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use weft_core::InvocationId;

use super::{Controller, ControllerFactory, EvalEvent, EvalResult, System};
use crate::api::{InvocationApi, InvokeOptions, TaskApi};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::events::AggregateKind;
use crate::executor::{ExecutorTask, LocalExecutor};
use crate::expr::ScopeStore;
use crate::invocation::{Invocation, TaskInvocationStatus};
use crate::scheduler::SchedulerPolicy;
use crate::stores::Invocations;

/// Shared dependencies of every invocation controller.
#[derive(Clone)]
pub struct InvocationControllerDeps {
    /// The executor run and fail jobs are submitted to.
    pub executor: Arc<LocalExecutor>,
    /// The invocation API for completion and failure events.
    pub invocation_api: InvocationApi,
    /// The task API run jobs call into.
    pub task_api: Arc<TaskApi>,
    /// The scheduling policy.
    pub policy: Arc<dyn SchedulerPolicy>,
    /// The process-wide scope store, released on termination.
    pub scopes: Arc<ScopeStore>,
    /// Engine configuration (deadline default, error budget).
    pub config: EngineConfig,
}

/// Drives a single invocation from submission to a terminal state.
pub struct InvocationController {
    invocation_id: String,
    deps: InvocationControllerDeps,
    /// Task ids dispatched and not yet confirmed started by the backend.
    scheduled: BTreeSet<String>,
    /// Task ids already pre-warmed; each task is tapped at most once.
    prepared: BTreeSet<String>,
    /// Consecutive failed evaluations.
    error_count: u32,
}

impl InvocationController {
    /// Creates the controller for one invocation id.
    #[must_use]
    pub fn new(invocation_id: String, deps: InvocationControllerDeps) -> Self {
        Self {
            invocation_id,
            deps,
            scheduled: BTreeSet::new(),
            prepared: BTreeSet::new(),
            error_count: 0,
        }
    }

    fn failed(&mut self, error: Error) -> EvalResult {
        self.error_count += 1;
        EvalResult::Failed { error }
    }

    /// Submits the `fail(invocation)` job so the terminal write is ordered
    /// with the group's other submissions.
    fn submit_fail(&self, invocation_id: InvocationId, reason: impl Into<String>) {
        let api = self.deps.invocation_api.clone();
        let reason = reason.into();
        self.deps.executor.submit(ExecutorTask::new(
            format!("{invocation_id}.fail"),
            invocation_id.to_string(),
            async move { api.fail(invocation_id, reason).await },
        ));
    }

    fn submit_complete(&self, invocation: &Invocation) {
        let output_task = invocation
            .workflow
            .as_ref()
            .and_then(|w| w.spec.output_task.clone());
        let (output, output_headers) = output_task
            .and_then(|task_id| invocation.task(&task_id))
            .map_or((None, None), |task| {
                (task.output.clone(), task.output_headers.clone())
            });

        let api = self.deps.invocation_api.clone();
        let invocation_id = invocation.id;
        self.deps.executor.submit(ExecutorTask::new(
            format!("{invocation_id}.complete"),
            invocation_id.to_string(),
            async move { api.complete(invocation_id, output, output_headers).await },
        ));
    }

    fn submit_run(&mut self, invocation: &Arc<Invocation>, task_id: &str) {
        let api = Arc::clone(&self.deps.task_api);
        let invocation_ref = Arc::clone(invocation);
        let task = task_id.to_string();
        let deadline = invocation.effective_deadline(self.deps.config.default_max_runtime);

        let accepted = self.deps.executor.submit(ExecutorTask::new(
            format!("{}.run.{task_id}", invocation.id),
            invocation.id.to_string(),
            async move {
                let options = InvokeOptions {
                    deadline: Some(deadline),
                    ..InvokeOptions::default()
                };
                api.invoke(&invocation_ref, &task, options).await.map(|_| ())
            },
        ));
        if accepted {
            self.scheduled.insert(task_id.to_string());
        }
    }

    fn submit_prepare(
        &mut self,
        invocation: &Arc<Invocation>,
        task_id: &str,
        expected_at: chrono::DateTime<Utc>,
    ) {
        if !self.prepared.insert(task_id.to_string()) {
            return;
        }
        let api = Arc::clone(&self.deps.task_api);
        let invocation_ref = Arc::clone(invocation);
        let task = task_id.to_string();
        self.deps.executor.submit(ExecutorTask::new(
            format!("{}.prewarm.{task_id}", invocation.id),
            invocation.id.to_string(),
            async move {
                api.prepare(&invocation_ref, &task, expected_at).await;
                Ok(())
            },
        ));
    }
}

#[async_trait]
impl Controller<Invocation> for InvocationController {
    #[allow(clippy::too_many_lines)]
    async fn eval(&mut self, event: &EvalEvent<Invocation>) -> EvalResult {
        let _timing = crate::metrics::time_controller_eval("invocation");

        // 1. The event must carry an invocation with the matching id.
        let Some(invocation) = event.updated.clone() else {
            return self.failed(Error::internal(format!(
                "event for key {} carries no invocation",
                event.key
            )));
        };
        if invocation.id.to_string() != self.invocation_id {
            return self.failed(Error::internal(format!(
                "invocation id expected {}, but was {}",
                self.invocation_id, invocation.id
            )));
        }

        // 2. The embedded workflow must be present.
        if invocation.workflow.is_none() {
            let error = Error::failed_precondition("workflow is not present in the invocation");
            self.submit_fail(invocation.id, error.to_string());
            return self.failed(error);
        }

        // 3. Terminal invocations are done; the system closes us next.
        if invocation.is_terminal() {
            return EvalResult::Done {
                reason: format!("invocation is in a terminal state ({:?})", invocation.status),
            };
        }

        // 4. The deadline must not have elapsed.
        let deadline = invocation.effective_deadline(self.deps.config.default_max_runtime);
        if Utc::now() > deadline {
            // Cancel in-flight work before queueing the terminal write.
            self.deps.executor.cancel_group(&self.invocation_id);
            self.submit_fail(invocation.id, "deadline exceeded");
            return self.failed(Error::DeadlineExceeded);
        }

        // 5. The consecutive-error budget must not be exhausted.
        if self.error_count > self.deps.config.controller_error_budget {
            self.submit_fail(invocation.id, "error count exceeded");
            return self.failed(Error::internal("error count exceeded"));
        }

        // Drop dispatched ids once the backend confirms the task moved on.
        self.scheduled.retain(|task_id| {
            invocation
                .task(task_id)
                .is_none_or(|t| t.status == TaskInvocationStatus::Scheduled)
        });

        // 6. All tasks finished: complete or fail the invocation.
        if invocation.all_tasks_finished() {
            self.error_count = 0;
            if invocation.any_task_failed() {
                self.submit_fail(
                    invocation.id,
                    crate::scheduler::ABORT_TASK_FAILED,
                );
                return EvalResult::Success {
                    message: "invocation failed: not all tasks succeeded".into(),
                };
            }
            self.submit_complete(&invocation);
            return EvalResult::Success {
                message: "all tasks of the invocation have completed".into(),
            };
        }

        // 7. Defer the heuristic part of the evaluation to the scheduler.
        let schedule = match self
            .deps
            .policy
            .evaluate(&invocation, &self.scheduled, Utc::now())
        {
            Ok(schedule) => schedule,
            Err(error) => return self.failed(error),
        };

        if let Some(reason) = schedule.abort {
            self.submit_fail(invocation.id, reason.clone());
            return self.failed(Error::aborted(reason));
        }

        for prepare in &schedule.prepare {
            self.submit_prepare(&invocation, &prepare.task_id, prepare.expected_at);
        }
        let run_count = schedule.run.len();
        let prepare_count = schedule.prepare.len();
        for run in &schedule.run {
            self.submit_run(&invocation, &run.task_id);
        }

        self.error_count = 0;
        EvalResult::Success {
            message: format!(
                "scheduled execution of {run_count} task(s) and preparation of {prepare_count} task(s)"
            ),
        }
    }

    async fn close(&mut self) {
        self.deps.executor.cancel_group(&self.invocation_id);
        self.deps.scopes.release(&self.invocation_id);
    }
}

/// Builds the invocation control system: factory, registry, and sensors.
#[must_use]
pub fn invocation_system(deps: InvocationControllerDeps) -> Arc<System<Invocation>> {
    let workers = deps.config.invocation_eval_workers;
    let factory: ControllerFactory<Invocation> = Box::new(move |event| {
        if event.key.is_empty() {
            return Err(Error::internal("invocation id missing in event"));
        }
        Ok(Box::new(InvocationController::new(
            event.key.clone(),
            deps.clone(),
        )))
    });
    Arc::new(System::new("invocation", workers, factory))
}

/// The meta-controller: owns the control system, its sensors, and their
/// lifecycles for the invocation domain.
pub struct InvocationMetaController {
    system: Arc<System<Invocation>>,
    sensors: Vec<super::sensors::SensorHandle>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl InvocationMetaController {
    /// Wires the system and sensors and starts evaluation workers.
    #[must_use]
    pub fn start(
        deps: InvocationControllerDeps,
        invocations: Arc<Invocations>,
    ) -> Self {
        let config = deps.config.clone();
        let system = invocation_system(deps);
        let workers = system.start();

        let store: Arc<dyn crate::stores::EntityStore<Invocation>> =
            Arc::new((*invocations).clone());
        let sensors = vec![
            super::sensors::notification_sensor(Arc::clone(&store), Arc::clone(&system)),
            super::sensors::store_poll_sensor(
                Arc::clone(&store),
                Arc::clone(&system),
                AggregateKind::Invocation,
                config.invocation_poll_interval,
            ),
            super::sensors::staleness_sensor(
                Arc::clone(&store),
                Arc::clone(&system),
                AggregateKind::Invocation,
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
    pub fn system(&self) -> &Arc<System<Invocation>> {
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
