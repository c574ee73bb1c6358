//! Scheduler policy: which tasks to run, pre-warm, or abort.
//!
//! The policy is a pure function of the invocation snapshot, the set of
//! task ids the controller has already dispatched this cycle, and the
//! current time. Controllers call it on every evaluation cycle, so purity is
//! load-bearing: no I/O, no side effects, identical inputs yield identical
//! schedules.
//!
//! The default policy is dependency-driven:
//! - a task **runs** when every dependency has succeeded and the task itself
//!   is still Scheduled and not yet dispatched;
//! - a task is **prepared** (advisory pre-warm) when its dependencies are in
//!   progress but not yet done, with `expected_at` a fixed lead ahead;
//! - the invocation **aborts** as soon as any task has failed.
//!
//! Tie-breaking among candidates is stable by task-id ordering.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::invocation::{Invocation, TaskInvocationStatus};

/// Reason used when a task failure aborts the whole invocation.
pub const ABORT_TASK_FAILED: &str = "one or more tasks in the workflow have failed";

/// Default pre-warm lead: how far before its predicted start a task's
/// runtime is notified.
pub const DEFAULT_PREWARM_LEAD: Duration = Duration::from_millis(500);

/// A decision to dispatch one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTask {
    /// The task to run.
    pub task_id: String,
}

/// A decision to pre-warm one task's runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareTask {
    /// The task predicted to become runnable.
    pub task_id: String,
    /// When the task is expected to start.
    pub expected_at: DateTime<Utc>,
}

/// The scheduler's decision for one evaluation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Tasks whose dependencies are satisfied; dispatch now.
    pub run: Vec<RunTask>,
    /// Tasks predicted to become runnable soon; pre-warm their runtimes.
    pub prepare: Vec<PrepareTask>,
    /// When set, the invocation must fail immediately with this reason.
    pub abort: Option<String>,
}

impl Schedule {
    /// Creates an abort-only schedule.
    #[must_use]
    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            run: Vec::new(),
            prepare: Vec::new(),
            abort: Some(reason.into()),
        }
    }
}

/// A pluggable scheduling policy.
///
/// Implementations must be pure: no I/O, no interior mutation, and
/// deterministic for identical inputs.
pub trait SchedulerPolicy: Send + Sync {
    /// Computes the schedule for one evaluation cycle.
    ///
    /// `scheduled` holds the task ids the controller has dispatched and not
    /// yet seen confirmed by the backend, to prevent re-dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the invocation has no embedded
    /// workflow to schedule against.
    fn evaluate(
        &self,
        invocation: &Invocation,
        scheduled: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Schedule>;
}

/// The default dependency-driven policy.
#[derive(Debug, Clone)]
pub struct DependencyScheduler {
    prewarm_lead: Duration,
}

impl Default for DependencyScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_PREWARM_LEAD)
    }
}

impl DependencyScheduler {
    /// Creates the policy with an explicit pre-warm lead.
    #[must_use]
    pub const fn new(prewarm_lead: Duration) -> Self {
        Self { prewarm_lead }
    }
}

impl SchedulerPolicy for DependencyScheduler {
    fn evaluate(
        &self,
        invocation: &Invocation,
        scheduled: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Schedule> {
        let workflow = invocation
            .workflow
            .as_ref()
            .ok_or_else(|| Error::validation("invocation has no embedded workflow"))?;

        if invocation.any_task_failed() {
            return Ok(Schedule::abort(ABORT_TASK_FAILED));
        }

        let status_of = |task_id: &str| {
            invocation
                .task(task_id)
                .map_or(TaskInvocationStatus::Scheduled, |t| t.status)
        };

        let expected_at = now
            + chrono::Duration::from_std(self.prewarm_lead)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(500));

        let mut schedule = Schedule::default();
        // BTreeMap iteration gives the stable task-id tie-break.
        for (task_id, spec) in &workflow.spec.tasks {
            if status_of(task_id) != TaskInvocationStatus::Scheduled
                || scheduled.contains(task_id)
            {
                continue;
            }

            let deps = spec.dependencies();
            let all_succeeded = deps
                .iter()
                .all(|dep| status_of(dep) == TaskInvocationStatus::Succeeded);
            if all_succeeded {
                schedule.run.push(RunTask {
                    task_id: task_id.clone(),
                });
                continue;
            }

            let all_under_way = deps.iter().all(|dep| {
                matches!(
                    status_of(dep),
                    TaskInvocationStatus::InProgress | TaskInvocationStatus::Succeeded
                )
            });
            if all_under_way {
                schedule.prepare.push(PrepareTask {
                    task_id: task_id.clone(),
                    expected_at,
                });
            }
        }

        Ok(schedule)
    }
}
