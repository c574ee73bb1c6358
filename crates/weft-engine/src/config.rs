//! Engine configuration.
//!
//! Every tunable of the execution core lives here with its production
//! default. Embedders override selectively; tests shrink intervals to keep
//! runs fast.

use std::time::Duration;

/// Tunables of the execution core.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on an invocation's total runtime when its spec sets no
    /// deadline.
    pub default_max_runtime: Duration,

    /// Bound on how long a task invocation waits for its workflow to reach
    /// Ready before dispatch.
    pub await_workflow: Duration,

    /// Consecutive engine errors a controller tolerates before failing its
    /// invocation. The default of 1 allows a single transient error per
    /// streak; set 0 to fail on the first error.
    pub controller_error_budget: u32,

    /// How far ahead of a task's predicted start its runtime is pre-warmed.
    pub prewarm_lead: Duration,

    /// Maximum concurrently running invocation executor tasks.
    pub invocation_executor_parallelism: usize,
    /// Maximum pending-plus-running invocation executor tasks.
    pub invocation_executor_queue_depth: usize,
    /// Maximum concurrently running workflow executor tasks (the parse loop
    /// is much lighter than task dispatch).
    pub workflow_executor_parallelism: usize,
    /// Maximum pending-plus-running workflow executor tasks.
    pub workflow_executor_queue_depth: usize,

    /// Concurrent evaluation workers for invocation controllers.
    pub invocation_eval_workers: usize,
    /// Concurrent evaluation workers for workflow controllers.
    pub workflow_eval_workers: usize,

    /// Bounded cache capacity for projected workflows.
    pub workflow_cache_capacity: usize,
    /// Bounded cache capacity for projected invocations.
    pub invocation_cache_capacity: usize,

    /// Per-subscriber buffer for workflow event subscriptions.
    pub workflow_subscriber_buffer: usize,
    /// Per-subscriber buffer for invocation event subscriptions.
    pub invocation_subscriber_buffer: usize,

    /// Interval of the workflow store poll sensor.
    pub workflow_poll_interval: Duration,
    /// Interval of the invocation store poll sensor.
    pub invocation_poll_interval: Duration,
    /// Interval of the staleness sensor scan.
    pub staleness_interval: Duration,
    /// A controller whose last evaluation is older than this is refreshed.
    pub max_staleness: Duration,

    /// Grace period for draining executors and workers on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_runtime: Duration::from_secs(10 * 60),
            await_workflow: Duration::from_secs(10),
            controller_error_budget: 1,
            prewarm_lead: Duration::from_millis(500),
            invocation_executor_parallelism: 1000,
            invocation_executor_queue_depth: 100_000,
            workflow_executor_parallelism: 10,
            workflow_executor_queue_depth: 1000,
            invocation_eval_workers: 8,
            workflow_eval_workers: 2,
            workflow_cache_capacity: 10_000,
            invocation_cache_capacity: 100_000,
            workflow_subscriber_buffer: 50,
            invocation_subscriber_buffer: 1000,
            workflow_poll_interval: Duration::from_secs(60),
            invocation_poll_interval: Duration::from_secs(1),
            staleness_interval: Duration::from_millis(100),
            max_staleness: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// A configuration with short intervals for tests.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            invocation_poll_interval: Duration::from_millis(50),
            workflow_poll_interval: Duration::from_millis(50),
            staleness_interval: Duration::from_millis(20),
            max_staleness: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_runtime, Duration::from_secs(600));
        assert_eq!(config.await_workflow, Duration::from_secs(10));
        assert_eq!(config.controller_error_budget, 1);
        assert_eq!(config.invocation_executor_parallelism, 1000);
        assert_eq!(config.workflow_executor_parallelism, 10);
        assert_eq!(config.max_staleness, Duration::from_secs(1));
    }
}
