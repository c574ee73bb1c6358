//! Observability metrics for the engine.
//!
//! Metrics are exposed through the `metrics` crate facade; wiring an
//! exporter is the embedding application's job. The engine records:
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `weft_events_appended_total` | Counter | `kind`, `event` | Events appended to the backend |
//! | `weft_controller_evals_total` | Counter | `controller`, `outcome` | Controller evaluation outcomes |
//! | `weft_controller_eval_seconds` | Histogram | `controller` | Controller evaluation duration |
//! | `weft_task_invocations_total` | Counter | `runtime`, `status` | Task invocations by final status |
//! | `weft_task_invocation_seconds` | Histogram | `runtime` | Runtime call duration |
//! | `weft_executor_rejections_total` | Counter | `pool` | Submissions rejected by backpressure |
//! | `weft_pubsub_drops_total` | Counter | `channel` | Items dropped on full subscriber buffers |

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: events appended to the backend.
    pub const EVENTS_APPENDED_TOTAL: &str = "weft_events_appended_total";
    /// Counter: controller evaluation outcomes.
    pub const CONTROLLER_EVALS_TOTAL: &str = "weft_controller_evals_total";
    /// Histogram: controller evaluation duration in seconds.
    pub const CONTROLLER_EVAL_SECONDS: &str = "weft_controller_eval_seconds";
    /// Counter: task invocations by final status.
    pub const TASK_INVOCATIONS_TOTAL: &str = "weft_task_invocations_total";
    /// Histogram: runtime call duration in seconds.
    pub const TASK_INVOCATION_SECONDS: &str = "weft_task_invocation_seconds";
    /// Counter: executor submissions rejected by backpressure.
    pub const EXECUTOR_REJECTIONS_TOTAL: &str = "weft_executor_rejections_total";
    /// Counter: items dropped on full subscriber buffers.
    pub const PUBSUB_DROPS_TOTAL: &str = "weft_pubsub_drops_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Aggregate kind (workflow, invocation).
    pub const KIND: &str = "kind";
    /// Event name.
    pub const EVENT: &str = "event";
    /// Controller name (workflow, invocation).
    pub const CONTROLLER: &str = "controller";
    /// Evaluation outcome (done, success, error).
    pub const OUTCOME: &str = "outcome";
    /// Runtime name (native, workflow, ...).
    pub const RUNTIME: &str = "runtime";
    /// Final task status.
    pub const STATUS: &str = "status";
    /// Executor pool name.
    pub const POOL: &str = "pool";
}

/// Records an appended event.
pub fn record_event_appended(kind: &str, event: &str) {
    counter!(
        names::EVENTS_APPENDED_TOTAL,
        labels::KIND => kind.to_string(),
        labels::EVENT => event.to_string(),
    )
    .increment(1);
}

/// Records a controller evaluation outcome.
pub fn record_controller_eval(controller: &str, outcome: &str) {
    counter!(
        names::CONTROLLER_EVALS_TOTAL,
        labels::CONTROLLER => controller.to_string(),
        labels::OUTCOME => outcome.to_string(),
    )
    .increment(1);
}

/// Records a finished task invocation.
pub fn record_task_invocation(runtime: &str, status: &str, duration: Duration) {
    counter!(
        names::TASK_INVOCATIONS_TOTAL,
        labels::RUNTIME => runtime.to_string(),
        labels::STATUS => status.to_string(),
    )
    .increment(1);
    histogram!(
        names::TASK_INVOCATION_SECONDS,
        labels::RUNTIME => runtime.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Records an executor rejection.
pub fn record_executor_rejection(pool: &str) {
    counter!(
        names::EXECUTOR_REJECTIONS_TOTAL,
        labels::POOL => pool.to_string(),
    )
    .increment(1);
}

/// Drop-scoped timer for controller evaluations.
///
/// Holds the controller label and start instant; its `Drop` records the
/// elapsed wall time into the evaluation-duration histogram, so callers
/// just bind the timer for the scope they want measured.
pub struct EvalTimer {
    controller: &'static str,
    started_at: Instant,
}

impl EvalTimer {
    /// Returns the elapsed time since the timer started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Drop for EvalTimer {
    fn drop(&mut self) {
        histogram!(
            names::CONTROLLER_EVAL_SECONDS,
            labels::CONTROLLER => self.controller.to_string(),
        )
        .record(self.elapsed().as_secs_f64());
    }
}

/// Starts a timer that records controller evaluation duration on drop.
#[must_use]
pub fn time_controller_eval(controller: &'static str) -> EvalTimer {
    EvalTimer {
        controller,
        started_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_an_exporter_does_not_panic() {
        record_event_appended("invocation", "task_started");
        record_controller_eval("invocation", "success");
        record_task_invocation("native", "succeeded", Duration::from_millis(5));
        record_executor_rejection("invocations");
    }

    #[test]
    fn eval_timer_tracks_elapsed_time() {
        let timer = time_controller_eval("invocation");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
        // Dropping records into the histogram; fine without an exporter.
        drop(timer);
    }
}
