//! Bounded worker pool for controller-submitted jobs.
//!
//! Controllers never run task work inline: every unit — a runtime invoke, a
//! pre-warm tap, a completion or failure append — is submitted as an
//! [`ExecutorTask`] keyed by `task_id` and grouped by `group_id` (the
//! invocation id). The pool bounds both parallelism and queue depth;
//! backpressure is reported to the caller as a rejected submission, never
//! hidden. Submissions with a `task_id` already in flight are deduplicated,
//! so re-evaluation cycles are idempotent. Groups support size queries and
//! coalesced cancellation when an invocation terminates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::AbortHandle;

use crate::error::Result;
use crate::metrics::record_executor_rejection;

/// One unit of work: a keyed, grouped future.
pub struct ExecutorTask {
    /// Deduplication key; at most one task per key is in flight.
    pub task_id: String,
    /// Grouping key for queries and coalesced cancellation.
    pub group_id: String,
    /// The work itself.
    pub apply: BoxFuture<'static, Result<()>>,
}

impl ExecutorTask {
    /// Creates a task from any sendable future.
    pub fn new(
        task_id: impl Into<String>,
        group_id: impl Into<String>,
        apply: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            group_id: group_id.into(),
            apply: apply.boxed(),
        }
    }
}

impl std::fmt::Debug for ExecutorTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorTask")
            .field("task_id", &self.task_id)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct State {
    in_flight: HashMap<String, AbortHandle>,
    groups: HashMap<String, HashSet<String>>,
}

struct Inner {
    name: &'static str,
    max_queue_depth: usize,
    semaphore: Arc<Semaphore>,
    state: Mutex<State>,
    closed: AtomicBool,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, task_id: &str, group_id: &str) {
        let mut state = self.lock();
        state.in_flight.remove(task_id);
        if let Some(group) = state.groups.get_mut(group_id) {
            group.remove(task_id);
            if group.is_empty() {
                state.groups.remove(group_id);
            }
        }
    }
}

/// Unregisters the task when its future completes or is aborted.
struct RemoveGuard {
    inner: Arc<Inner>,
    task_id: String,
    group_id: String,
}

impl Drop for RemoveGuard {
    fn drop(&mut self) {
        self.inner.remove(&self.task_id, &self.group_id);
    }
}

/// A bounded worker pool with keyed deduplication and group cancellation.
pub struct LocalExecutor {
    inner: Arc<Inner>,
}

impl LocalExecutor {
    /// Creates a pool running at most `max_parallelism` tasks concurrently
    /// and holding at most `max_queue_depth` pending-plus-running tasks.
    #[must_use]
    pub fn new(name: &'static str, max_parallelism: usize, max_queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                max_queue_depth: max_queue_depth.max(1),
                semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
                state: Mutex::new(State::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Submits a task.
    ///
    /// Returns `true` when the task was accepted (or an identical `task_id`
    /// is already in flight), `false` when the pool is closed or the queue
    /// depth is reached — the caller must retry on its next cycle.
    pub fn submit(&self, task: ExecutorTask) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            record_executor_rejection(self.inner.name);
            return false;
        }

        let ExecutorTask {
            task_id,
            group_id,
            apply,
        } = task;

        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = {
            let inner = Arc::clone(&self.inner);
            let task_id = task_id.clone();
            let group_id = group_id.clone();
            tokio::spawn(async move {
                let _guard = RemoveGuard {
                    inner: Arc::clone(&inner),
                    task_id: task_id.clone(),
                    group_id,
                };
                // Run only after the submitter has registered us, so the
                // guard never races the registration.
                if registered_rx.await.is_err() {
                    return;
                }
                let Ok(_permit) = inner.semaphore.acquire().await else {
                    return;
                };
                if let Err(error) = apply.await {
                    tracing::warn!(task = %task_id, %error, "executor task failed");
                }
            })
        };

        {
            let mut state = self.inner.lock();
            if state.in_flight.contains_key(&task_id) {
                // Idempotent: the same unit is already pending or running.
                handle.abort();
                return true;
            }
            if state.in_flight.len() >= self.inner.max_queue_depth {
                handle.abort();
                record_executor_rejection(self.inner.name);
                return false;
            }
            state
                .groups
                .entry(group_id)
                .or_default()
                .insert(task_id.clone());
            state.in_flight.insert(task_id, handle.abort_handle());
        }

        let _ = registered_tx.send(());
        true
    }

    /// Returns the number of pending-plus-running tasks in a group.
    #[must_use]
    pub fn group_size(&self, group_id: &str) -> usize {
        self.inner
            .lock()
            .groups
            .get(group_id)
            .map_or(0, HashSet::len)
    }

    /// Returns the total number of pending-plus-running tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Returns true if no tasks are pending or running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().in_flight.is_empty()
    }

    /// Aborts every task in a group. Used when an invocation terminates.
    pub fn cancel_group(&self, group_id: &str) {
        let handles: Vec<AbortHandle> = {
            let mut state = self.inner.lock();
            let Some(task_ids) = state.groups.remove(group_id) else {
                return;
            };
            task_ids
                .iter()
                .filter_map(|task_id| state.in_flight.remove(task_id))
                .collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

    /// Stops accepting work and drains in-flight tasks within `grace`.
    /// Tasks still running after the grace period are aborted.
    pub async fn close(&self, grace: Duration) {
        self.inner.closed.store(true, Ordering::Release);

        let deadline = tokio::time::Instant::now() + grace;
        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                let handles: Vec<AbortHandle> = {
                    let mut state = self.inner.lock();
                    state.groups.clear();
                    state.in_flight.drain().map(|(_, h)| h).collect()
                };
                for handle in handles {
                    handle.abort();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl std::fmt::Debug for LocalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("name", &self.inner.name)
            .field("in_flight", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn submitted_tasks_run() {
        let executor = LocalExecutor::new("test", 4, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        assert!(executor.submit(ExecutorTask::new("t1", "g1", async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        executor.close(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_task_ids_are_deduplicated() {
        let executor = LocalExecutor::new("test", 1, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        // Hold the single permit so the first task stays in flight.
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let c = counter.clone();
        assert!(executor.submit(ExecutorTask::new("t1", "g1", async move {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = release_rx.await;
            Ok(())
        })));

        let c = counter.clone();
        assert!(executor.submit(ExecutorTask::new("t1", "g1", async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })));

        let _ = release_tx.send(());
        executor.close(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn queue_depth_bound_rejects() {
        let executor = LocalExecutor::new("test", 1, 2);

        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        assert!(executor.submit(ExecutorTask::new("t1", "g1", async move {
            let _ = hold_rx.await;
            Ok(())
        })));
        assert!(executor.submit(ExecutorTask::new("t2", "g1", async { Ok(()) })));

        // Third distinct task exceeds the depth bound.
        assert!(!executor.submit(ExecutorTask::new("t3", "g1", async { Ok(()) })));
        assert!(executor.len() <= 2);

        let _ = hold_tx.send(());
        executor.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn group_size_tracks_membership() {
        let executor = LocalExecutor::new("test", 1, 16);

        let (hold_tx, hold_rx) = oneshot::channel::<()>();
        executor.submit(ExecutorTask::new("t1", "g1", async move {
            let _ = hold_rx.await;
            Ok(())
        }));
        executor.submit(ExecutorTask::new("t2", "g1", async { Ok(()) }));
        executor.submit(ExecutorTask::new("t3", "g2", async { Ok(()) }));

        assert_eq!(executor.group_size("g1"), 2);

        let _ = hold_tx.send(());
        executor.close(Duration::from_secs(1)).await;
        assert_eq!(executor.group_size("g1"), 0);
    }

    #[tokio::test]
    async fn cancel_group_aborts_members() {
        let executor = LocalExecutor::new("test", 4, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        executor.submit(ExecutorTask::new("slow", "g1", async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.cancel_group("g1");

        executor.close(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(executor.group_size("g1"), 0);
    }

    #[tokio::test]
    async fn closed_executor_rejects_submissions() {
        let executor = LocalExecutor::new("test", 4, 16);
        executor.close(Duration::from_millis(10)).await;
        assert!(!executor.submit(ExecutorTask::new("t1", "g1", async { Ok(()) })));
    }
}
