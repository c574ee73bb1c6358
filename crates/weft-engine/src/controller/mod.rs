//! The control system: per-key controllers driven by a coalescing work
//! queue.
//!
//! A [`System`] owns a factory `(event) -> controller` and a registry
//! mapping controller key to controller, so at most one controller exists
//! per key. Sensors submit [`EvalEvent`]s into the system's queue; the queue
//! guarantees **single-flight with coalescing** per key: at most one `eval`
//! runs for a given key at any time, and events arriving for a key that is
//! already queued or evaluating collapse into one pending evaluation
//! carrying the newest event. Across keys, evaluation is fully concurrent up
//! to the system's worker count.

pub mod invocation;
pub mod sensors;
pub mod workflow;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::cache::Notification;
use crate::error::Error;
use crate::events::Event;
use crate::invocation::Invocation;
use crate::metrics::record_controller_eval;
use crate::workflow::{Workflow, WorkflowStatus};

/// Entities a control system can drive.
pub trait ControlledEntity: Clone + Send + Sync + 'static {
    /// The controller key: one controller exists per key.
    fn key(&self) -> String;
    /// Terminal entities are skipped by sensors and close their controller.
    fn is_terminal(&self) -> bool;
}

impl ControlledEntity for Invocation {
    fn key(&self) -> String {
        self.id.to_string()
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl ControlledEntity for Workflow {
    fn key(&self) -> String {
        self.id.to_string()
    }

    fn is_terminal(&self) -> bool {
        // A workflow needs no further control once parsing has concluded.
        !matches!(self.status, WorkflowStatus::Parsing)
    }
}

/// One unit of work for a controller.
#[derive(Debug)]
pub struct EvalEvent<E> {
    /// The controller key this event routes to.
    pub key: String,
    /// The event that triggered the evaluation (possibly synthetic).
    pub event: Event,
    /// The entity before the event, when known.
    pub old: Option<Arc<E>>,
    /// The entity after the event, when known.
    pub updated: Option<Arc<E>>,
}

impl<E> Clone for EvalEvent<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            event: self.event.clone(),
            old: self.old.clone(),
            updated: self.updated.clone(),
        }
    }
}

impl<E> From<Notification<E>> for EvalEvent<E> {
    fn from(notification: Notification<E>) -> Self {
        Self {
            key: notification.aggregate.id.clone(),
            event: notification.event,
            old: notification.old,
            updated: Some(notification.updated),
        }
    }
}

/// The outcome of one controller evaluation.
#[derive(Debug)]
pub enum EvalResult {
    /// The entity is terminal; unregister and close the controller.
    Done {
        /// Human-readable reason.
        reason: String,
    },
    /// The evaluation made progress (possibly none was needed).
    Success {
        /// Human-readable summary.
        message: String,
    },
    /// The evaluation failed with an engine error.
    Failed {
        /// The error that surfaced.
        error: Error,
    },
}

/// A per-key control loop.
#[async_trait]
pub trait Controller<E>: Send {
    /// Evaluates one event. Serialized per key by the owning system.
    async fn eval(&mut self, event: &EvalEvent<E>) -> EvalResult;

    /// Releases controller-held resources. Called when the controller is
    /// unregistered after `Done`, and on system shutdown.
    async fn close(&mut self) {}
}

/// Builds a controller for a key on first demand.
pub type ControllerFactory<E> =
    Box<dyn Fn(&EvalEvent<E>) -> crate::error::Result<Box<dyn Controller<E>>> + Send + Sync>;

/// Per-controller bookkeeping, exposed to the staleness sensor.
#[derive(Debug, Clone, Copy)]
pub struct ControllerStats {
    /// When the controller last finished an evaluation.
    pub last_evaluated_at: Instant,
    /// Consecutive failed evaluations.
    pub error_count: u32,
}

struct Registered<E> {
    controller: Box<dyn Controller<E>>,
    stats: ControllerStats,
}

struct SystemState<E> {
    pending: HashMap<String, EvalEvent<E>>,
    order: VecDeque<String>,
    active: HashSet<String>,
    controllers: HashMap<String, Registered<E>>,
}

impl<E> Default for SystemState<E> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            order: VecDeque::new(),
            active: HashSet::new(),
            controllers: HashMap::new(),
        }
    }
}

/// A registry of per-key controllers plus the coalescing eval queue.
pub struct System<E> {
    name: &'static str,
    factory: ControllerFactory<E>,
    state: Mutex<SystemState<E>>,
    notify: Notify,
    workers: usize,
    shutdown: AtomicBool,
}

impl<E: ControlledEntity> System<E> {
    /// Creates a system with `workers` concurrent evaluation workers.
    #[must_use]
    pub fn new(name: &'static str, workers: usize, factory: ControllerFactory<E>) -> Self {
        Self {
            name,
            factory,
            state: Mutex::new(SystemState::default()),
            notify: Notify::new(),
            workers: workers.max(1),
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SystemState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits an evaluation. Events for a key that is already queued
    /// replace the queued event (coalescing); events for a key that is
    /// currently evaluating queue exactly one follow-up evaluation.
    pub fn submit(&self, event: EvalEvent<E>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        {
            let mut state = self.lock();
            let key = event.key.clone();
            if state.pending.insert(key.clone(), event).is_none() {
                state.order.push_back(key);
            }
        }
        self.notify.notify_one();
    }

    /// Returns true if a controller is registered for `key`.
    #[must_use]
    pub fn is_registered(&self, key: &str) -> bool {
        self.lock().controllers.contains_key(key)
    }

    /// Returns the stats of every registered controller.
    #[must_use]
    pub fn stats(&self) -> Vec<(String, ControllerStats)> {
        self.lock()
            .controllers
            .iter()
            .map(|(key, registered)| (key.clone(), registered.stats))
            .collect()
    }

    /// Returns the number of queued evaluations.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Spawns the evaluation workers.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.workers)
            .map(|_| {
                let system = Arc::clone(self);
                tokio::spawn(async move { system.worker_loop().await })
            })
            .collect()
    }

    /// Stops accepting submissions and closes every registered controller.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_waiters();

        let mut controllers = {
            let mut state = self.lock();
            state.pending.clear();
            state.order.clear();
            std::mem::take(&mut state.controllers)
        };
        for registered in controllers.values_mut() {
            registered.controller.close().await;
        }
    }

    /// Takes the next evaluable job: the oldest queued key that is not
    /// currently active. Returns the key, its event, and the (possibly
    /// freshly built) controller.
    fn take_job(&self) -> Option<(String, EvalEvent<E>, Registered<E>)> {
        let mut state = self.lock();

        let position = state
            .order
            .iter()
            .position(|key| !state.active.contains(key))?;
        let key = state.order.remove(position)?;
        let event = state.pending.remove(&key)?;

        let registered = match state.controllers.remove(&key) {
            Some(existing) => existing,
            None => match (self.factory)(&event) {
                Ok(controller) => Registered {
                    controller,
                    stats: ControllerStats {
                        last_evaluated_at: Instant::now(),
                        error_count: 0,
                    },
                },
                Err(error) => {
                    tracing::warn!(
                        system = self.name,
                        key = %key,
                        %error,
                        "controller factory failed, dropping event"
                    );
                    return None;
                }
            },
        };

        state.active.insert(key.clone());
        Some((key, event, registered))
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }

            let Some((key, event, mut registered)) = self.take_job() else {
                // Re-check periodically: a notify can race the queue scan.
                tokio::select! {
                    () = self.notify.notified() => {}
                    () = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                }
                continue;
            };

            let result = registered.controller.eval(&event).await;
            registered.stats.last_evaluated_at = Instant::now();

            let outcome = match &result {
                EvalResult::Done { reason } => {
                    tracing::debug!(system = self.name, key = %key, reason = %reason, "controller done");
                    "done"
                }
                EvalResult::Success { message } => {
                    tracing::debug!(system = self.name, key = %key, message = %message, "controller evaluated");
                    registered.stats.error_count = 0;
                    "success"
                }
                EvalResult::Failed { error } => {
                    tracing::warn!(system = self.name, key = %key, %error, "controller evaluation failed");
                    registered.stats.error_count += 1;
                    "error"
                }
            };
            record_controller_eval(self.name, outcome);

            if matches!(result, EvalResult::Done { .. }) {
                self.lock().active.remove(&key);
                registered.controller.close().await;
            } else {
                let mut state = self.lock();
                state.active.remove(&key);
                state.controllers.insert(key.clone(), registered);
            }
            self.notify.notify_one();
        }
    }
}

impl<E> std::fmt::Debug for System<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Aggregate;
    use std::sync::atomic::AtomicUsize;
    use weft_core::InvocationId;

    #[derive(Clone)]
    struct TestEntity {
        key: String,
        terminal: bool,
    }

    impl ControlledEntity for TestEntity {
        fn key(&self) -> String {
            self.key.clone()
        }

        fn is_terminal(&self) -> bool {
            self.terminal
        }
    }

    struct CountingController {
        evals: Arc<AtomicUsize>,
        concurrent: Arc<AtomicUsize>,
        overlap: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Controller<TestEntity> for CountingController {
        async fn eval(&mut self, _event: &EvalEvent<TestEntity>) -> EvalResult {
            if self.concurrent.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.evals.fetch_add(1, Ordering::SeqCst);
            EvalResult::Success {
                message: "evaluated".into(),
            }
        }
    }

    fn test_event(key: &str) -> EvalEvent<TestEntity> {
        EvalEvent {
            key: key.to_string(),
            event: Event::refresh(Aggregate::invocation(InvocationId::generate())),
            old: None,
            updated: Some(Arc::new(TestEntity {
                key: key.to_string(),
                terminal: false,
            })),
        }
    }

    #[tokio::test]
    async fn evaluations_coalesce_per_key() {
        let evals = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let system = {
            let evals = evals.clone();
            let concurrent = concurrent.clone();
            let overlap = overlap.clone();
            Arc::new(System::new(
                "test",
                4,
                Box::new(move |_event| {
                    Ok(Box::new(CountingController {
                        evals: evals.clone(),
                        concurrent: concurrent.clone(),
                        overlap: overlap.clone(),
                    }) as Box<dyn Controller<TestEntity>>)
                }),
            ))
        };
        let _workers = system.start();

        // Ten submissions for one key while the first eval sleeps: they
        // collapse into at most a handful of evaluations, never overlap.
        for _ in 0..10 {
            system.submit(test_event("k1"));
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert!(!overlap.load(Ordering::SeqCst), "evals overlapped for a key");
        let count = evals.load(Ordering::SeqCst);
        assert!(count >= 1, "no evaluation ran");
        assert!(count <= 3, "coalescing failed: {count} evaluations");

        system.close().await;
    }

    #[tokio::test]
    async fn keys_evaluate_concurrently() {
        let evals = Arc::new(AtomicUsize::new(0));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let system = {
            let evals = evals.clone();
            let concurrent = concurrent.clone();
            let overlap = overlap.clone();
            Arc::new(System::new(
                "test",
                4,
                Box::new(move |_event| {
                    Ok(Box::new(CountingController {
                        evals: evals.clone(),
                        concurrent: concurrent.clone(),
                        overlap: overlap.clone(),
                    }) as Box<dyn Controller<TestEntity>>)
                }),
            ))
        };
        let _workers = system.start();

        for key in ["a", "b", "c", "d"] {
            system.submit(test_event(key));
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(evals.load(Ordering::SeqCst), 4);
        assert_eq!(system.stats().len(), 4);

        system.close().await;
    }

    #[tokio::test]
    async fn done_unregisters_the_controller() {
        struct DoneController;

        #[async_trait]
        impl Controller<TestEntity> for DoneController {
            async fn eval(&mut self, _event: &EvalEvent<TestEntity>) -> EvalResult {
                EvalResult::Done {
                    reason: "terminal".into(),
                }
            }
        }

        let system: Arc<System<TestEntity>> = Arc::new(System::new(
            "test",
            1,
            Box::new(|_event| Ok(Box::new(DoneController) as Box<dyn Controller<TestEntity>>)),
        ));
        let _workers = system.start();

        system.submit(test_event("k1"));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(!system.is_registered("k1"));
        system.close().await;
    }
}
