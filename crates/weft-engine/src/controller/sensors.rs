//! Sensors: the event sources feeding a control system's eval queue.
//!
//! Three sensors cooperate per domain:
//!
//! - the **notification sensor** forwards store update notifications — the
//!   fast path;
//! - the **store poll sensor** periodically lists aggregates, forces a cache
//!   refresh, and submits synthetic `Refresh` events for every non-terminal
//!   entity — compensating for dropped notifications;
//! - the **staleness sensor** re-submits `Refresh` for any registered
//!   controller whose last evaluation is too old — a liveness safety net for
//!   stuck controllers, not a correctness mechanism.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::{ControlledEntity, EvalEvent, System};
use crate::events::{Aggregate, AggregateKind, Event};
use crate::stores::EntityStore;

/// A running sensor: its task plus a shutdown signal.
pub struct SensorHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SensorHandle {
    /// Signals the sensor to stop and waits briefly for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(Duration::from_millis(250), self.task)
            .await
            .is_err()
        {
            tracing::debug!(sensor = self.name, "sensor did not stop in time");
        }
    }
}

impl std::fmt::Debug for SensorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Forwards store update notifications into the eval queue.
#[must_use]
pub fn notification_sensor<E: ControlledEntity>(
    store: Arc<dyn EntityStore<E>>,
    system: Arc<System<E>>,
) -> SensorHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let mut notifications = store.subscribe();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                notification = notifications.recv() => {
                    let Some(notification) = notification else { break };
                    system.submit(EvalEvent::from(notification));
                }
            }
        }
        tracing::debug!("notification sensor stopped");
    });

    SensorHandle {
        name: "notification",
        shutdown,
        task,
    }
}

/// Periodically lists the store, refreshes the cache, and submits synthetic
/// `Refresh` events for every non-terminal entity.
#[must_use]
pub fn store_poll_sensor<E: ControlledEntity>(
    store: Arc<dyn EntityStore<E>>,
    system: Arc<System<E>>,
    kind: AggregateKind,
    interval: Duration,
) -> SensorHandle {
    let (shutdown, mut stopped) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                _ = ticker.tick() => {}
            }

            let aggregates = match store.list().await {
                Ok(aggregates) => aggregates,
                Err(error) => {
                    tracing::warn!(%error, "store poll: list failed");
                    continue;
                }
            };

            for aggregate in aggregates {
                if aggregate.kind != kind {
                    tracing::warn!(%aggregate, "store poll: unexpected aggregate kind");
                    continue;
                }
                // Force a replay so the poll sees the latest state even
                // when notifications were dropped.
                let entity = match store.refresh(&aggregate).await {
                    Ok(entity) => entity,
                    Err(error) => {
                        tracing::warn!(%aggregate, %error, "store poll: refresh failed");
                        continue;
                    }
                };
                if entity.is_terminal() {
                    continue;
                }
                system.submit(EvalEvent {
                    key: aggregate.id.clone(),
                    event: Event::refresh(aggregate),
                    old: Some(Arc::clone(&entity)),
                    updated: Some(entity),
                });
            }
        }
        tracing::debug!("store poll sensor stopped");
    });

    SensorHandle {
        name: "store-poll",
        shutdown,
        task,
    }
}

/// Re-submits `Refresh` for registered controllers whose last evaluation is
/// older than `max_staleness`.
#[must_use]
pub fn staleness_sensor<E: ControlledEntity>(
    store: Arc<dyn EntityStore<E>>,
    system: Arc<System<E>>,
    kind: AggregateKind,
    interval: Duration,
    max_staleness: Duration,
) -> SensorHandle {
    let (shutdown, mut stopped) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                _ = ticker.tick() => {}
            }

            for (key, stats) in system.stats() {
                if stats.last_evaluated_at.elapsed() < max_staleness {
                    continue;
                }
                if !system.is_registered(&key) {
                    continue;
                }

                let aggregate = Aggregate {
                    kind,
                    id: key.clone(),
                };
                let entity = match store.entity(&aggregate).await {
                    Ok(entity) => entity,
                    Err(error) => {
                        tracing::debug!(%aggregate, %error, "staleness poll: fetch failed");
                        continue;
                    }
                };
                if entity.is_terminal() {
                    continue;
                }

                tracing::debug!(%aggregate, "staleness poll: re-submitting stale controller");
                system.submit(EvalEvent {
                    key,
                    event: Event::refresh(aggregate),
                    old: Some(Arc::clone(&entity)),
                    updated: Some(entity),
                });
            }
        }
        tracing::debug!("staleness sensor stopped");
    });

    SensorHandle {
        name: "staleness",
        shutdown,
        task,
    }
}
