//! Typed entity stores: workflow- and invocation-shaped views over the
//! cache.
//!
//! Stores enforce the aggregate-kind invariant and hand out entities in
//! their concrete shape. Sensors and other kind-agnostic consumers use the
//! [`EntityStore`] trait; user-facing code uses the typed `get` methods.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use weft_core::{InvocationId, WorkflowId};

use crate::backend::EventBackend;
use crate::cache::{EntityCache, Notification};
use crate::error::Result;
use crate::events::{Aggregate, AggregateKind};
use crate::invocation::Invocation;
use crate::projector::{InvocationProjector, WorkflowProjector};
use crate::workflow::Workflow;

/// Kind-agnostic store surface used by sensors.
#[async_trait]
pub trait EntityStore<E>: Send + Sync {
    /// Returns the projected entity for an aggregate.
    async fn entity(&self, aggregate: &Aggregate) -> Result<Arc<E>>;

    /// Lists every aggregate of this store's kind.
    async fn list(&self) -> Result<Vec<Aggregate>>;

    /// Forces a cache replay for an aggregate.
    async fn refresh(&self, aggregate: &Aggregate) -> Result<Arc<E>>;

    /// Subscribes to entity-update notifications.
    fn subscribe(&self) -> mpsc::Receiver<Notification<E>>;
}

macro_rules! typed_store {
    ($(#[$doc:meta])* $name:ident, $projector:ty, $entity:ty, $id:ty, $kind:expr, $aggregate:path) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            cache: Arc<EntityCache<$projector>>,
            backend: Arc<dyn EventBackend>,
        }

        impl $name {
            /// Creates the store over a cache and its backend.
            #[must_use]
            pub fn new(cache: Arc<EntityCache<$projector>>, backend: Arc<dyn EventBackend>) -> Self {
                Self { cache, backend }
            }

            /// Returns the entity by id.
            ///
            /// # Errors
            ///
            /// Returns [`crate::error::Error::NotFound`] for unknown ids.
            pub async fn get(&self, id: $id) -> Result<Arc<$entity>> {
                self.cache.get(&$aggregate(id)).await
            }
        }

        #[async_trait]
        impl EntityStore<$entity> for $name {
            async fn entity(&self, aggregate: &Aggregate) -> Result<Arc<$entity>> {
                self.cache.get(aggregate).await
            }

            async fn list(&self) -> Result<Vec<Aggregate>> {
                let mut aggregates = self.backend.list().await?;
                aggregates.retain(|a| a.kind == $kind);
                Ok(aggregates)
            }

            async fn refresh(&self, aggregate: &Aggregate) -> Result<Arc<$entity>> {
                self.cache.refresh(aggregate).await
            }

            fn subscribe(&self) -> mpsc::Receiver<Notification<$entity>> {
                self.cache.subscribe()
            }
        }
    };
}

typed_store!(
    /// Typed view over the workflow cache.
    Workflows,
    WorkflowProjector,
    Workflow,
    WorkflowId,
    AggregateKind::Workflow,
    Aggregate::workflow
);

typed_store!(
    /// Typed view over the invocation cache.
    Invocations,
    InvocationProjector,
    Invocation,
    InvocationId,
    AggregateKind::Invocation,
    Aggregate::invocation
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::error::Error;
    use crate::events::{EventData, NewEvent};
    use crate::workflow::{WorkflowSpec, WorkflowStatus};

    fn workflow_store(backend: Arc<MemoryBackend>) -> Workflows {
        let cache = Arc::new(EntityCache::new(
            backend.clone() as Arc<dyn EventBackend>,
            WorkflowProjector,
            16,
            16,
        ));
        Workflows::new(cache, backend as Arc<dyn EventBackend>)
    }

    #[tokio::test]
    async fn get_returns_projected_workflow() {
        let backend = Arc::new(MemoryBackend::new());
        let store = workflow_store(backend.clone());

        let id = WorkflowId::generate();
        backend
            .append(
                &Aggregate::workflow(id),
                NewEvent::new(EventData::WorkflowCreated {
                    spec: WorkflowSpec::new(),
                }),
            )
            .await
            .unwrap();

        let workflow = store.get(id).await.unwrap();
        assert_eq!(workflow.id, id);
        assert_eq!(workflow.status, WorkflowStatus::Parsing);
    }

    #[tokio::test]
    async fn get_unknown_id_is_not_found() {
        let backend = Arc::new(MemoryBackend::new());
        let store = workflow_store(backend);
        let result = store.get(WorkflowId::generate()).await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_filters_by_kind() {
        let backend = Arc::new(MemoryBackend::new());
        let store = workflow_store(backend.clone());

        let workflow_id = WorkflowId::generate();
        backend
            .append(
                &Aggregate::workflow(workflow_id),
                NewEvent::new(EventData::WorkflowCreated {
                    spec: WorkflowSpec::new(),
                }),
            )
            .await
            .unwrap();
        backend
            .append(
                &Aggregate::invocation(InvocationId::generate()),
                NewEvent::new(EventData::InvocationCanceled),
            )
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed, vec![Aggregate::workflow(workflow_id)]);
    }
}
