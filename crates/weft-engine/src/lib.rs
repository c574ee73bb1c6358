//! # weft-engine
//!
//! Execution core of the weft workflow engine.
//!
//! The engine drives user-defined directed-acyclic task graphs from
//! submission to a terminal state, dispatching ready tasks in parallel to
//! function runtimes and feeding their outputs back into downstream tasks.
//! It is built on four pillars:
//!
//! - **Event sourcing**: every mutation is an event appended to a
//!   per-aggregate ordered log; entity state is a deterministic fold
//!   ([`backend`], [`events`], [`projector`])
//! - **Rebuildable projections**: a bounded cache of projected entities,
//!   lazily rebuilt by replay and kept current by subscription ([`cache`],
//!   [`stores`])
//! - **Control loops**: one controller per active invocation, evaluated
//!   through a per-key coalescing work queue fed by sensors ([`controller`])
//! - **Cooperative scheduling**: a pure scheduler policy decides which tasks
//!   to run, pre-warm, or abort; a bounded grouped executor runs the
//!   resulting jobs ([`scheduler`], [`executor`])
//!
//! ## Guarantees
//!
//! - **Deterministic**: replaying an aggregate's events from sequence 0
//!   always yields the same entity
//! - **Terminal is terminal**: a finished invocation never changes state
//! - **Single-flight**: at most one evaluation per invocation at any time
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use weft_core::{FunctionRef, TypedValue};
//! use weft_engine::backend::memory::MemoryBackend;
//! use weft_engine::config::EngineConfig;
//! use weft_engine::engine::Engine;
//! use weft_engine::invocation::InvocationSpec;
//! use weft_engine::workflow::{TaskSpec, WorkflowSpec};
//!
//! # async fn run() -> weft_engine::error::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let engine = Engine::start(EngineConfig::default(), backend).await?;
//!
//! let spec = WorkflowSpec::new()
//!     .task("hello", TaskSpec::new(FunctionRef::new("native", "noop")))
//!     .output_task("hello");
//! let workflow_id = engine.workflow_api().create(spec).await?;
//!
//! let invocation_id = engine
//!     .invocation_api()
//!     .invoke(InvocationSpec::new(workflow_id).input("name", TypedValue::string("weft")))
//!     .await?;
//! let done = engine.await_invocation(invocation_id, None).await?;
//! assert!(done.status.is_terminal());
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod dag;

pub mod api;
pub mod backend;
pub mod cache;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod expr;
pub mod invocation;
pub mod metrics;
pub mod projector;
pub mod pubsub;
pub mod runtime;
pub mod scheduler;
pub mod stores;
pub mod workflow;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::api::{InvocationApi, TaskApi, WorkflowApi};
    pub use crate::backend::memory::MemoryBackend;
    pub use crate::backend::{EventBackend, EventFilter};
    pub use crate::cache::{EntityCache, Notification};
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::events::{Aggregate, AggregateKind, Event, EventData, NewEvent};
    pub use crate::executor::{ExecutorTask, LocalExecutor};
    pub use crate::invocation::{Invocation, InvocationSpec, InvocationStatus, TaskInvocation};
    pub use crate::projector::{InvocationProjector, Projector, WorkflowProjector};
    pub use crate::runtime::{MetaResolver, Runtime, TaskInvocationSpec, TaskResult};
    pub use crate::scheduler::{DependencyScheduler, Schedule, SchedulerPolicy};
    pub use crate::stores::{EntityStore, Invocations, Workflows};
    pub use crate::workflow::{TaskSpec, Workflow, WorkflowSpec, WorkflowStatus};
}
