//! # weft-core
//!
//! Core abstractions for the weft workflow engine.
//!
//! This crate provides the foundational types shared by all weft components:
//!
//! - **Identifiers**: Strongly-typed ULID identifiers for workflows,
//!   invocations, and events
//! - **Typed Values**: The canonical value encoding used for task inputs and
//!   outputs, including expression and task-reference values
//! - **Function References**: The addressing scheme for functions across
//!   runtimes
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `weft-core` is the **only** crate allowed to define shared primitives.
//! The engine and any outer surfaces (API servers, CLIs) depend on this crate
//! for their wire-level contracts.
//!
//! ## Example
//!
//! ```rust
//! use weft_core::prelude::*;
//!
//! let workflow = WorkflowId::generate();
//! let fn_ref = FunctionRef::new("native", "noop");
//! let value = TypedValue::expr("$.Tasks.fetch.Output").unwrap();
//! assert!(value.is_expression());
//! # let _ = (workflow, fn_ref);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod fnref;
pub mod id;
pub mod value;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use weft_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::fnref::FunctionRef;
    pub use crate::id::{EventId, InvocationId, WorkflowId};
    pub use crate::value::{Expression, Input, Inputs, Segment, Selector, TypedValue};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use fnref::FunctionRef;
pub use id::{EventId, InvocationId, WorkflowId};
pub use value::{Expression, Input, Inputs, Segment, Selector, TypedValue};
