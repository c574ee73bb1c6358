//! Strongly-typed identifiers for weft entities.
//!
//! All identifiers in weft are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! Task identifiers are deliberately *not* defined here: a task id is the
//! name a user gives a node in a workflow definition, so it stays a plain
//! `String` key.
//!
//! # Example
//!
//! ```rust
//! use weft_core::id::{InvocationId, WorkflowId};
//!
//! let workflow = WorkflowId::generate();
//! let invocation = InvocationId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: WorkflowId = invocation;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            ///
            /// Uses ULID generation which is:
            /// - Lexicographically sortable by creation time
            /// - Globally unique without coordination
            /// - URL-safe and case-insensitive
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
                chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                })
            }
        }
    };
}

ulid_id!(
    /// A unique identifier for a workflow definition.
    ///
    /// Workflows are the static task-graph definitions the engine executes.
    WorkflowId,
    "workflow"
);

ulid_id!(
    /// A unique identifier for a workflow invocation.
    ///
    /// An invocation is one runtime execution of a workflow, from submission
    /// to a terminal state.
    InvocationId,
    "invocation"
);

ulid_id!(
    /// A unique identifier for an event in the event log.
    EventId,
    "event"
);
