//! Function references: how tasks address functions across runtimes.
//!
//! A function reference names a function as `runtime://namespace/id` (or
//! `runtime://id` when the runtime has no namespacing). The engine dispatches
//! on the `runtime` discriminator; everything after it is opaque to the
//! engine and interpreted by the selected runtime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A reference to an externally resolvable function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRef {
    /// The runtime that owns the function (e.g. `native`, `workflow`).
    pub runtime: String,
    /// Optional namespace within the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The function identifier within the runtime (and namespace).
    pub id: String,
}

impl FunctionRef {
    /// Creates a reference without a namespace.
    #[must_use]
    pub fn new(runtime: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            namespace: None,
            id: id.into(),
        }
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}://{}/{}", self.runtime, ns, self.id),
            None => write!(f, "{}://{}", self.runtime, self.id),
        }
    }
}

impl FromStr for FunctionRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidFunctionRef {
            reference: s.to_string(),
            message: message.to_string(),
        };

        let (runtime, rest) = s
            .split_once("://")
            .ok_or_else(|| invalid("missing '://' separator"))?;
        if runtime.is_empty() {
            return Err(invalid("empty runtime"));
        }

        let (namespace, id) = match rest.split_once('/') {
            Some((ns, id)) => (Some(ns.to_string()), id),
            None => (None, rest),
        };
        if id.is_empty() {
            return Err(invalid("empty function id"));
        }
        if namespace.as_deref() == Some("") {
            return Err(invalid("empty namespace"));
        }

        Ok(Self {
            runtime: runtime.to_string(),
            namespace,
            id: id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_namespace() {
        let fn_ref = FunctionRef::new("native", "noop");
        assert_eq!(fn_ref.to_string(), "native://noop");
    }

    #[test]
    fn display_with_namespace() {
        let fn_ref = FunctionRef::new("lambda", "resize").with_namespace("images");
        assert_eq!(fn_ref.to_string(), "lambda://images/resize");
    }

    #[test]
    fn parse_roundtrips() {
        for src in ["native://noop", "lambda://images/resize", "workflow://01H0000000000000000000000A"] {
            let fn_ref: FunctionRef = src.parse().unwrap();
            assert_eq!(fn_ref.to_string(), src);
        }
    }

    #[test]
    fn parse_rejects_malformed_references() {
        for src in ["noop", "://noop", "native://", "native://ns/"] {
            let result: Result<FunctionRef> = src.parse();
            assert!(
                matches!(result, Err(Error::InvalidFunctionRef { .. })),
                "expected failure for {src:?}"
            );
        }
    }
}
