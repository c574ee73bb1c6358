//! The canonical typed-value encoding for task inputs and outputs.
//!
//! Every value that crosses a component boundary in weft — workflow inputs,
//! task inputs, task outputs, invocation outputs — is a [`TypedValue`]. The
//! encoding supports plain data (primitives, arrays, maps) plus two special
//! forms that only have meaning inside the engine:
//!
//! - [`TypedValue::Expression`]: a selector such as `$.Tasks.fetch.Output`,
//!   resolved against an invocation scope before dispatch. Expression values
//!   carry both the source text and the parsed selector.
//! - [`TypedValue::TaskRef`]: a shorthand reference to another task's output.
//!
//! The JSON wire form is adjacently tagged so that plain data and the special
//! forms never collide:
//!
//! ```json
//! { "type": "string", "value": "hello" }
//! { "type": "expression", "value": "$.Tasks.fetch.Output" }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// A single step in a selector path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A named field access (`.Output` or `["Output"]`).
    Field(String),
    /// A numeric array index (`[0]`).
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, ".{name}"),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A parsed selector path, rooted at `$`.
///
/// Selectors navigate the invocation scope: `$.Workflow`, `$.Invocation`,
/// `$.Tasks.<id>.Output`, `$.Parent...`. Parsing is strict; evaluation is
/// left to the engine's expression module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    segments: Vec<Segment>,
}

impl Selector {
    /// Parses a selector from its source text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpressionParse`] if the text is not a well-formed
    /// `$`-rooted path.
    pub fn parse(source: &str) -> Result<Self> {
        let err = |message: &str| Error::ExpressionParse {
            expression: source.to_string(),
            message: message.to_string(),
        };

        let mut chars = source.chars().peekable();
        if chars.next() != Some('$') {
            return Err(err("selector must start with '$'"));
        }

        let mut segments = Vec::new();
        while let Some(&c) = chars.peek() {
            match c {
                '.' => {
                    chars.next();
                    let mut name = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_alphanumeric() || c == '_' || c == '-' {
                            name.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if name.is_empty() {
                        return Err(err("expected field name after '.'"));
                    }
                    segments.push(Segment::Field(name));
                }
                '[' => {
                    chars.next();
                    match chars.peek() {
                        Some(&quote) if quote == '"' || quote == '\'' => {
                            chars.next();
                            let mut name = String::new();
                            loop {
                                match chars.next() {
                                    Some(c) if c == quote => break,
                                    Some(c) => name.push(c),
                                    None => return Err(err("unterminated quoted field")),
                                }
                            }
                            segments.push(Segment::Field(name));
                        }
                        Some(c) if c.is_ascii_digit() => {
                            let mut digits = String::new();
                            while let Some(&c) = chars.peek() {
                                if c.is_ascii_digit() {
                                    digits.push(c);
                                    chars.next();
                                } else {
                                    break;
                                }
                            }
                            let index = digits
                                .parse::<usize>()
                                .map_err(|_| err("index out of range"))?;
                            segments.push(Segment::Index(index));
                        }
                        _ => return Err(err("expected index or quoted field after '['")),
                    }
                    if chars.next() != Some(']') {
                        return Err(err("expected closing ']'"));
                    }
                }
                _ => return Err(err("expected '.' or '[' after segment")),
            }
        }

        Ok(Self { segments })
    }

    /// Returns the path segments in order.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for segment in &self.segments {
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

/// An expression value: selector source text plus its parsed form.
///
/// Expressions serialize as their source text; the parsed selector is
/// reconstructed on deserialization so the two can never diverge.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    /// The original source text, e.g. `$.Tasks.fetch.Output`.
    pub source: String,
    /// The parsed selector path.
    pub selector: Selector,
}

impl Expression {
    /// Parses an expression from its source text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpressionParse`] on malformed source.
    pub fn parse(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let selector = Selector::parse(&source)?;
        Ok(Self { source, selector })
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Self::parse(source).map_err(D::Error::custom)
    }
}

/// The canonical value type for workflow and task data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum TypedValue {
    /// The absence of a value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// An ordered list of values.
    Array(Vec<TypedValue>),
    /// A string-keyed map of values, ordered by key.
    Map(BTreeMap<String, TypedValue>),
    /// A selector expression, resolved against the invocation scope.
    Expression(Expression),
    /// A reference to another task's output by task id.
    TaskRef(String),
}

impl TypedValue {
    /// Creates a string value.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Parses an expression value from selector source text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpressionParse`] on malformed source.
    pub fn expr(source: impl Into<String>) -> Result<Self> {
        Ok(Self::Expression(Expression::parse(source)?))
    }

    /// Returns true if this value is an expression.
    #[must_use]
    pub const fn is_expression(&self) -> bool {
        matches!(self, Self::Expression(_))
    }

    /// Returns true if this value is plain data, i.e. contains no
    /// expression or task-reference anywhere in its structure.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        match self {
            Self::Expression(_) | Self::TaskRef(_) => false,
            Self::Array(items) => items.iter().all(Self::is_concrete),
            Self::Map(entries) => entries.values().all(Self::is_concrete),
            _ => true,
        }
    }

    /// Returns the string content, if this is a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts plain data into a `serde_json::Value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the value (or any nested value)
    /// is an unresolved expression or task reference: those have no data
    /// representation until the engine resolves them.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            Self::Null => Ok(serde_json::Value::Null),
            Self::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Self::Int(i) => Ok(serde_json::Value::from(*i)),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::serialization("non-finite float")),
            Self::String(s) => Ok(serde_json::Value::String(s.clone())),
            Self::Array(items) => items
                .iter()
                .map(Self::to_json)
                .collect::<Result<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
            Self::Expression(expr) => Err(Error::serialization(format!(
                "unresolved expression '{}' has no data form",
                expr.source
            ))),
            Self::TaskRef(task_id) => Err(Error::serialization(format!(
                "unresolved task reference '{task_id}' has no data form"
            ))),
        }
    }

    /// Converts a `serde_json::Value` into plain data.
    ///
    /// Numbers become `Int` when they fit `i64`, otherwise `Float`.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Collects the ids of tasks this value references, directly via
    /// [`TypedValue::TaskRef`] or through `$.Tasks.<id>...` selectors.
    ///
    /// Used by the scheduler to derive data-flow dependencies from input
    /// expressions.
    #[must_use]
    pub fn referenced_tasks(&self) -> BTreeSet<String> {
        let mut tasks = BTreeSet::new();
        self.collect_referenced_tasks(&mut tasks);
        tasks
    }

    fn collect_referenced_tasks(&self, tasks: &mut BTreeSet<String>) {
        match self {
            Self::TaskRef(task_id) => {
                tasks.insert(task_id.clone());
            }
            Self::Expression(expr) => {
                if let [Segment::Field(root), Segment::Field(task_id), ..] =
                    expr.selector.segments()
                {
                    if root == "Tasks" {
                        tasks.insert(task_id.clone());
                    }
                }
            }
            Self::Array(items) => {
                for item in items {
                    item.collect_referenced_tasks(tasks);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_referenced_tasks(tasks);
                }
            }
            _ => {}
        }
    }
}

/// A named task input: the value plus a resolution priority.
///
/// Inputs with a higher priority resolve first, so later expressions may
/// reference their resolved values through the scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    /// The input value; may be an expression.
    pub value: TypedValue,
    /// Resolution priority; higher resolves first. Defaults to 0.
    #[serde(default, skip_serializing_if = "is_default_priority")]
    pub priority: i32,
}

fn is_default_priority(priority: &i32) -> bool {
    *priority == 0
}

impl Input {
    /// Creates an input with the default priority.
    #[must_use]
    pub const fn new(value: TypedValue) -> Self {
        Self { value, priority: 0 }
    }

    /// Sets the resolution priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl From<TypedValue> for Input {
    fn from(value: TypedValue) -> Self {
        Self::new(value)
    }
}

/// A named set of task inputs, ordered by key.
pub type Inputs = BTreeMap<String, Input>;

/// Returns the inputs in resolution order: descending priority, then
/// ascending key for a stable tie-break.
#[must_use]
pub fn prioritized(inputs: &Inputs) -> Vec<(&String, &Input)> {
    let mut ordered: Vec<_> = inputs.iter().collect();
    ordered.sort_by(|(ka, a), (kb, b)| b.priority.cmp(&a.priority).then_with(|| ka.cmp(kb)));
    ordered
}
