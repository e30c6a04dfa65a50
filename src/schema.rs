//! Response schemas
//!
//! Every endpoint declares the shape of its response up front as a tree of
//! `Schema` nodes. The entity store walks this tree when normalizing, so no
//! runtime type inspection of the payload is ever needed to find entities.

use serde_json::Value;
use thiserror::Error;

/// Kind of a primitive JSON value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    String,
    Number,
    Bool,
    /// Any JSON value, stored opaquely
    Any,
}

impl ScalarKind {
    /// Returns true if `value` is of this kind
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ScalarKind::String => value.is_string(),
            ScalarKind::Number => value.is_number(),
            ScalarKind::Bool => value.is_boolean(),
            ScalarKind::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ScalarKind::String => "a string",
            ScalarKind::Number => "a number",
            ScalarKind::Bool => "a boolean",
            ScalarKind::Any => "any value",
        }
    }
}

/// A named field of an object or entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub schema: Schema,
}

impl Field {
    pub const fn new(name: &'static str, schema: Schema) -> Self {
        Self { name, schema }
    }
}

/// A record type with a field schema and a primary key field
///
/// Entity types are declared as statics so that every schema referencing one
/// shares the same definition.
#[derive(Debug, PartialEq)]
pub struct EntityType {
    /// Type name, the first half of every record key
    pub name: &'static str,
    /// Field whose value identifies a record
    pub primary_key: &'static str,
    /// Declared fields, in order
    pub fields: &'static [Field],
}

impl EntityType {
    /// Extracts the primary key of `object`
    ///
    /// Numbers are accepted and rendered as strings.
    pub fn primary_key_of(&self, object: &serde_json::Map<String, Value>) -> Option<String> {
        match object.get(self.primary_key)? {
            Value::String(key) if !key.is_empty() => Some(key.clone()),
            Value::Number(key) => Some(key.to_string()),
            _ => None,
        }
    }
}

/// Tagged-variant description of a response shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Schema {
    Scalar(ScalarKind),
    /// Plain nested object, merged in place rather than normalized
    Object(&'static [Field]),
    /// Object stored in the entity store and replaced by a reference
    Entity(&'static EntityType),
    List(&'static Schema),
    /// Accepts `null` in addition to the inner shape
    Optional(&'static Schema),
}

impl Schema {
    /// Whether any entity can appear below this node
    pub fn contains_entities(&self) -> bool {
        match self {
            Schema::Scalar(_) => false,
            Schema::Entity(_) => true,
            Schema::Object(fields) => fields.iter().any(|f| f.schema.contains_entities()),
            Schema::List(inner) | Schema::Optional(inner) => inner.contains_entities(),
        }
    }
}

/// A response value that does not fit the declared schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("at {path}: {reason}")]
pub struct SchemaError {
    /// JSON path of the offending value, e.g. `$[2].job.cron`
    pub path: String,
    pub reason: String,
}

impl SchemaError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn expected(path: &str, kind: ScalarKind, found: &Value) -> Self {
        Self::new(path, format!("expected {}, found {}", kind.name(), describe(found)))
    }
}

/// Short human description of a JSON value's type
pub(crate) fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
