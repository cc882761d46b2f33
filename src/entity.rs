//! Entity types - records, identities, and the typed entity mapping
//!
//! A [`Record`] is the untyped working representation of one entity instance:
//! an engine-assigned identity plus named field values. Caller-defined types
//! implement [`Entity`] to map between themselves and records, which is what
//! lets the operations facade be keyed by type instead of entity-name strings.

use crate::{Error, Result};
use std::collections::BTreeMap;

/// Identity of a record within a stack.
///
/// Instances attached by `insert` start out `Pending` (context-assigned,
/// unique within the stack); the store assigns a `Stored` rowid when the
/// enclosing save reaches disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordId {
    Pending(u64),
    Stored(i64),
}

impl RecordId {
    /// Whether this identity has been persisted
    pub fn is_stored(&self) -> bool {
        matches!(self, RecordId::Stored(_))
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordId::Pending(n) => write!(f, "pending:{n}"),
            RecordId::Stored(n) => write!(f, "stored:{n}"),
        }
    }
}

/// A single field value.
///
/// Variants mirror the storable [`FieldKind`](crate::schema::FieldKind)s.
/// References are held as `Integer` rowids or `Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
}

impl Value {
    /// Name of the variant, used in mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Bool(_) => "bool",
            Value::Uuid(_) => "uuid",
            Value::Json(_) => "json",
        }
    }

    /// Ordered comparison between values of comparable variants.
    ///
    /// Integer and real values compare numerically across variants; text
    /// compares lexicographically. Incomparable variants return `None`, which
    /// filters treat as "does not match".
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use Value::*;
        match (self, other) {
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Real(a), Real(b)) => a.partial_cmp(b),
            (Integer(a), Real(b)) => (*a as f64).partial_cmp(b),
            (Real(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            (Blob(a), Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

/// One entity instance: an identity plus named field values.
///
/// Records belong to exactly one context at a time; the context working sets
/// hold them keyed by entity name.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Get a field value
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a field value
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Iterate over (field, value) pairs in field-name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn require(&self, field: &str, expected: &'static str) -> Result<&Value> {
        self.get(field).ok_or(Error::ValueMismatch {
            field: field.to_string(),
            expected,
            actual: "absent",
        })
    }

    fn mismatch(field: &str, expected: &'static str, value: &Value) -> Error {
        Error::ValueMismatch {
            field: field.to_string(),
            expected,
            actual: value.type_name(),
        }
    }

    pub fn text(&self, field: &str) -> Result<&str> {
        match self.require(field, "text")? {
            Value::Text(s) => Ok(s),
            other => Err(Self::mismatch(field, "text", other)),
        }
    }

    pub fn integer(&self, field: &str) -> Result<i64> {
        match self.require(field, "integer")? {
            Value::Integer(n) => Ok(*n),
            other => Err(Self::mismatch(field, "integer", other)),
        }
    }

    pub fn real(&self, field: &str) -> Result<f64> {
        match self.require(field, "real")? {
            Value::Real(n) => Ok(*n),
            other => Err(Self::mismatch(field, "real", other)),
        }
    }

    pub fn boolean(&self, field: &str) -> Result<bool> {
        match self.require(field, "bool")? {
            Value::Bool(b) => Ok(*b),
            other => Err(Self::mismatch(field, "bool", other)),
        }
    }

    pub fn blob(&self, field: &str) -> Result<&[u8]> {
        match self.require(field, "blob")? {
            Value::Blob(b) => Ok(b),
            other => Err(Self::mismatch(field, "blob", other)),
        }
    }

    pub fn uuid(&self, field: &str) -> Result<uuid::Uuid> {
        match self.require(field, "uuid")? {
            Value::Uuid(u) => Ok(*u),
            other => Err(Self::mismatch(field, "uuid", other)),
        }
    }

    pub fn json(&self, field: &str) -> Result<&serde_json::Value> {
        match self.require(field, "json")? {
            Value::Json(v) => Ok(v),
            other => Err(Self::mismatch(field, "json", other)),
        }
    }

    /// Rowid a reference field points at, `None` when unset
    pub fn reference(&self, field: &str) -> Result<Option<i64>> {
        match self.require(field, "reference")? {
            Value::Null => Ok(None),
            Value::Integer(n) => Ok(Some(*n)),
            other => Err(Self::mismatch(field, "reference", other)),
        }
    }
}

/// The typed entity mapping.
///
/// `NAME` binds the implementing type to one entity definition in the loaded
/// schema at compile time; a `NAME` with no schema entry surfaces as
/// [`Error::UnknownEntity`] on first use.
pub trait Entity: Sized {
    /// Entity name in the schema
    const NAME: &'static str;

    /// Build a typed instance from a record
    fn from_record(record: &Record) -> Result<Self>;

    /// Lower the instance back into a record, identity included
    fn to_record(&self) -> Record;
}
