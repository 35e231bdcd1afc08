//! Value types for records
//!
//! A record holds one of three shapes of value, fixed by its [`ValueKind`]:
//! an opaque payload (`Write` records), a 32-bit integer (`Sum` and `Max`
//! records) or an ordered list of [`Entry`] (`List` records).
//!
//! Writes are buffered as [`Update`]s and folded into a value with
//! [`Value::apply`], the single place that defines SUM/MAX/WRITE/LIST
//! semantics for the shared store, the local store and the engines.

use crate::types::Key;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// How updates to a record combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Replace the value
    Write,
    /// Add to a 32-bit integer
    Sum,
    /// Keep the larger 32-bit integer
    Max,
    /// Insert into an ordered list
    List,
}

impl ValueKind {
    /// Value a record of this kind starts with when created by a write
    pub fn default_value(&self) -> Value {
        match self {
            ValueKind::Write => Value::Null,
            ValueKind::Sum | ValueKind::Max => Value::Int(0),
            ValueKind::List => Value::List(Vec::new()),
        }
    }

    /// Whether concurrent updates of this kind commute
    pub fn is_commutative(&self) -> bool {
        !matches!(self, ValueKind::Write)
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Write => f.write_str("WRITE"),
            ValueKind::Sum => f.write_str("SUM"),
            ValueKind::Max => f.write_str("MAX"),
            ValueKind::List => f.write_str("LIST"),
        }
    }
}

/// Element of a list record
///
/// Lists are ordered by `order`, highest first. `key` usually points at the
/// row the entry summarizes and `top` carries an application-defined number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    /// Sort position (descending)
    pub order: i64,
    /// Referenced key
    pub key: Key,
    /// Application payload
    pub top: i64,
}

impl Entry {
    /// Create an entry
    pub fn new(order: i64, key: Key, top: i64) -> Self {
        Self { order, key, top }
    }
}

/// Record value
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Value {
    /// Opaque record created without a payload
    #[default]
    Null,
    /// Serialized application payload
    Opaque(Vec<u8>),
    /// 32-bit integer for `Sum` and `Max` records
    Int(i32),
    /// Ordered entries for `List` records
    List(Vec<Entry>),
}

impl Value {
    /// Serialize an application value into an opaque payload
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, bincode::Error> {
        bincode::serialize(value).map(Value::Opaque)
    }

    /// Deserialize an opaque payload
    ///
    /// Returns `None` if this is not an opaque value or the bytes do not
    /// decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        match self {
            Value::Opaque(bytes) => bincode::deserialize(bytes).ok(),
            _ => None,
        }
    }

    /// Type name (for panic and log messages)
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Opaque(_) => "Opaque",
            Value::Int(_) => "Int",
            Value::List(_) => "List",
        }
    }

    /// Try to get as i32
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as a list
    pub fn as_list(&self) -> Option<&[Entry]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Try to get the opaque bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Opaque(b) => Some(b),
            _ => None,
        }
    }

    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Fold an update into this value
    ///
    /// # Panics
    ///
    /// A `Sum`/`Max` update on a non-integer value or an `Append` on a
    /// non-list value is a programming error and panics.
    pub fn apply(&mut self, update: &Update) {
        if let Update::Write(v) = update {
            *self = v.clone();
            return;
        }
        match (update, self) {
            (Update::Sum(d), Value::Int(cur)) => *cur = cur.wrapping_add(*d),
            (Update::Max(m), Value::Int(cur)) => {
                if *m > *cur {
                    *cur = *m;
                }
            }
            (Update::Append(e), Value::List(list)) => insert_ordered(list, *e),
            (update, current) => panic!(
                "cannot apply {} update to a {} value",
                update.kind(),
                current.type_name()
            ),
        }
    }
}

fn insert_ordered(list: &mut Vec<Entry>, entry: Entry) {
    // First position whose order is strictly lower; equal orders keep arrival order.
    let at = list.partition_point(|e| e.order >= entry.order);
    list.insert(at, entry);
}

/// A buffered write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Replace the value
    Write(Value),
    /// Add a delta
    Sum(i32),
    /// Raise to at least this value
    Max(i32),
    /// Insert an entry
    Append(Entry),
}

impl Update {
    /// Build an integer update for a `Sum` or `Max` kind
    ///
    /// # Panics
    ///
    /// Panics for `Write` and `List` kinds.
    pub fn int(kind: ValueKind, v: i32) -> Self {
        match kind {
            ValueKind::Sum => Update::Sum(v),
            ValueKind::Max => Update::Max(v),
            other => panic!("{} is not an integer kind", other),
        }
    }

    /// Kind of record this update targets
    pub fn kind(&self) -> ValueKind {
        match self {
            Update::Write(_) => ValueKind::Write,
            Update::Sum(_) => ValueKind::Sum,
            Update::Max(_) => ValueKind::Max,
            Update::Append(_) => ValueKind::List,
        }
    }
}
