//! Rows - typed column maps keyed by a stable identifier

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::core::{Error, Result, TableKind};

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Decimal(Decimal),
    Bool(bool),
    Time(DateTime<Utc>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Decimal(d) => Some(*d),
            FieldValue::Int(i) => Some(Decimal::from(*i)),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Str(s) => f.write_str(s),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Decimal(d) => write!(f, "{}", d),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Time(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<Decimal> for FieldValue {
    fn from(v: Decimal) -> Self {
        FieldValue::Decimal(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Time(v)
    }
}

/// Sign of the last price step for one side of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Direction {
    Down,
    #[default]
    Flat,
    Up,
}

impl Direction {
    pub fn between(old: Decimal, new: Decimal) -> Self {
        match new.cmp(&old) {
            std::cmp::Ordering::Less => Direction::Down,
            std::cmp::Ordering::Equal => Direction::Flat,
            std::cmp::Ordering::Greater => Direction::Up,
        }
    }

    pub fn as_i8(&self) -> i8 {
        match self {
            Direction::Down => -1,
            Direction::Flat => 0,
            Direction::Up => 1,
        }
    }
}

/// Transient, client-side view state derived while applying offer updates.
/// Never sent to or read from the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PriceDelta {
    pub bid_direction: Direction,
    pub ask_direction: Direction,
    pub is_changed: bool,
}

/// One row of a server table.
///
/// Identity is the key column value, not object identity: two rows with the
/// same kind and id describe the same server record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    kind: TableKind,
    id: String,
    fields: BTreeMap<String, FieldValue>,
    delta: PriceDelta,
}

impl Row {
    pub fn new(kind: TableKind, id: impl Into<String>) -> Self {
        let id = id.into();
        let mut fields = BTreeMap::new();
        fields.insert(kind.key_column().to_string(), FieldValue::Str(id.clone()));
        Self {
            kind,
            id,
            fields,
            delta: PriceDelta::default(),
        }
    }

    /// Build a row from raw columns; the key column must be present.
    pub fn from_fields(kind: TableKind, fields: BTreeMap<String, FieldValue>) -> Result<Self> {
        let id = fields
            .get(kind.key_column())
            .and_then(FieldValue::as_str)
            .ok_or_else(|| {
                Error::Validation(format!("{} row without {}", kind, kind.key_column()))
            })?
            .to_string();
        Ok(Self {
            kind,
            id,
            fields,
            delta: PriceDelta::default(),
        })
    }

    pub fn with(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<FieldValue>) {
        if column == self.kind.key_column() {
            return;
        }
        self.fields.insert(column.to_string(), value.into());
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }

    pub fn str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(FieldValue::as_str)
    }

    pub fn decimal(&self, column: &str) -> Option<Decimal> {
        self.get(column).and_then(FieldValue::as_decimal)
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(FieldValue::as_int)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn delta(&self) -> PriceDelta {
        self.delta
    }

    pub(crate) fn set_delta(&mut self, delta: PriceDelta) {
        self.delta = delta;
    }

    pub(crate) fn clear_changed(&mut self) {
        self.delta.is_changed = false;
    }

    /// Overwrite the columns present in `other`, keeping the rest.
    /// Returns whether any stored value actually changed.
    pub(crate) fn merge_from(&mut self, other: &Row) -> bool {
        let mut changed = false;
        for (column, value) in &other.fields {
            if self.fields.get(column) != Some(value) {
                self.fields.insert(column.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }
}

/// Kind of mutation carried by a streamed table update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateOp {
    Insert,
    Update,
    Delete,
}

/// One streamed row mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct TableUpdate {
    pub op: UpdateOp,
    pub row: Row,
}

impl TableUpdate {
    pub fn insert(row: Row) -> Self {
        Self { op: UpdateOp::Insert, row }
    }

    pub fn update(row: Row) -> Self {
        Self { op: UpdateOp::Update, row }
    }

    pub fn delete(kind: TableKind, id: impl Into<String>) -> Self {
        Self {
            op: UpdateOp::Delete,
            row: Row::new(kind, id),
        }
    }

    pub fn kind(&self) -> TableKind {
        self.row.kind()
    }
}
