//! Shard keys, key patterns and key ranges
//!
//! A key pattern names the document fields that form the shard key. The
//! extracted shard key is an ordered tuple of [`KeyValue`]s, and ranges over
//! shard keys are half-open `[min, max)` intervals bounded by
//! [`RangeBound::Min`] / [`RangeBound::Max`] sentinels.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A stored document: a JSON object carrying a string `_id`
pub type Document = serde_json::Map<String, Value>;

/// Field holding the document identity
pub const ID_FIELD: &str = "_id";

/// Return the document id, rejecting documents without a string `_id`
pub fn document_id(doc: &Document) -> crate::Result<String> {
    match doc.get(ID_FIELD) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(crate::Error::InvalidDocument(
            "document requires a non-empty _id".into(),
        )),
    }
}

/// One component of a shard key. Variant order defines the sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl KeyValue {
    pub fn from_json(value: &Value) -> crate::Result<Self> {
        match value {
            Value::Null => Ok(KeyValue::Null),
            Value::Bool(b) => Ok(KeyValue::Bool(*b)),
            Value::Number(n) => n.as_i64().map(KeyValue::Int).ok_or_else(|| {
                crate::Error::InvalidKeyPattern(format!(
                    "shard key values must be integers, got {}",
                    n
                ))
            }),
            Value::String(s) => Ok(KeyValue::Str(s.clone())),
            other => Err(crate::Error::InvalidKeyPattern(format!(
                "unsupported shard key value: {}",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Null => Value::Null,
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => write!(f, "null"),
            KeyValue::Bool(b) => write!(f, "{}", b),
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Extracted shard key tuple
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    /// Parse a JSON scalar or array into a shard key
    pub fn from_json(value: &Value) -> crate::Result<Self> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(KeyValue::from_json)
                .collect::<crate::Result<Vec<_>>>()
                .map(ShardKey),
            scalar => Ok(ShardKey(vec![KeyValue::from_json(scalar)?])),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().map(KeyValue::to_json).collect())
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Ordered list of shard key fields
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPattern(pub Vec<String>);

impl KeyPattern {
    pub fn new<I, S>(fields: I) -> crate::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pattern = KeyPattern(fields.into_iter().map(Into::into).collect());
        pattern.validate()?;
        Ok(pattern)
    }

    /// Parse `"a,b"` into `["a", "b"]`
    pub fn parse(s: &str) -> crate::Result<Self> {
        Self::new(s.split(',').map(|f| f.trim().to_string()))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.0.is_empty() {
            return Err(crate::Error::InvalidKeyPattern(
                "key pattern must name at least one field".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.0 {
            if field.is_empty() || field.starts_with('$') {
                return Err(crate::Error::InvalidKeyPattern(format!(
                    "invalid key field: {:?}",
                    field
                )));
            }
            if !seen.insert(field.as_str()) {
                return Err(crate::Error::InvalidKeyPattern(format!(
                    "duplicate key field: {}",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Extract the shard key from a document. Missing fields are `Null`.
    pub fn extract(&self, doc: &Document) -> crate::Result<ShardKey> {
        self.0
            .iter()
            .map(|field| match doc.get(field) {
                Some(v) => KeyValue::from_json(v),
                None => Ok(KeyValue::Null),
            })
            .collect::<crate::Result<Vec<_>>>()
            .map(ShardKey)
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.join(", "))
    }
}

/// Range boundary. Variant order: `Min < Key(_) < Max`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RangeBound {
    Min,
    Key(ShardKey),
    Max,
}

impl RangeBound {
    fn cmp_key(&self, key: &ShardKey) -> Ordering {
        match self {
            RangeBound::Min => Ordering::Less,
            RangeBound::Key(k) => k.cmp(key),
            RangeBound::Max => Ordering::Greater,
        }
    }

    /// `null` → Min/Max by position is the caller's choice; everything else is a key.
    pub fn from_json(value: &Value, when_null: RangeBound) -> crate::Result<Self> {
        match value {
            Value::Null => Ok(when_null),
            Value::String(s) if s == "$min" => Ok(RangeBound::Min),
            Value::String(s) if s == "$max" => Ok(RangeBound::Max),
            other => ShardKey::from_json(other).map(RangeBound::Key),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RangeBound::Min => Value::String("$min".into()),
            RangeBound::Key(k) => k.to_json(),
            RangeBound::Max => Value::String("$max".into()),
        }
    }
}

impl fmt::Display for RangeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeBound::Min => write!(f, "MinKey"),
            RangeBound::Key(k) => write!(f, "{}", k),
            RangeBound::Max => write!(f, "MaxKey"),
        }
    }
}

/// Half-open key range `[min, max)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: RangeBound,
    pub max: RangeBound,
}

impl KeyRange {
    pub fn new(min: RangeBound, max: RangeBound) -> crate::Result<Self> {
        if min >= max {
            return Err(crate::Error::InvalidOptions(format!(
                "empty key range [{}, {})",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// The whole key space
    pub fn full() -> Self {
        Self {
            min: RangeBound::Min,
            max: RangeBound::Max,
        }
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        self.min.cmp_key(key) != Ordering::Greater && self.max.cmp_key(key) == Ordering::Greater
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// True if `other` lies entirely inside `self`
    pub fn covers(&self, other: &KeyRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
