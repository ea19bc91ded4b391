// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The value data model.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

/// Opaque shared payload, downcast by type identity. Compares by pointer.
pub type SharedData = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("incompatible type: expected {expected}, got {found}")]
    IncompatibleType {
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("incompatible shared data type")]
    IncompatibleData,

    #[error("number out of range")]
    OutOfRange,

    #[error("unknown key: {0}")]
    UnknownKey(String),

    #[error("index {index} out of bounds (len {len})")]
    OutOfBounds { index: usize, len: usize },
}

/// Discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Integer,
    Real,
    Buffer,
    Object,
    Data,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Integer => "integer",
            ValueKind::Real => "real",
            ValueKind::Buffer => "buffer",
            ValueKind::Object => "object",
            ValueKind::Data => "data",
        }
    }

    /// Parse the name produced by [`ValueKind::name`].
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "null" => ValueKind::Null,
            "integer" => ValueKind::Integer,
            "real" => ValueKind::Real,
            "buffer" => ValueKind::Buffer,
            "object" => ValueKind::Object,
            "data" => ValueKind::Data,
            _ => return None,
        })
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable shared byte span.
#[derive(Debug, Clone)]
pub struct ByteBuf {
    bytes: Arc<[u8]>,
}

impl ByteBuf {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The bytes as UTF-8, if they are.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

impl PartialEq for ByteBuf {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for ByteBuf {}

impl<'a> From<&'a [u8]> for ByteBuf {
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

impl From<Vec<u8>> for ByteBuf {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Immutable ordered sequence of `(key, value)` pairs. Lookup by index
/// or by first matching key; arrays are records with empty keys.
#[derive(Debug, Clone)]
pub struct Record {
    pairs: Arc<[(String, Value)]>,
}

impl Record {
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        Self {
            pairs: pairs.into(),
        }
    }

    pub fn builder() -> RecordBuilder {
        RecordBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.pairs.iter()
    }

    /// Value at `index`.
    pub fn at(&self, index: usize) -> Result<&Value, ValueError> {
        self.pairs
            .get(index)
            .map(|(_, v)| v)
            .ok_or(ValueError::OutOfBounds {
                index,
                len: self.pairs.len(),
            })
    }

    /// Value under the first pair whose key matches.
    pub fn get(&self, key: &str) -> Result<&Value, ValueError> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or_else(|| ValueError::UnknownKey(key.to_string()))
    }

    /// Like [`Record::get`], with a default on a missing key.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.get(key).unwrap_or(default)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.pairs.len() == other.pairs.len()
            && self
                .pairs
                .iter()
                .zip(other.pairs.iter())
                .all(|(a, b)| a.0 == b.0 && a.1 == b.1)
    }
}

/// Order-preserving record builder; re-inserting a key overwrites its
/// value but keeps the original position.
#[derive(Default)]
pub struct RecordBuilder {
    pairs: IndexMap<String, Value>,
}

impl RecordBuilder {
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pairs.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Record {
        Record::from_pairs(self.pairs.into_iter().collect())
    }
}

/// A value message.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Real(f64),
    Buffer(ByteBuf),
    Object(Record),
    Data(SharedData),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Integer(v) => f.debug_tuple("Integer").field(v).finish(),
            Value::Real(v) => f.debug_tuple("Real").field(v).finish(),
            Value::Buffer(v) => f.debug_tuple("Buffer").field(v).finish(),
            Value::Object(v) => f.debug_tuple("Object").field(v).finish(),
            Value::Data(v) => f
                .debug_tuple("Data")
                .field(&(Arc::as_ptr(v) as *const u8))
                .finish(),
        }
    }
}

impl Value {
    /// Buffer value copied out of `bytes`.
    pub fn buffer(bytes: impl Into<ByteBuf>) -> Self {
        Value::Buffer(bytes.into())
    }

    /// Buffer value holding `text`'s UTF-8 bytes.
    pub fn text(text: &str) -> Self {
        Value::Buffer(ByteBuf::new(text.as_bytes()))
    }

    /// Object value from `(key, value)` pairs.
    pub fn object<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Object(Record::from_pairs(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    /// Array value: an object whose keys are all empty.
    pub fn array<V: Into<Value>>(items: impl IntoIterator<Item = V>) -> Self {
        Value::Object(Record::from_pairs(
            items
                .into_iter()
                .map(|v| (String::new(), v.into()))
                .collect(),
        ))
    }

    /// Opaque shared payload.
    pub fn data<D: Any + Send + Sync>(payload: D) -> Self {
        Value::Data(Arc::new(payload))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Integer(_) => ValueKind::Integer,
            Value::Real(_) => ValueKind::Real,
            Value::Buffer(_) => ValueKind::Buffer,
            Value::Object(_) => ValueKind::Object,
            Value::Data(_) => ValueKind::Data,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn mismatch(&self, expected: ValueKind) -> ValueError {
        ValueError::IncompatibleType {
            expected,
            found: self.kind(),
        }
    }

    pub fn as_integer(&self) -> Result<i64, ValueError> {
        match self {
            Value::Integer(v) => Ok(*v),
            _ => Err(self.mismatch(ValueKind::Integer)),
        }
    }

    pub fn as_real(&self) -> Result<f64, ValueError> {
        match self {
            Value::Real(v) => Ok(*v),
            _ => Err(self.mismatch(ValueKind::Real)),
        }
    }

    pub fn as_buffer(&self) -> Result<&ByteBuf, ValueError> {
        match self {
            Value::Buffer(v) => Ok(v),
            _ => Err(self.mismatch(ValueKind::Buffer)),
        }
    }

    pub fn as_object(&self) -> Result<&Record, ValueError> {
        match self {
            Value::Object(v) => Ok(v),
            _ => Err(self.mismatch(ValueKind::Object)),
        }
    }

    /// Numeric reading as a real; integers widen.
    pub fn num_real(&self) -> Result<f64, ValueError> {
        match self {
            Value::Integer(v) => Ok(*v as f64),
            Value::Real(v) => Ok(*v),
            _ => Err(self.mismatch(ValueKind::Real)),
        }
    }

    /// Numeric reading as an integer; reals convert when integral and in
    /// range.
    pub fn num_integer(&self) -> Result<i64, ValueError> {
        match self {
            Value::Integer(v) => Ok(*v),
            Value::Real(v) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 {
                    Ok(*v as i64)
                } else {
                    Err(ValueError::OutOfRange)
                }
            }
            _ => Err(self.mismatch(ValueKind::Integer)),
        }
    }

    /// Downcast the opaque payload by type.
    pub fn downcast_data<D: Any + Send + Sync>(&self) -> Result<Arc<D>, ValueError> {
        match self {
            Value::Data(payload) => payload
                .clone()
                .downcast::<D>()
                .map_err(|_| ValueError::IncompatibleData),
            _ => Err(self.mismatch(ValueKind::Data)),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Data(a), Value::Data(b)) => Arc::ptr_eq(a, b),
            _ => false,
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

impl From<ByteBuf> for Value {
    fn from(v: ByteBuf) -> Self {
        Value::Buffer(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Object(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_null() {
        assert!(Value::default().is_null());
        assert_eq!(Value::default(), Value::Null);
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            ValueKind::Null,
            ValueKind::Integer,
            ValueKind::Real,
            ValueKind::Buffer,
            ValueKind::Object,
            ValueKind::Data,
        ] {
            assert_eq!(ValueKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(ValueKind::parse("bogus"), None);
    }

    #[test]
    fn typed_accessors_check_the_tag() {
        assert_eq!(Value::Integer(7).as_integer(), Ok(7));
        assert!(matches!(
            Value::Null.as_integer(),
            Err(ValueError::IncompatibleType {
                expected: ValueKind::Integer,
                found: ValueKind::Null,
            })
        ));
        assert_eq!(Value::Real(1.5).as_real(), Ok(1.5));
    }

    #[test]
    fn numeric_casts_widen_and_narrow() {
        assert_eq!(Value::Integer(4).num_real(), Ok(4.0));
        assert_eq!(Value::Real(4.0).num_integer(), Ok(4));
        assert_eq!(Value::Real(4.5).num_integer(), Err(ValueError::OutOfRange));
        assert_eq!(
            Value::Real(f64::INFINITY).num_integer(),
            Err(ValueError::OutOfRange)
        );
    }

    #[test]
    fn buffer_is_shared_and_structurally_equal() {
        let a = Value::buffer(vec![1u8, 2, 3]);
        let b = Value::buffer(vec![1u8, 2, 3]);
        assert_eq!(a, b);

        let c = a.clone();
        assert_eq!(a, c);
        assert_eq!(Value::text("hi").as_buffer().unwrap().as_str(), Some("hi"));
    }

    #[test]
    fn object_lookup_by_index_and_key() {
        let obj = Value::object([("x", Value::Integer(1)), ("y", Value::Integer(2))]);
        let record = obj.as_object().unwrap();
        assert_eq!(record.at(0).unwrap(), &Value::Integer(1));
        assert_eq!(record.get("y").unwrap(), &Value::Integer(2));
        assert!(matches!(record.at(5), Err(ValueError::OutOfBounds { .. })));
        assert!(matches!(record.get("z"), Err(ValueError::UnknownKey(_))));
        assert_eq!(record.get_or("z", &Value::Null), &Value::Null);
    }

    #[test]
    fn duplicate_keys_resolve_to_first_match() {
        let record = Record::from_pairs(vec![
            ("k".to_string(), Value::Integer(1)),
            ("k".to_string(), Value::Integer(2)),
        ]);
        assert_eq!(record.get("k").unwrap(), &Value::Integer(1));
    }

    #[test]
    fn builder_preserves_insertion_order_and_overwrites() {
        let record = Record::builder()
            .field("a", Value::Integer(1))
            .field("b", Value::Integer(2))
            .field("a", Value::Integer(3))
            .build();
        assert_eq!(record.len(), 2);
        assert_eq!(record.at(0).unwrap(), &Value::Integer(3));
        assert_eq!(record.at(1).unwrap(), &Value::Integer(2));
    }

    #[test]
    fn array_uses_empty_keys() {
        let arr = Value::array([Value::Integer(1), Value::Null]);
        let record = arr.as_object().unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.iter().next().unwrap().0, "");
    }

    #[test]
    fn shared_data_compares_by_pointer() {
        struct Blob(#[allow(dead_code)] u32);

        let a = Value::data(Blob(1));
        let b = a.clone();
        assert_eq!(a, b);

        let c = Value::data(Blob(1));
        assert_ne!(a, c);

        let blob = a.downcast_data::<Blob>().unwrap();
        assert_eq!(blob.0, 1);
        assert!(a.downcast_data::<String>().is_err());
    }

    #[test]
    fn structural_equality_across_variants() {
        assert_ne!(Value::Integer(1), Value::Real(1.0));
        assert_eq!(
            Value::object([("k", Value::Integer(1))]),
            Value::object([("k", Value::Integer(1))])
        );
        assert_ne!(
            Value::object([("k", Value::Integer(1))]),
            Value::object([("k", Value::Integer(2))])
        );
    }
}
