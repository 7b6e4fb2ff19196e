#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::borrow::Borrow;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;

/// A tagged scalar flowing through blocks, keys and accumulator slots.
///
/// `Nothing` marks a missing value (e.g. an accumulator slot that has not been initialised yet);
/// `Null` is an explicit null coming from the data.
///
/// Equality and hashing are the grouping semantics: `-0.0` equals `0.0`, every NaN equals every
/// other NaN, and values with different tags never compare equal.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Nothing,
    Null,
    Boolean(bool),
    Int(i64),
    Number(#[serde(with = "f64_bits")] f64),
    String(Arc<str>),
    DateTime(i64),
}

/// Doubles are persisted by bit pattern so NaN and infinities survive the JSON spill format.
mod f64_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(v.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        u64::deserialize(d).map(f64::from_bits)
    }
}

pub(crate) fn canonical_f64_bits(v: f64) -> u64 {
    if v.is_nan() {
        f64::NAN.to_bits()
    } else if v == 0.0 {
        0
    } else {
        v.to_bits()
    }
}

impl Value {
    pub fn string(s: &str) -> Self {
        Value::String(Arc::from(s))
    }

    /// `true` for `Nothing` and `Null`.
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Nothing | Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Int(_) => "int",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::Nothing => 0,
            Value::Null => 1,
            Value::Boolean(_) => 2,
            Value::Int(_) => 3,
            Value::Number(_) => 4,
            Value::String(_) => 5,
            Value::DateTime(_) => 6,
        }
    }

    /// Rank used when ordering values of different types: missing < numbers < strings <
    /// booleans < datetimes.
    fn canonical_rank(&self) -> u8 {
        match self {
            Value::Nothing => 0,
            Value::Null => 1,
            Value::Int(_) | Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Boolean(_) => 4,
            Value::DateTime(_) => 5,
        }
    }

    /// Total order across all values, used by min/max style accumulators.
    ///
    /// Numbers compare numerically regardless of whether they are `Int` or `Number`; NaN sorts
    /// below every other number.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        let rank = self.canonical_rank().cmp(&other.canonical_rank());
        if rank != Ordering::Equal {
            return rank;
        }

        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.as_ref().cmp(b.as_ref()),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => match (x.is_nan(), y.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                },
                _ => Ordering::Equal,
            },
        }
    }

    /// Rough heap + inline footprint, used by the spill memory check.
    pub fn approx_size_bytes(&self) -> usize {
        let inline = mem::size_of::<Value>();
        match self {
            Value::String(s) => inline + s.len(),
            _ => inline,
        }
    }

    /// Appends an injective, canonical byte encoding of this value.
    ///
    /// Two values produce identical bytes iff they are equal under [`PartialEq`]. This is what
    /// the spill log orders records by, so partial aggregates for one key are adjacent.
    pub(crate) fn write_key_bytes(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            Value::Nothing | Value::Null => {}
            Value::Boolean(b) => out.push(u8::from(*b)),
            Value::Int(v) | Value::DateTime(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Number(v) => out.extend_from_slice(&canonical_f64_bits(*v).to_be_bytes()),
            Value::String(s) => {
                out.extend_from_slice(&(s.len() as u64).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nothing, Value::Nothing) | (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                canonical_f64_bits(*a) == canonical_f64_bits(*b)
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.tag());
        match self {
            Value::Nothing | Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Int(v) | Value::DateTime(v) => v.hash(state),
            Value::Number(v) => canonical_f64_bits(*v).hash(state),
            Value::String(s) => s.as_ref().hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

/// A fixed-width tuple of values: a group-by key or a row of accumulator states.
///
/// The unowned form is a plain `&[Value]`; the hash table is searched with slices and only
/// converts to an owned row (deep copy) when inserting a new key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MaterializedRow(SmallVec<[Value; 4]>);

impl MaterializedRow {
    /// A row of `width` uninitialised (`Nothing`) slots.
    pub fn new(width: usize) -> Self {
        Self(SmallVec::from_elem(Value::Nothing, width))
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        Self(values.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [Value] {
        &mut self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    pub fn approx_size_bytes(&self) -> usize {
        let spilled_heap = if self.0.spilled() {
            self.0.capacity() * mem::size_of::<Value>()
        } else {
            0
        };
        mem::size_of::<Self>()
            + spilled_heap
            + self
                .0
                .iter()
                .map(|v| v.approx_size_bytes() - mem::size_of::<Value>())
                .sum::<usize>()
    }
}

impl PartialEq for MaterializedRow {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for MaterializedRow {}

impl Hash for MaterializedRow {
    // Must hash exactly like `[Value]` so slice lookups find owned keys.
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl Borrow<[Value]> for MaterializedRow {
    fn borrow(&self) -> &[Value] {
        self.as_slice()
    }
}

impl From<&[Value]> for MaterializedRow {
    fn from(values: &[Value]) -> Self {
        Self(SmallVec::from(values))
    }
}

impl From<Vec<Value>> for MaterializedRow {
    fn from(values: Vec<Value>) -> Self {
        Self(SmallVec::from_vec(values))
    }
}

impl IntoIterator for MaterializedRow {
    type Item = Value;
    type IntoIter = smallvec::IntoIter<[Value; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl std::ops::Index<usize> for MaterializedRow {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        &self.0[idx]
    }
}
