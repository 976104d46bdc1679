//! Insertion-ordered dictionary keyed by normalized hashable values.

use ahash::RandomState;
use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive};

use crate::{
    builtins::Builtins,
    exception::{ExcType, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// Hashable projection of a value.
///
/// Values that compare equal map to the same key: `True`, `1` and `1.0` are one
/// key, as are equal strings and equal tuples. Objects without value equality
/// are keyed by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum DictKey {
    None,
    Int(i64),
    Big(BigInt),
    /// Bit pattern of a non-integral float.
    Float(u64),
    Str(String),
    Tuple(Vec<DictKey>),
    Builtin(Builtins),
    Identity(HeapId),
}

impl DictKey {
    /// Normalizes `value` into a key, raising `TypeError` for unhashable values.
    pub fn from_value(value: Value, heap: &Heap<impl ResourceTracker>) -> RunResult<Self> {
        let key = match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Int(i64::from(b)),
            Value::Int(i) => Self::Int(i),
            Value::Float(f) => Self::from_float(f),
            Value::Builtin(b) => Self::Builtin(b),
            Value::Undefined => return Err(RunError::internal("undefined value used as dict key")),
            Value::Ref(id) => match heap.get(id) {
                HeapData::Str(s) => Self::Str(s.clone()),
                HeapData::LongInt(b) => Self::from_bigint(b),
                HeapData::Tuple(items) => Self::Tuple(
                    items
                        .iter()
                        .map(|item| Self::from_value(*item, heap))
                        .collect::<RunResult<_>>()?,
                ),
                data @ (HeapData::List(_) | HeapData::Dict(_)) => {
                    return Err(ExcType::type_error(format!("unhashable type: '{}'", data.type_name())));
                }
                _ => Self::Identity(id),
            },
        };
        Ok(key)
    }

    fn from_float(f: f64) -> Self {
        if f.is_finite() && f.fract() == 0.0 {
            if let Some(i) = f.to_i64() {
                return Self::Int(i);
            }
            if let Some(b) = BigInt::from_f64(f) {
                return Self::Big(b);
            }
        }
        Self::Float(f.to_bits())
    }

    fn from_bigint(b: &BigInt) -> Self {
        b.to_i64().map_or_else(|| Self::Big(b.clone()), Self::Int)
    }
}

/// An insertion-ordered mapping. Entries keep the original key value for iteration.
#[derive(Debug, Clone, Default)]
pub(crate) struct Dict {
    map: IndexMap<DictKey, (Value, Value), RandomState>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &DictKey) -> Option<Value> {
        self.map.get(key).map(|(_, v)| *v)
    }

    pub fn contains(&self, key: &DictKey) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or replaces; an existing entry keeps its original key object and position.
    pub fn insert(&mut self, key: DictKey, key_value: Value, value: Value) {
        match self.map.get_mut(&key) {
            Some(entry) => entry.1 = value,
            None => {
                self.map.insert(key, (key_value, value));
            }
        }
    }

    pub fn remove(&mut self, key: &DictKey) -> Option<Value> {
        self.map.shift_remove(key).map(|(_, v)| v)
    }

    pub fn key_at(&self, index: usize) -> Option<Value> {
        self.map.get_index(index).map(|(_, (k, _))| *k)
    }

    pub fn items(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.map.values().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&DictKey, Value)> + '_ {
        self.map.iter().map(|(k, (_, v))| (k, *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = Value> + '_ {
        self.map.values().map(|(k, _)| *k)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.map.values().map(|(_, v)| *v)
    }

    /// Looks up a `str` key by its contents.
    pub fn get_str(&self, name: &str) -> Option<Value> {
        self.get(&DictKey::Str(name.to_owned()))
    }
}
