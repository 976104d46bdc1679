//! Arena of heap objects.
//!
//! Every object that is not an immediate [`Value`] lives here and is addressed
//! by a [`HeapId`]. Collection is out of scope, so slots are never reused while
//! a runtime is alive: a `HeapId` stays valid for the runtime's whole lifetime.

use std::{borrow::Cow, rc::Rc, sync::Arc};

use num_bigint::BigInt;

use crate::{
    code::CodeUnit,
    protocol::HostObject,
    resource::{ResourceError, ResourceTracker},
    types::{AsyncGenAwaitable, Cell, Dict, ExceptionObject, Function, Generator, Range, SeqIter, Slice},
    value::Value,
};

/// Handle to an object in the [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct HeapId(u32);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// A method looked up on a built-in object, waiting to be called.
#[derive(Debug, Clone)]
pub(crate) struct BoundMethod {
    pub receiver: Value,
    pub name: String,
}

/// Payload of one heap slot.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(String),
    /// Integers that do not fit in an `i64`.
    LongInt(BigInt),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Dict),
    Range(Range),
    Slice(Slice),
    Iter(SeqIter),
    Cell(Cell),
    Code(Arc<CodeUnit>),
    Function(Function),
    BoundMethod(BoundMethod),
    Exception(ExceptionObject),
    Generator(Generator),
    /// A value yielded by an async generator body, as marked by `AsyncGenWrap`.
    AsyncGenWrapped(Value),
    AsyncGenAwaitable(AsyncGenAwaitable),
    Host(Rc<dyn HostObject>),
}

impl HeapData {
    /// The language-level type name, as used in error messages.
    pub fn type_name(&self) -> Cow<'static, str> {
        match self {
            Self::Str(_) => "str".into(),
            Self::LongInt(_) => "int".into(),
            Self::Tuple(_) => "tuple".into(),
            Self::List(_) => "list".into(),
            Self::Dict(_) => "dict".into(),
            Self::Range(_) => "range".into(),
            Self::Slice(_) => "slice".into(),
            Self::Iter(it) => it.type_name().into(),
            Self::Cell(_) => "cell".into(),
            Self::Code(_) => "code".into(),
            Self::Function(_) => "function".into(),
            Self::BoundMethod(_) => "builtin_function_or_method".into(),
            Self::Exception(exc) => exc.exc_type.to_string().into(),
            Self::Generator(generator) => generator.kind.type_name().into(),
            Self::AsyncGenWrapped(_) => "async_generator_wrapped_value".into(),
            Self::AsyncGenAwaitable(awaitable) => awaitable.type_name().into(),
            Self::Host(host) => host.type_name().to_owned().into(),
        }
    }
}

/// The object arena, parameterized by the resource tracker that meters it.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<HeapData>,
    tracker: T,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            entries: Vec::new(),
            tracker,
        }
    }

    /// Allocates a new heap entry.
    ///
    /// Returns `Err(ResourceError)` if the allocation would exceed configured limits.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        self.tracker.on_allocate()?;
        let index = u32::try_from(self.entries.len()).map_err(|_| ResourceError::Allocation {
            limit: u32::MAX as usize,
            count: self.entries.len(),
        })?;
        self.entries.push(data);
        Ok(HeapId(index))
    }

    /// Returns the data stored at `id`.
    ///
    /// # Panics
    /// Panics if `id` was not produced by this heap.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.entries.get(id.index()).expect("Heap::get: slot missing")
    }

    /// Returns the data stored at `id` for mutation.
    ///
    /// # Panics
    /// Panics if `id` was not produced by this heap.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.entries.get_mut(id.index()).expect("Heap::get_mut: slot missing")
    }

    /// Returns the data at a raw index, or `None` for an index this heap never issued.
    pub fn get_raw(&self, raw: u32) -> Option<&HeapData> {
        self.entries.get(raw as usize)
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Allocates a string and returns it as a value.
    pub fn alloc_str(&mut self, s: impl Into<String>) -> Result<Value, ResourceError> {
        self.allocate(HeapData::Str(s.into())).map(Value::Ref)
    }

    pub fn alloc_tuple(&mut self, items: Vec<Value>) -> Result<Value, ResourceError> {
        self.allocate(HeapData::Tuple(items)).map(Value::Ref)
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Result<Value, ResourceError> {
        self.allocate(HeapData::List(items)).map(Value::Ref)
    }

    /// Returns the string at `value` if it is a `str`.
    pub fn as_str(&self, value: Value) -> Option<&str> {
        match value {
            Value::Ref(id) => match self.get(id) {
                HeapData::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// Returns the exception object at `id`.
    pub fn exception(&self, id: HeapId) -> Option<&ExceptionObject> {
        match self.get(id) {
            HeapData::Exception(exc) => Some(exc),
            _ => None,
        }
    }

    pub fn exception_mut(&mut self, id: HeapId) -> Option<&mut ExceptionObject> {
        match self.get_mut(id) {
            HeapData::Exception(exc) => Some(exc),
            _ => None,
        }
    }

    pub fn generator(&self, id: HeapId) -> Option<&Generator> {
        match self.get(id) {
            HeapData::Generator(generator) => Some(generator),
            _ => None,
        }
    }

    pub fn generator_mut(&mut self, id: HeapId) -> Option<&mut Generator> {
        match self.get_mut(id) {
            HeapData::Generator(generator) => Some(generator),
            _ => None,
        }
    }

    pub fn cell_mut(&mut self, id: HeapId) -> Option<&mut Cell> {
        match self.get_mut(id) {
            HeapData::Cell(cell) => Some(cell),
            _ => None,
        }
    }
}
