//! Owned values exchanged with the host.

use std::{fmt, rc::Rc};

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::{
    builtins::Builtins,
    exception::{ExcType, Exception, RunError, RunResult, SimpleException},
    heap::{Heap, HeapData, HeapId},
    protocol::HostObject,
    resource::ResourceTracker,
    types::{Dict, DictKey, ExceptionGroupData, ExceptionObject},
    value::Value,
};

/// A value passed to or returned from a [`Runtime`](crate::Runtime).
///
/// Plain data (numbers, strings, containers, exceptions) is copied out of the
/// runtime's heap. Objects with identity that have no owned form, such as
/// generators and functions, come back as a [`Handle`] that can be passed back
/// into the same runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    /// Integer too large for an `i64`.
    BigInt(BigInt),
    Float(f64),
    String(String),
    Tuple(Vec<Self>),
    List(Vec<Self>),
    /// Key-value pairs in insertion order.
    Dict(Vec<(Self, Self)>),
    /// A built-in exception class.
    ExcType(ExcType),
    Exception(Box<Exception>),
    /// Output-only rendering of a value that has no owned form.
    Repr(String),
    /// Reference to an object that lives in a runtime's heap.
    #[serde(skip)]
    Handle(Handle),
    /// An object implemented by the host.
    #[serde(skip)]
    Host(HostRef),
}

impl Object {
    /// Wraps a host object implementation.
    pub fn host(object: impl HostObject + 'static) -> Self {
        Self::Host(HostRef(Rc::new(object)))
    }

    #[must_use]
    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Self::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_exception(&self) -> Option<&Exception> {
        match self {
            Self::Exception(exc) => Some(exc),
            _ => None,
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::BigInt(b) => write!(f, "{b}"),
            Self::Float(v) => f.write_str(&crate::value::float_repr(*v)),
            Self::String(s) => f.write_str(s),
            Self::Tuple(items) => write_items(f, "(", items, ")"),
            Self::List(items) => write_items(f, "[", items, "]"),
            Self::Dict(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Self::ExcType(t) => write!(f, "<class '{t}'>"),
            Self::Exception(exc) => write!(f, "{exc}"),
            Self::Repr(s) => f.write_str(s),
            Self::Handle(handle) => f.write_str(handle.repr()),
            Self::Host(host) => f.write_str(&host.0.repr()),
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, open: &str, items: &[Object], close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    if open == "(" && items.len() == 1 {
        f.write_str(",")?;
    }
    f.write_str(close)
}

/// Reference to an object inside a specific runtime's heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    runtime: u64,
    id: u32,
    repr: String,
}

impl Handle {
    /// `repr()` of the object at the time the handle was created.
    #[must_use]
    pub fn repr(&self) -> &str {
        &self.repr
    }

    pub(crate) fn heap_id(&self, runtime: u64) -> Option<HeapId> {
        (self.runtime == runtime).then(|| HeapId::from_raw(self.id))
    }
}

/// Shared reference to a host object. Compares by identity.
#[derive(Clone)]
pub struct HostRef(pub Rc<dyn HostObject>);

impl HostRef {
    #[must_use]
    pub fn get(&self) -> &dyn HostObject {
        self.0.as_ref()
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostRef").field(&self.0).finish()
    }
}

impl PartialEq for HostRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Copies a value out of the heap.
pub(crate) fn to_object(value: Value, heap: &Heap<impl ResourceTracker>, runtime: u64) -> Object {
    let mut seen = Vec::new();
    to_object_inner(value, heap, runtime, &mut seen)
}

fn to_object_inner(value: Value, heap: &Heap<impl ResourceTracker>, runtime: u64, seen: &mut Vec<HeapId>) -> Object {
    let id = match value {
        Value::Undefined | Value::None => return Object::None,
        Value::Bool(b) => return Object::Bool(b),
        Value::Int(i) => return Object::Int(i),
        Value::Float(f) => return Object::Float(f),
        Value::Builtin(Builtins::ExcType(t)) => return Object::ExcType(t),
        Value::Builtin(_) => return Object::Repr(value.repr(heap)),
        Value::Ref(id) => id,
    };
    if let HeapData::Exception(_) = heap.get(id) {
        return Object::Exception(Box::new(exception_to_public_inner(id, heap, runtime, seen)));
    }
    if seen.contains(&id) {
        return Object::Repr(value.repr(heap));
    }
    seen.push(id);
    let object = match heap.get(id) {
        HeapData::Str(s) => Object::String(s.clone()),
        HeapData::LongInt(b) => Object::BigInt(b.clone()),
        HeapData::Tuple(items) => Object::Tuple(items.iter().map(|v| to_object_inner(*v, heap, runtime, seen)).collect()),
        HeapData::List(items) => Object::List(items.iter().map(|v| to_object_inner(*v, heap, runtime, seen)).collect()),
        HeapData::Dict(dict) => Object::Dict(
            dict.items()
                .map(|(k, v)| {
                    (
                        to_object_inner(k, heap, runtime, seen),
                        to_object_inner(v, heap, runtime, seen),
                    )
                })
                .collect(),
        ),
        HeapData::Host(host) => Object::Host(HostRef(Rc::clone(host))),
        _ => Object::Handle(Handle {
            runtime,
            id: id.raw(),
            repr: value.repr(heap),
        }),
    };
    seen.pop();
    object
}

/// Converts a heap exception and its whole chain into the public form.
pub(crate) fn exception_to_public(id: HeapId, heap: &Heap<impl ResourceTracker>, runtime: u64) -> Exception {
    exception_to_public_inner(id, heap, runtime, &mut Vec::new())
}

fn exception_to_public_inner(
    id: HeapId,
    heap: &Heap<impl ResourceTracker>,
    runtime: u64,
    seen: &mut Vec<HeapId>,
) -> Exception {
    let Some(exc) = heap.exception(id) else {
        return Exception::runtime_error("internal error: expected an exception object");
    };
    let args = exc.args.iter().map(|v| to_object_inner(*v, heap, runtime, seen)).collect();
    let mut public = Exception::from_parts(exc.exc_type, exc.message(heap), args);
    if !seen.contains(&id) {
        seen.push(id);
        let link = |link: Option<HeapId>, seen: &mut Vec<HeapId>| {
            link.filter(|l| !seen.contains(l))
                .map(|l| exception_to_public_inner(l, heap, runtime, seen))
        };
        let cause = link(exc.cause, seen);
        let context = link(exc.context, seen);
        public.set_chain(cause, context, exc.suppress_context);
        if let Some(group) = &exc.group {
            let leaves = group
                .exceptions
                .iter()
                .map(|leaf| exception_to_public_inner(*leaf, heap, runtime, seen))
                .collect();
            public.set_exceptions(leaves);
        }
        seen.pop();
    }
    public.set_traceback(exc.traceback.clone());
    public
}

/// Moves an owned object into the heap.
pub(crate) fn from_object(object: Object, heap: &mut Heap<impl ResourceTracker>, runtime: u64) -> RunResult<Value> {
    let value = match object {
        Object::None => Value::None,
        Object::Bool(b) => Value::Bool(b),
        Object::Int(i) => Value::Int(i),
        Object::BigInt(b) => Value::from_bigint(b, heap)?,
        Object::Float(f) => Value::Float(f),
        Object::String(s) => heap.alloc_str(s)?,
        Object::Tuple(items) => {
            let items = from_objects(items, heap, runtime)?;
            heap.alloc_tuple(items)?
        }
        Object::List(items) => {
            let items = from_objects(items, heap, runtime)?;
            heap.alloc_list(items)?
        }
        Object::Dict(pairs) => {
            let mut dict = Dict::new();
            for (k, v) in pairs {
                let key = from_object(k, heap, runtime)?;
                let value = from_object(v, heap, runtime)?;
                dict.insert(DictKey::from_value(key, heap)?, key, value);
            }
            Value::Ref(heap.allocate(HeapData::Dict(dict))?)
        }
        Object::ExcType(t) => Value::Builtin(Builtins::ExcType(t)),
        Object::Exception(exc) => Value::Ref(exception_from_public(*exc, heap, runtime)?),
        Object::Repr(s) => heap.alloc_str(s)?,
        Object::Handle(handle) => {
            let id = handle
                .heap_id(runtime)
                .filter(|id| heap.get_raw(id.raw()).is_some())
                .ok_or_else(|| ExcType::type_error("object handle belongs to a different runtime"))?;
            Value::Ref(id)
        }
        Object::Host(host) => Value::Ref(heap.allocate(HeapData::Host(host.0))?),
    };
    Ok(value)
}

pub(crate) fn from_objects(
    objects: Vec<Object>,
    heap: &mut Heap<impl ResourceTracker>,
    runtime: u64,
) -> RunResult<Vec<Value>> {
    objects.into_iter().map(|o| from_object(o, heap, runtime)).collect()
}

/// Allocates a public exception, its chain and its group leaves on the heap.
pub(crate) fn exception_from_public(
    exc: Exception,
    heap: &mut Heap<impl ResourceTracker>,
    runtime: u64,
) -> RunResult<HeapId> {
    let exc_type = exc.exc_type();
    let message = exc.message().map(str::to_owned);
    let cause = exc.cause().cloned().map(|c| exception_from_public(c, heap, runtime)).transpose()?;
    let context = exc.context().cloned().map(|c| exception_from_public(c, heap, runtime)).transpose()?;
    let suppress_context = exc.suppress_context();
    let traceback = exc.traceback().to_vec();
    let leaves = exc
        .exceptions()
        .iter()
        .cloned()
        .map(|leaf| exception_from_public(leaf, heap, runtime))
        .collect::<RunResult<Vec<_>>>()?;
    let args = from_objects(exc.into_args(), heap, runtime)?;

    let mut object = ExceptionObject::new(exc_type, args);
    if object.args.is_empty()
        && let Some(message) = message.clone()
    {
        object.args.push(heap.alloc_str(message)?);
    }
    object.cause = cause;
    object.context = context;
    object.suppress_context = suppress_context;
    object.traceback = traceback;
    if exc_type.is_group() {
        object.group = Some(ExceptionGroupData {
            message: message.unwrap_or_default(),
            exceptions: leaves,
        });
    }
    Ok(heap.allocate(HeapData::Exception(object))?)
}

impl From<SimpleException> for Exception {
    fn from(exc: SimpleException) -> Self {
        let exc_type = exc.exc_type();
        Self::new(exc_type, exc.into_message())
    }
}

/// Converts an error that escaped every frame into the public form.
pub(crate) fn run_error_to_public(err: RunError, heap: &Heap<impl ResourceTracker>, runtime: u64) -> Exception {
    match err {
        RunError::Internal(msg) => Exception::runtime_error(format!("internal error: {msg}")),
        RunError::Exc(exc) | RunError::Uncatchable(exc) => (*exc).into(),
        RunError::Raised(raise) => exception_to_public(raise.id, heap, runtime),
    }
}
