//! Exception instances as heap objects.

use crate::{
    exception::{ExcType, RunResult, SimpleException, StackFrame},
    heap::{Heap, HeapData, HeapId},
    resource::ResourceTracker,
    value::Value,
};

/// The nested exceptions of an exception group.
#[derive(Debug, Clone)]
pub(crate) struct ExceptionGroupData {
    pub message: String,
    pub exceptions: Vec<HeapId>,
}

/// A raised (or raisable) exception instance.
#[derive(Debug, Clone)]
pub(crate) struct ExceptionObject {
    pub exc_type: ExcType,
    pub args: Vec<Value>,
    /// Explicit `raise ... from cause`.
    pub cause: Option<HeapId>,
    /// The exception being handled when this one was raised.
    pub context: Option<HeapId>,
    pub suppress_context: bool,
    /// Frames the exception passed through, outermost first.
    pub traceback: Vec<StackFrame>,
    /// Serial of the activation that added the newest traceback entry.
    pub traced_frame: Option<u64>,
    pub group: Option<ExceptionGroupData>,
}

impl ExceptionObject {
    pub fn new(exc_type: ExcType, args: Vec<Value>) -> Self {
        Self {
            exc_type,
            args,
            cause: None,
            context: None,
            suppress_context: false,
            traceback: Vec::new(),
            traced_frame: None,
            group: None,
        }
    }

    /// Allocates an exception from its class and optional message.
    pub fn allocate(heap: &mut Heap<impl ResourceTracker>, exc: SimpleException) -> RunResult<HeapId> {
        let exc_type = exc.exc_type();
        let args = match exc.into_message() {
            Some(msg) => vec![heap.alloc_str(msg)?],
            None => Vec::new(),
        };
        Ok(heap.allocate(HeapData::Exception(Self::new(exc_type, args)))?)
    }

    /// Allocates a `StopIteration` carrying `value`; `None` produces a bare one.
    pub fn stop_iteration(heap: &mut Heap<impl ResourceTracker>, value: Value) -> RunResult<HeapId> {
        let args = if value == Value::None { Vec::new() } else { vec![value] };
        Ok(heap.allocate(HeapData::Exception(Self::new(ExcType::StopIteration, args)))?)
    }

    /// `str(exc)`: empty for no arguments, the argument's `str()` for one, else the args tuple repr.
    pub fn message(&self, heap: &Heap<impl ResourceTracker>) -> Option<String> {
        if let Some(group) = &self.group {
            return Some(group.message.clone());
        }
        match self.args.as_slice() {
            [] => None,
            [single] => Some(single.str_value(heap)),
            many => Some(crate::value::repr_sequence(many, "(", ")", heap)),
        }
    }

    /// First argument, the completion value of `StopIteration`.
    pub fn value(&self) -> Value {
        self.args.first().copied().unwrap_or(Value::None)
    }

    /// A group sharing this one's message, chain and traceback, holding only
    /// `exceptions`. `parts` is the list value listing them, used as `args[1]`.
    pub fn derive_group(&self, exc_type: ExcType, exceptions: Vec<HeapId>, parts: Value) -> Self {
        let message = self.group.as_ref().map(|g| g.message.clone()).unwrap_or_default();
        let mut args = self.args.first().copied().into_iter().collect::<Vec<_>>();
        args.push(parts);
        Self {
            exc_type,
            args,
            cause: self.cause,
            context: self.context,
            suppress_context: self.suppress_context,
            traceback: self.traceback.clone(),
            traced_frame: self.traced_frame,
            group: Some(ExceptionGroupData { message, exceptions }),
        }
    }
}
