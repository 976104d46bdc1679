//! Generator, coroutine and async generator objects.
//!
//! Calling a resumable code unit creates a [`Generator`] on the heap instead of
//! running the body. The activation lives in `frame` while suspended; while the
//! body runs the frame is on the VM's frame stack and `frame` is `None`.

use std::sync::Arc;

use crate::{code::CodeUnit, heap::HeapId, value::Value};

/// Which flavor of resumable body a generator runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GenKind {
    Generator,
    Coroutine,
    AsyncGenerator,
}

impl GenKind {
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::AsyncGenerator => "async_generator",
        }
    }

    /// Noun used in protocol error messages ("generator already executing").
    pub fn noun(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::AsyncGenerator => "async generator",
        }
    }
}

/// Generator execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GenState {
    /// Created but never resumed; `frame` holds the bound arguments at ip 0.
    Unstarted,
    /// Suspended at a yield point.
    Suspended,
    /// The body is executing; resuming again is a usage error.
    Running,
    /// Returned, raised or closed.
    Finished,
}

/// A suspended activation: everything needed to re-enter the body.
#[derive(Debug, Clone)]
pub(crate) struct SavedFrame {
    /// Instruction to resume at.
    pub ip: usize,
    /// Offset of the suspending instruction; thrown exceptions are raised here.
    pub yield_ip: usize,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub cells: Vec<HeapId>,
    /// The generator's own ambient exception, independent of any caller's.
    pub exc_state: Option<HeapId>,
}

/// A generator, coroutine or async generator object.
#[derive(Debug)]
pub(crate) struct Generator {
    pub kind: GenKind,
    pub state: GenState,
    pub code: Arc<CodeUnit>,
    pub name: String,
    pub qualname: String,
    pub frame: Option<SavedFrame>,
    /// Suspended inside `YieldFrom`: the delegate is on top of the saved stack.
    pub suspended_in_yield_from: bool,
}

impl Generator {
    pub fn new(kind: GenKind, code: Arc<CodeUnit>, name: String, qualname: String, frame: SavedFrame) -> Self {
        Self {
            kind,
            state: GenState::Unstarted,
            code,
            name,
            qualname,
            frame: Some(frame),
            suspended_in_yield_from: false,
        }
    }

    /// The delegate of a pending `yield from`, if suspended in one.
    pub fn delegate(&self) -> Option<Value> {
        if !self.suspended_in_yield_from {
            return None;
        }
        self.frame.as_ref().and_then(|frame| frame.stack.last().copied())
    }

    /// Marks the generator finished and drops its activation.
    pub fn finish(&mut self) {
        self.state = GenState::Finished;
        self.frame = None;
        self.suspended_in_yield_from = false;
    }
}

/// How a generator is being resumed.
#[derive(Debug, Clone, Copy)]
pub(crate) enum GenAction {
    Send(Value),
    /// Raise the exception object at the suspension point.
    Throw(HeapId),
    /// Raise `GeneratorExit` at the suspension point, closing any delegate first.
    Close,
}

/// Result of one resumption that did not raise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum GenOutcome {
    Yielded(Value),
    /// The body finished; the value is the `StopIteration` payload.
    Returned(Value),
}

/// Which async generator method produced an awaitable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum AwaitableKind {
    Send(Value),
    Throw(HeapId),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AwaitableState {
    Init,
    Iter,
    Closed,
}

/// The awaitable returned by `asend`, `athrow`, `aclose` and `__anext__`.
#[derive(Debug, Clone)]
pub(crate) struct AsyncGenAwaitable {
    pub agen: HeapId,
    pub kind: AwaitableKind,
    pub state: AwaitableState,
}

impl AsyncGenAwaitable {
    pub fn new(agen: HeapId, kind: AwaitableKind) -> Self {
        Self {
            agen,
            kind,
            state: AwaitableState::Init,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            AwaitableKind::Send(_) => "async_generator_asend",
            AwaitableKind::Throw(_) | AwaitableKind::Close => "async_generator_athrow",
        }
    }
}
