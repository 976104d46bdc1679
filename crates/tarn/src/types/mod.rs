//! Built-in runtime types stored on the heap.

pub mod cell;
pub mod dict;
pub mod exception;
pub mod function;
pub mod generator;
pub mod iter;
pub mod range;
pub mod slice;

pub(crate) use cell::Cell;
pub(crate) use dict::{Dict, DictKey};
pub(crate) use exception::{ExceptionGroupData, ExceptionObject};
pub(crate) use function::Function;
pub(crate) use generator::{
    AsyncGenAwaitable, AwaitableKind, AwaitableState, GenAction, GenKind, GenOutcome, GenState, Generator, SavedFrame,
};
pub(crate) use iter::{IterSource, SeqIter};
pub(crate) use range::Range;
pub(crate) use slice::Slice;
