use std::{
    borrow::Cow,
    fmt::{self, Display, Write as _},
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{heap::HeapId, object::Object};

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Built-in exception classes known to the engine.
///
/// The string form of each variant is the class name (`ValueError` -> "ValueError").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    BaseException,
    /// Not a subclass of `Exception`; catch-all handlers must name it explicitly.
    GeneratorExit,
    KeyboardInterrupt,
    SystemExit,
    Exception,
    /// Base of all exception groups; `ExceptionGroup` derives from it and from `Exception`.
    BaseExceptionGroup,
    ExceptionGroup,

    ArithmeticError,
    OverflowError,
    ZeroDivisionError,

    LookupError,
    IndexError,
    KeyError,

    RuntimeError,
    NotImplementedError,
    RecursionError,

    NameError,
    UnboundLocalError,

    AssertionError,
    AttributeError,
    MemoryError,
    OSError,
    StopAsyncIteration,
    StopIteration,
    TimeoutError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// Returns true if `self` would be caught by `except handler_type:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        if self == handler_type {
            return true;
        }
        match handler_type {
            Self::BaseException => true,
            Self::Exception => !matches!(
                self,
                Self::BaseException
                    | Self::GeneratorExit
                    | Self::KeyboardInterrupt
                    | Self::SystemExit
                    | Self::BaseExceptionGroup
            ),
            Self::BaseExceptionGroup => self == Self::ExceptionGroup,
            Self::ArithmeticError => matches!(self, Self::OverflowError | Self::ZeroDivisionError),
            Self::LookupError => matches!(self, Self::IndexError | Self::KeyError),
            Self::RuntimeError => matches!(self, Self::NotImplementedError | Self::RecursionError),
            Self::NameError => self == Self::UnboundLocalError,
            _ => false,
        }
    }

    /// True for the two exception-group classes.
    #[must_use]
    pub fn is_group(self) -> bool {
        matches!(self, Self::BaseExceptionGroup | Self::ExceptionGroup)
    }

    pub(crate) fn type_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::TypeError, msg).into()
    }

    pub(crate) fn value_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::ValueError, msg).into()
    }

    pub(crate) fn runtime_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::RuntimeError, msg).into()
    }

    pub(crate) fn name_error(name: &str) -> RunError {
        SimpleException::new_msg(Self::NameError, format!("name '{name}' is not defined")).into()
    }

    pub(crate) fn unbound_local(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::UnboundLocalError,
            format!("cannot access local variable '{name}' where it is not associated with a value"),
        )
        .into()
    }

    pub(crate) fn unbound_free_var(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::NameError,
            format!("cannot access free variable '{name}' where it is not associated with a value in enclosing scope"),
        )
        .into()
    }

    pub(crate) fn attribute_error(type_name: impl Display, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
        .into()
    }

    pub(crate) fn not_iterable(type_name: impl Display) -> RunError {
        Self::type_error(format!("'{type_name}' object is not iterable"))
    }

    pub(crate) fn not_callable(type_name: impl Display) -> RunError {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    pub(crate) fn unsupported_operands(op: &str, lhs: impl Display, rhs: impl Display) -> RunError {
        Self::type_error(format!(
            "unsupported operand type(s) for {op}: '{lhs}' and '{rhs}'"
        ))
    }

    pub(crate) fn zero_division(msg: &'static str) -> RunError {
        SimpleException::new_msg(Self::ZeroDivisionError, msg).into()
    }

    pub(crate) fn not_enough_values(expected: usize, got: usize) -> RunError {
        Self::value_error(format!("not enough values to unpack (expected {expected}, got {got})"))
    }

    pub(crate) fn not_enough_values_star(expected_at_least: usize, got: usize) -> RunError {
        Self::value_error(format!(
            "not enough values to unpack (expected at least {expected_at_least}, got {got})"
        ))
    }

    pub(crate) fn too_many_values(expected: usize) -> RunError {
        Self::value_error(format!("too many values to unpack (expected {expected})"))
    }

    pub(crate) fn cannot_unpack(type_name: impl Display) -> RunError {
        Self::type_error(format!("cannot unpack non-iterable {type_name} object"))
    }

    pub(crate) fn generator_already_executing(kind: &str) -> RunError {
        Self::value_error(format!("{kind} already executing"))
    }

    pub(crate) fn cant_send_non_none(kind: &str) -> RunError {
        Self::type_error(format!("can't send non-None value to a just-started {kind}"))
    }

    pub(crate) fn ignored_generator_exit(kind: &str) -> RunError {
        Self::runtime_error(format!("{kind} ignored GeneratorExit"))
    }

    pub(crate) fn no_active_exception() -> RunError {
        Self::runtime_error("No active exception to reraise")
    }
}

/// An exception described by class and message, not yet allocated on the heap.
///
/// Most errors raised by instructions start out this way; the unwinder turns
/// them into heap exception objects when they reach a frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SimpleException {
    exc_type: ExcType,
    message: Option<String>,
}

impl SimpleException {
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self { exc_type, message }
    }

    pub fn new_msg(exc_type: ExcType, message: impl Display) -> Self {
        Self::new(exc_type, Some(message.to_string()))
    }

    pub fn new_none(exc_type: ExcType) -> Self {
        Self::new(exc_type, None)
    }

    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    pub fn into_message(self) -> Option<String> {
        self.message
    }

    #[cfg(test)]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// An exception object that already lives on the heap and is being raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Raise {
    pub id: HeapId,
    /// Re-raises keep their existing context and are never chained again.
    pub reraise: bool,
}

/// Runtime error types that can occur during execution.
///
/// - `Internal`: a fault in the interpreter or a malformed code unit
/// - `Exc`: a catchable exception that has not been allocated yet
/// - `Raised`: a catchable exception object already on the heap
/// - `Uncatchable`: a resource limit violation that handlers may not suppress
#[derive(Debug)]
pub(crate) enum RunError {
    Internal(Cow<'static, str>),
    Exc(Box<SimpleException>),
    Raised(Raise),
    Uncatchable(Box<SimpleException>),
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn raised(id: HeapId) -> Self {
        Self::Raised(Raise { id, reraise: false })
    }

    pub fn reraised(id: HeapId) -> Self {
        Self::Raised(Raise { id, reraise: true })
    }

    /// Returns true if handlers in the running program may catch this error.
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Exc(_) | Self::Raised(_))
    }
}

/// One entry of an exception traceback, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Qualified name of the code unit executing in this frame.
    pub name: String,
    /// Source line active when the exception passed through, if the unit has line info.
    pub line: Option<u32>,
}

/// A language-level exception as seen by the host.
///
/// Carries the full chain: explicit `cause`, implicit `context` and, for
/// exception groups, the nested leaf exceptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    exc_type: ExcType,
    message: Option<String>,
    args: Vec<Object>,
    cause: Option<Box<Exception>>,
    context: Option<Box<Exception>>,
    suppress_context: bool,
    exceptions: Vec<Exception>,
    traceback: Vec<StackFrame>,
}

impl Exception {
    /// Creates an exception with an optional message, as if by `ExcType(message)`.
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        let args = message.iter().cloned().map(Object::String).collect();
        Self {
            exc_type,
            message,
            args,
            cause: None,
            context: None,
            suppress_context: false,
            exceptions: Vec::new(),
            traceback: Vec::new(),
        }
    }

    /// Creates an exception group holding `exceptions`.
    #[must_use]
    pub fn group(message: impl Into<String>, exceptions: Vec<Self>) -> Self {
        let message = message.into();
        let exc_type = if exceptions.iter().all(|e| e.exc_type.is_subclass_of(ExcType::Exception)) {
            ExcType::ExceptionGroup
        } else {
            ExcType::BaseExceptionGroup
        };
        let mut exc = Self::new(exc_type, Some(message));
        exc.exceptions = exceptions;
        exc
    }

    pub(crate) fn from_parts(exc_type: ExcType, message: Option<String>, args: Vec<Object>) -> Self {
        Self {
            args,
            ..Self::new(exc_type, message)
        }
    }

    pub(crate) fn runtime_error(msg: impl Display) -> Self {
        Self::new(ExcType::RuntimeError, Some(msg.to_string()))
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    /// The display message: the single argument's `str()`, the group message, or `None`.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn args(&self) -> &[Object] {
        &self.args
    }

    /// The first argument, which is the completion value of a `StopIteration`.
    #[must_use]
    pub fn value(&self) -> Option<&Object> {
        self.args.first()
    }

    #[must_use]
    pub fn cause(&self) -> Option<&Self> {
        self.cause.as_deref()
    }

    #[must_use]
    pub fn context(&self) -> Option<&Self> {
        self.context.as_deref()
    }

    #[must_use]
    pub fn suppress_context(&self) -> bool {
        self.suppress_context
    }

    /// Leaf exceptions of an exception group, empty otherwise.
    #[must_use]
    pub fn exceptions(&self) -> &[Self] {
        &self.exceptions
    }

    #[must_use]
    pub fn traceback(&self) -> &[StackFrame] {
        &self.traceback
    }

    #[must_use]
    pub fn with_cause(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self.suppress_context = true;
        self
    }

    pub(crate) fn set_chain(&mut self, cause: Option<Self>, context: Option<Self>, suppress_context: bool) {
        self.cause = cause.map(Box::new);
        self.context = context.map(Box::new);
        self.suppress_context = suppress_context;
    }

    pub(crate) fn set_exceptions(&mut self, exceptions: Vec<Self>) {
        self.exceptions = exceptions;
    }

    pub(crate) fn set_traceback(&mut self, traceback: Vec<StackFrame>) {
        self.traceback = traceback;
    }

    pub(crate) fn into_args(self) -> Vec<Object> {
        self.args
    }

    /// Formats the exception and its chain the way a Python traceback prints it.
    #[must_use]
    pub fn traceback_string(&self) -> String {
        let mut out = String::new();
        self.write_chain(&mut out);
        out
    }

    fn write_chain(&self, out: &mut String) {
        if let Some(cause) = &self.cause {
            cause.write_chain(out);
            out.push_str("\nThe above exception was the direct cause of the following exception:\n\n");
        } else if let Some(context) = self.context.as_ref().filter(|_| !self.suppress_context) {
            context.write_chain(out);
            out.push_str("\nDuring handling of the above exception, another exception occurred:\n\n");
        }
        if !self.traceback.is_empty() {
            out.push_str("Traceback (most recent call last):\n");
            for frame in &self.traceback {
                match frame.line {
                    Some(line) => {
                        let _ = writeln!(out, "  line {line}, in {}", frame.name);
                    }
                    None => {
                        let _ = writeln!(out, "  in {}", frame.name);
                    }
                }
            }
        }
        let _ = writeln!(out, "{self}");
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message.as_deref() {
            Some(msg) if !msg.is_empty() => write!(f, "{}: {msg}", self.exc_type)?,
            _ => write!(f, "{}", self.exc_type)?,
        }
        if self.exc_type.is_group() {
            let count = self.exceptions.len();
            let noun = if count == 1 { "sub-exception" } else { "sub-exceptions" };
            write!(f, " ({count} {noun})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Exception {}

impl From<Exception> for SimpleException {
    fn from(exc: Exception) -> Self {
        Self::new(exc.exc_type, exc.message)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn hierarchy() {
        assert!(ExcType::UnboundLocalError.is_subclass_of(ExcType::NameError));
        assert!(ExcType::ExceptionGroup.is_subclass_of(ExcType::BaseExceptionGroup));
        assert!(ExcType::ExceptionGroup.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::GeneratorExit.is_subclass_of(ExcType::Exception));
        assert!(!ExcType::StopIteration.is_subclass_of(ExcType::RuntimeError));
    }

    #[test]
    fn names_round_trip_through_strum() {
        assert_eq!(ExcType::from_str("StopAsyncIteration"), Ok(ExcType::StopAsyncIteration));
        assert_eq!(ExcType::KeyError.to_string(), "KeyError");
    }

    #[test]
    fn display_group() {
        let eg = Exception::group(
            "boom",
            vec![Exception::new(ExcType::ValueError, Some("a".into()))],
        );
        assert_eq!(eg.to_string(), "ExceptionGroup: boom (1 sub-exception)");
    }
}
