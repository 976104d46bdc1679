//! Built-in functions and exception constructors.
//!
//! Builtins that only need the heap live here. The ones that re-enter the
//! interpreter (`next`, `iter`, `list`, `tuple`, `__build_class__`) are
//! dispatched by the VM, which drives the iteration protocol for them.

use std::str::FromStr;

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    exception::{ExcType, Exception, RunResult, SimpleException},
    heap::{Heap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{ExceptionGroupData, ExceptionObject, Range},
    value::Value,
};

/// A value bound to a builtin name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub(crate) enum Builtins {
    /// A builtin function like `print` or `len`.
    Function(BuiltinFunction),
    /// An exception class, callable to construct an instance.
    ExcType(ExcType),
}

impl Builtins {
    /// Resolves a name in the builtin namespace.
    pub fn from_name(name: &str) -> Option<Self> {
        if let Ok(function) = BuiltinFunction::from_str(name) {
            return Some(Self::Function(function));
        }
        ExcType::from_str(name).ok().map(Self::ExcType)
    }
}

/// Builtin functions. Displays as the builtin's name.
#[derive(
    Debug, Clone, Copy, Display, EnumString, IntoStaticStr, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum BuiltinFunction {
    Next,
    Iter,
    Len,
    Print,
    List,
    Tuple,
    Range,
    Repr,
    Str,
    #[strum(serialize = "__build_class__")]
    BuildClass,
}

impl BuiltinFunction {
    /// Rejects keyword arguments for every builtin except `print`.
    pub fn check_kwargs(self, kwargs: &[(String, Value)]) -> RunResult<()> {
        match kwargs.first() {
            Some(_) if self == Self::Print => Ok(()),
            Some(_) => Err(ExcType::type_error(format!("{self}() takes no keyword arguments"))),
            None => Ok(()),
        }
    }

    /// Checks a positional argument count against `min..=max`.
    pub fn check_arity(self, given: usize, min: usize, max: usize) -> RunResult<()> {
        if given < min {
            let noun = if min == 1 { "argument" } else { "arguments" };
            let bound = if min == max { "" } else { "at least " };
            return Err(ExcType::type_error(format!(
                "{self}() takes {bound}{min} {noun} ({given} given)"
            )));
        }
        if given > max {
            let noun = if max == 1 { "argument" } else { "arguments" };
            return Err(ExcType::type_error(format!(
                "{self} expected at most {max} {noun}, got {given}"
            )));
        }
        Ok(())
    }
}

/// `len(value)` for built-in containers. Host objects are handled by the caller.
pub(crate) fn builtin_len(heap: &Heap<impl ResourceTracker>, value: Value) -> RunResult<Value> {
    let len = match value {
        Value::Ref(id) => match heap.get(id) {
            HeapData::Str(s) => Some(s.chars().count()),
            HeapData::List(items) | HeapData::Tuple(items) => Some(items.len()),
            HeapData::Dict(dict) => Some(dict.len()),
            HeapData::Range(range) => Some(range.len()),
            _ => None,
        },
        _ => None,
    };
    match len {
        Some(len) => i64::try_from(len)
            .map(Value::Int)
            .map_err(|_| SimpleException::new_msg(ExcType::OverflowError, "length too large").into()),
        None => Err(ExcType::type_error(format!(
            "object of type '{}' has no len()",
            value.type_name(heap)
        ))),
    }
}

/// `print(*args, sep=' ', end='\n')`.
pub(crate) fn builtin_print(
    heap: &Heap<impl ResourceTracker>,
    args: &[Value],
    kwargs: &[(String, Value)],
    print: &mut impl PrintWriter,
) -> RunResult<Result<(), Exception>> {
    let mut sep = " ".to_owned();
    let mut end = "\n".to_owned();
    for (name, value) in kwargs {
        let target = match name.as_str() {
            "sep" => &mut sep,
            "end" => &mut end,
            _ => {
                return Err(ExcType::type_error(format!(
                    "'{name}' is an invalid keyword argument for print()"
                )));
            }
        };
        match (value, heap.as_str(*value)) {
            (Value::None, _) => {}
            (_, Some(text)) => text.clone_into(target),
            _ => {
                return Err(ExcType::type_error(format!(
                    "{name} must be None or a string, not {}",
                    value.type_name(heap)
                )));
            }
        }
    }
    let mut output = String::new();
    for (index, value) in args.iter().enumerate() {
        if index > 0 {
            output.push_str(&sep);
        }
        output.push_str(&value.str_value(heap));
    }
    output.push_str(&end);
    Ok(print.stdout_write(output.into()))
}

/// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`.
pub(crate) fn builtin_range(heap: &mut Heap<impl ResourceTracker>, args: &[Value]) -> RunResult<Value> {
    let mut bounds = [0_i64; 3];
    for (slot, value) in bounds.iter_mut().zip(args) {
        *slot = value.as_index().ok_or_else(|| {
            ExcType::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                value.type_name(heap)
            ))
        })?;
    }
    let range = match args.len() {
        1 => Range::new(0, bounds[0], 1),
        2 => Range::new(bounds[0], bounds[1], 1),
        _ if bounds[2] == 0 => return Err(ExcType::value_error("range() arg 3 must not be zero")),
        _ => Range::new(bounds[0], bounds[1], bounds[2]),
    };
    Ok(Value::Ref(heap.allocate(HeapData::Range(range))?))
}

/// Calls an exception class: `ValueError("msg")`, `ExceptionGroup("msg", [...])`.
pub(crate) fn construct_exception(
    heap: &mut Heap<impl ResourceTracker>,
    exc_type: ExcType,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> RunResult<Value> {
    if !kwargs.is_empty() {
        return Err(ExcType::type_error(format!("{exc_type}() takes no keyword arguments")));
    }
    let exc = if exc_type.is_group() {
        exception_group(heap, exc_type, args)?
    } else {
        ExceptionObject::new(exc_type, args.to_vec())
    };
    Ok(Value::Ref(heap.allocate(HeapData::Exception(exc))?))
}

/// Validates the arguments of `ExceptionGroup`/`BaseExceptionGroup`.
///
/// A `BaseExceptionGroup` whose members are all `Exception`s is an `ExceptionGroup`.
fn exception_group(heap: &Heap<impl ResourceTracker>, exc_type: ExcType, args: &[Value]) -> RunResult<ExceptionObject> {
    let [message_value, sequence] = args else {
        return Err(ExcType::type_error(format!(
            "{exc_type}() takes exactly 2 arguments ({} given)",
            args.len()
        )));
    };
    let Some(message) = heap.as_str(*message_value).map(str::to_owned) else {
        return Err(ExcType::type_error(format!(
            "{exc_type}() argument 1 must be str, not {}",
            message_value.type_name(heap)
        )));
    };
    let items = match sequence {
        Value::Ref(id) => match heap.get(*id) {
            HeapData::List(items) | HeapData::Tuple(items) => Some(items),
            _ => None,
        },
        _ => None,
    };
    let Some(items) = items.filter(|items| !items.is_empty()) else {
        return Err(ExcType::type_error("second argument (exceptions) must be a non-empty sequence"));
    };
    let mut parts: Vec<HeapId> = Vec::with_capacity(items.len());
    let mut all_exceptions = true;
    for (index, item) in items.iter().enumerate() {
        match item {
            Value::Ref(id) if heap.exception(*id).is_some() => {
                let member_type = heap.exception(*id).map(|e| e.exc_type);
                all_exceptions &= member_type.is_some_and(|t| t.is_subclass_of(ExcType::Exception));
                parts.push(*id);
            }
            _ => {
                return Err(ExcType::value_error(format!(
                    "Item {index} of second argument (exceptions) is not an exception"
                )));
            }
        }
    }
    let exc_type = match (exc_type, all_exceptions) {
        (ExcType::ExceptionGroup, false) => {
            return Err(ExcType::type_error("Cannot nest BaseExceptions in an ExceptionGroup"));
        }
        (_, true) => ExcType::ExceptionGroup,
        (_, false) => ExcType::BaseExceptionGroup,
    };
    let mut exc = ExceptionObject::new(exc_type, vec![*message_value, *sequence]);
    exc.group = Some(ExceptionGroupData {
        message,
        exceptions: parts,
    });
    Ok(exc)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{exception::RunError, resource::NoLimitTracker};

    #[test]
    fn names_resolve_to_functions_then_exceptions() {
        assert_eq!(Builtins::from_name("len"), Some(Builtins::Function(BuiltinFunction::Len)));
        assert_eq!(
            Builtins::from_name("__build_class__"),
            Some(Builtins::Function(BuiltinFunction::BuildClass))
        );
        assert_eq!(Builtins::from_name("KeyError"), Some(Builtins::ExcType(ExcType::KeyError)));
        assert_eq!(Builtins::from_name("sorted"), None);
    }

    #[test]
    fn base_group_of_exceptions_is_an_exception_group() {
        let mut heap = Heap::new(NoLimitTracker);
        let leaf = construct_exception(&mut heap, ExcType::ValueError, &[], &[]).unwrap();
        let message = heap.alloc_str("batch").unwrap();
        let parts = heap.alloc_list(vec![leaf]).unwrap();
        let group = construct_exception(&mut heap, ExcType::BaseExceptionGroup, &[message, parts], &[]).unwrap();
        let exc = heap.exception(group.ref_id().unwrap()).unwrap();
        assert_eq!(exc.exc_type, ExcType::ExceptionGroup);
        assert_eq!(exc.message(&heap).as_deref(), Some("batch"));
    }

    #[test]
    fn exception_group_rejects_base_exceptions() {
        let mut heap = Heap::new(NoLimitTracker);
        let leaf = construct_exception(&mut heap, ExcType::KeyboardInterrupt, &[], &[]).unwrap();
        let message = heap.alloc_str("batch").unwrap();
        let parts = heap.alloc_tuple(vec![leaf]).unwrap();
        let err = construct_exception(&mut heap, ExcType::ExceptionGroup, &[message, parts], &[]).unwrap_err();
        let RunError::Exc(exc) = err else {
            panic!("expected a pending exception");
        };
        assert_eq!(exc.message(), Some("Cannot nest BaseExceptions in an ExceptionGroup"));
    }

    #[test]
    fn range_rejects_zero_step() {
        let mut heap = Heap::new(NoLimitTracker);
        let err = builtin_range(&mut heap, &[Value::Int(0), Value::Int(3), Value::Int(0)]).unwrap_err();
        let RunError::Exc(exc) = err else {
            panic!("expected a pending exception");
        };
        assert_eq!(exc.message(), Some("range() arg 3 must not be zero"));
    }
}
