//! Calling values: argument binding, cell creation and activation setup.

use std::{rc::Rc, sync::Arc};

use smallvec::SmallVec;

use super::{Frame, FrameExit, Vm};
use crate::{
    builtins::{BuiltinFunction, Builtins, builtin_len, builtin_print, builtin_range, construct_exception},
    code::{CodeFlags, CodeUnit},
    exception::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{Cell, Dict, DictKey, Function, GenAction, GenKind, GenOutcome},
    value::Value,
};

/// Positional arguments of one call.
pub(crate) type ArgVec = SmallVec<[Value; 4]>;

/// What a call did.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CallOutcome {
    /// The call completed with this result.
    Push(Value),
    /// A frame was pushed; its return value arrives when it returns.
    FramePushed,
}

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    pub(crate) fn call_value(
        &mut self,
        callable: Value,
        args: ArgVec,
        kwargs: Vec<(String, Value)>,
    ) -> RunResult<CallOutcome> {
        match callable {
            Value::Builtin(Builtins::Function(function)) => self.call_builtin(function, args, kwargs),
            Value::Builtin(Builtins::ExcType(exc_type)) => self
                .construct_exception(exc_type, &args, kwargs)
                .map(CallOutcome::Push),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Function(_) => self.call_function(id, args, kwargs, None),
                HeapData::BoundMethod(method) => {
                    let method = method.clone();
                    self.call_bound_method(method.receiver, &method.name, args, kwargs)
                        .map(CallOutcome::Push)
                }
                HeapData::Host(host) => {
                    let host = Rc::clone(host);
                    let args = args.into_iter().map(|v| self.to_object(v)).collect();
                    let kwargs = kwargs.into_iter().map(|(k, v)| (k, self.to_object(v))).collect();
                    match host.call(args, kwargs) {
                        Ok(result) => self.from_object(result).map(CallOutcome::Push),
                        Err(exc) => Err(self.host_error(exc)),
                    }
                }
                data => Err(ExcType::not_callable(data.type_name())),
            },
            other => Err(ExcType::not_callable(other.type_name(self.heap))),
        }
    }

    /// Calls a builtin function.
    pub(super) fn call_builtin(
        &mut self,
        function: BuiltinFunction,
        args: ArgVec,
        kwargs: Vec<(String, Value)>,
    ) -> RunResult<CallOutcome> {
        function.check_kwargs(&kwargs)?;
        let value = match function {
            BuiltinFunction::Next => {
                function.check_arity(args.len(), 1, 2)?;
                self.builtin_next(args[0], args.get(1).copied())?
            }
            BuiltinFunction::Iter => {
                function.check_arity(args.len(), 1, 1)?;
                self.get_iter(args[0])?
            }
            BuiltinFunction::Len => {
                function.check_arity(args.len(), 1, 1)?;
                self.builtin_len(args[0])?
            }
            BuiltinFunction::Print => match builtin_print(self.heap, &args, &kwargs, self.print)? {
                Ok(()) => Value::None,
                Err(exc) => return Err(self.host_error(exc)),
            },
            BuiltinFunction::List | BuiltinFunction::Tuple => {
                function.check_arity(args.len(), 0, 1)?;
                let items = match args.first() {
                    Some(&iterable) => self.collect_iterable(iterable)?,
                    None => Vec::new(),
                };
                if function == BuiltinFunction::List {
                    self.heap.alloc_list(items)?
                } else {
                    self.heap.alloc_tuple(items)?
                }
            }
            BuiltinFunction::Range => {
                function.check_arity(args.len(), 1, 3)?;
                builtin_range(self.heap, &args)?
            }
            BuiltinFunction::Repr => {
                function.check_arity(args.len(), 1, 1)?;
                let text = args[0].repr(self.heap);
                self.heap.alloc_str(text)?
            }
            BuiltinFunction::Str => {
                function.check_arity(args.len(), 0, 1)?;
                let text = args.first().map(|value| value.str_value(self.heap)).unwrap_or_default();
                self.heap.alloc_str(text)?
            }
            BuiltinFunction::BuildClass => return self.build_class(&args),
        };
        Ok(CallOutcome::Push(value))
    }

    /// `next(iterator[, default])`. A generator's return value rides on the `StopIteration`.
    fn builtin_next(&mut self, iterator: Value, default: Option<Value>) -> RunResult<Value> {
        let returned = match iterator {
            Value::Ref(id) if self.heap.generator(id).is_some_and(|g| g.kind == GenKind::Generator) => {
                match self.resume_generator(id, GenAction::Send(Value::None))? {
                    GenOutcome::Yielded(value) => return Ok(value),
                    GenOutcome::Returned(value) => value,
                }
            }
            _ => match self.iter_next(iterator)? {
                Some(value) => return Ok(value),
                None => Value::None,
            },
        };
        match default {
            Some(default) => Ok(default),
            None => Err(self.stop_iteration(returned)),
        }
    }

    fn builtin_len(&mut self, value: Value) -> RunResult<Value> {
        if let Value::Ref(id) = value
            && let HeapData::Host(host) = self.heap.get(id)
            && host.has_method("__len__")
        {
            let host = Rc::clone(host);
            return match host.call_method("__len__", Vec::new()) {
                Ok(result) => self.from_object(result),
                Err(exc) => Err(self.host_error(exc)),
            };
        }
        builtin_len(self.heap, value)
    }

    /// `__build_class__(body, name, *bases)`: runs the class body against a
    /// fresh namespace, which becomes the call's result.
    fn build_class(&mut self, args: &[Value]) -> RunResult<CallOutcome> {
        let [body, name, ..] = args else {
            return Err(ExcType::type_error("__build_class__: not enough arguments"));
        };
        let Some(body) = body.ref_id().filter(|id| matches!(self.heap.get(*id), HeapData::Function(_))) else {
            return Err(ExcType::type_error("__build_class__: func must be a function"));
        };
        if self.heap.as_str(*name).is_none() {
            return Err(ExcType::type_error("__build_class__: name is not a string"));
        }
        let namespace = self.heap.allocate(HeapData::Dict(Dict::new()))?;
        self.call_function(body, ArgVec::new(), Vec::new(), Some(namespace))
    }

    /// Calls an exception class.
    pub(crate) fn construct_exception(
        &mut self,
        exc_type: ExcType,
        args: &[Value],
        kwargs: Vec<(String, Value)>,
    ) -> RunResult<Value> {
        construct_exception(self.heap, exc_type, args, &kwargs)
    }

    /// Calls `callable` and runs it to completion before returning.
    pub(crate) fn call_sync(
        &mut self,
        callable: Value,
        args: ArgVec,
        kwargs: Vec<(String, Value)>,
    ) -> RunResult<Value> {
        let depth = self.frames.len() + 1;
        match self.call_value(callable, args, kwargs)? {
            CallOutcome::Push(value) => Ok(value),
            CallOutcome::FramePushed => match self.run_frames(depth, None)? {
                FrameExit::Return(value) => Ok(value),
                FrameExit::Yield(_) => Err(RunError::internal("plain function frame yielded")),
            },
        }
    }

    /// `receiver.name(*args)`, run to completion.
    pub(crate) fn call_method_sync(&mut self, receiver: Value, name: &str, args: ArgVec) -> RunResult<Value> {
        let method = self.load_attr(receiver, name)?;
        self.call_sync(method, args, Vec::new())
    }

    /// Calls a user function. With a `namespace`, the body runs against that
    /// mapping and the call returns the mapping, as for a class body.
    pub(crate) fn call_function(
        &mut self,
        id: HeapId,
        args: ArgVec,
        kwargs: Vec<(String, Value)>,
        namespace: Option<HeapId>,
    ) -> RunResult<CallOutcome> {
        let HeapData::Function(function) = self.heap.get(id) else {
            return Err(RunError::internal("call_function on a non-function"));
        };
        let function = function.clone();
        let mut locals = self.bind_arguments(&function, args, kwargs)?;
        let cells = self.make_cells(&function.code, &mut locals, &function.closure)?;
        if function.code.flags.is_resumable() {
            return self.make_generator(&function, locals, cells).map(CallOutcome::Push);
        }
        let code_idx = self.codes.index_of(&function.code);
        let mut frame = Frame::new(Arc::clone(&function.code), code_idx, self.stack.len(), locals, cells);
        if namespace.is_some() {
            frame.namespace = namespace;
            frame.returns_namespace = true;
        }
        self.push_frame(frame)?;
        Ok(CallOutcome::FramePushed)
    }

    /// Creates the cells of a new activation: fresh cells for `cellvars`
    /// (moving aliased parameters into them) followed by the closure.
    pub(super) fn make_cells(
        &mut self,
        code: &CodeUnit,
        locals: &mut [Value],
        closure: &[HeapId],
    ) -> RunResult<Vec<HeapId>> {
        if closure.len() != code.freevars.len() {
            return Err(RunError::internal(format!(
                "'{}' expects {} free variables, closure has {}",
                code.qualname,
                code.freevars.len(),
                closure.len()
            )));
        }
        let mut cells = Vec::with_capacity(code.cellvars.len() + closure.len());
        for index in 0..code.cellvars.len() {
            let initial = match code.cell2arg.get(index).copied().flatten() {
                Some(arg) => {
                    let slot = locals
                        .get_mut(usize::from(arg))
                        .ok_or_else(|| RunError::internal("cell2arg slot out of range"))?;
                    let value = std::mem::replace(slot, Value::Undefined);
                    (value != Value::Undefined).then_some(value)
                }
                None => None,
            };
            cells.push(self.heap.allocate(HeapData::Cell(Cell::new(initial)))?);
        }
        cells.extend_from_slice(closure);
        Ok(cells)
    }

    /// Maps call arguments onto parameter slots.
    fn bind_arguments(
        &mut self,
        function: &Function,
        args: ArgVec,
        kwargs: Vec<(String, Value)>,
    ) -> RunResult<Vec<Value>> {
        let code = &function.code;
        let qualname = function.qualname.as_str();
        let argcount = usize::from(code.arg_count);
        let posonly = usize::from(code.positional_only_count);
        let kwonly = usize::from(code.kwonly_count);
        let named = argcount + kwonly;
        let has_varargs = code.flags.contains(CodeFlags::HAS_VAR_ARGS);
        let has_varkw = code.flags.contains(CodeFlags::HAS_VAR_KW_ARGS);
        let mut locals = vec![Value::Undefined; code.varnames.len().max(code.total_arg_count())];

        let given = args.len();
        let mut extra = Vec::new();
        for (index, value) in args.into_iter().enumerate() {
            if index < argcount {
                locals[index] = value;
            } else {
                extra.push(value);
            }
        }
        if has_varargs {
            locals[named] = self.heap.alloc_tuple(extra)?;
        } else if !extra.is_empty() {
            return Err(too_many_positional(qualname, argcount, function.defaults.len(), given));
        }

        let mut varkw = has_varkw.then(Dict::new);
        let mut posonly_as_keyword = Vec::new();
        for (name, value) in kwargs {
            let slot = code.varnames.iter().take(named).position(|n| *n == name);
            match slot {
                Some(slot) if slot >= posonly => {
                    if locals[slot] != Value::Undefined {
                        return Err(ExcType::type_error(format!(
                            "{qualname}() got multiple values for argument '{name}'"
                        )));
                    }
                    locals[slot] = value;
                }
                _ => match varkw.as_mut() {
                    Some(dict) => {
                        let key = self.heap.alloc_str(name.as_str())?;
                        dict.insert(DictKey::Str(name), key, value);
                    }
                    None if slot.is_some() => posonly_as_keyword.push(name),
                    None => {
                        return Err(ExcType::type_error(format!(
                            "{qualname}() got an unexpected keyword argument '{name}'"
                        )));
                    }
                },
            }
        }
        if !posonly_as_keyword.is_empty() {
            return Err(ExcType::type_error(format!(
                "{qualname}() got some positional-only arguments passed as keyword arguments: '{}'",
                posonly_as_keyword.join(", ")
            )));
        }
        if let Some(dict) = varkw {
            let slot = named + usize::from(has_varargs);
            locals[slot] = Value::Ref(self.heap.allocate(HeapData::Dict(dict))?);
        }

        let first_default = argcount.saturating_sub(function.defaults.len());
        let mut missing = Vec::new();
        for slot in 0..argcount {
            if locals[slot] == Value::Undefined {
                if slot >= first_default {
                    locals[slot] = function.defaults[slot - first_default];
                } else {
                    missing.push(code.varnames[slot].as_str());
                }
            }
        }
        if !missing.is_empty() {
            return Err(missing_arguments(qualname, "positional", &missing));
        }
        for slot in argcount..named {
            if locals[slot] == Value::Undefined {
                let name = code.varnames[slot].as_str();
                match function.kwdefault(name) {
                    Some(value) => locals[slot] = value,
                    None => missing.push(name),
                }
            }
        }
        if !missing.is_empty() {
            return Err(missing_arguments(qualname, "keyword-only", &missing));
        }
        Ok(locals)
    }

    /// `callable(*args, **kwargs)`: unpacks an iterable of positional
    /// arguments and an optional dict of keyword arguments.
    pub(super) fn call_varargs(&mut self, callable: Value, args: Value, kwargs: Option<Value>) -> RunResult<CallOutcome> {
        if !self.is_iterable(args) {
            return Err(ExcType::type_error(format!(
                "{}() argument after * must be an iterable, not {}",
                self.callable_name(callable),
                args.type_name(self.heap)
            )));
        }
        let kwargs = match kwargs {
            Some(mapping) => self.keyword_mapping(callable, mapping)?,
            None => Vec::new(),
        };
        let args = self.collect_iterable(args)?.into_iter().collect();
        self.call_value(callable, args, kwargs)
    }

    /// The entries of a `**` mapping, which must be a dict with string keys.
    fn keyword_mapping(&self, callable: Value, mapping: Value) -> RunResult<Vec<(String, Value)>> {
        let dict = match mapping {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Dict(dict) => Some(dict),
                _ => None,
            },
            _ => None,
        };
        let Some(dict) = dict else {
            return Err(ExcType::type_error(format!(
                "{}() argument after ** must be a mapping, not {}",
                self.callable_name(callable),
                mapping.type_name(self.heap)
            )));
        };
        dict.items()
            .map(|(key, value)| {
                self.heap
                    .as_str(key)
                    .map(|name| (name.to_owned(), value))
                    .ok_or_else(|| ExcType::type_error("keywords must be strings"))
            })
            .collect()
    }

    /// Name of a callable as call errors show it.
    fn callable_name(&self, callable: Value) -> String {
        match callable {
            Value::Builtin(Builtins::Function(function)) => function.to_string(),
            Value::Builtin(Builtins::ExcType(exc_type)) => exc_type.to_string(),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Function(function) => function.qualname.clone(),
                HeapData::BoundMethod(method) => method.name.clone(),
                data => data.type_name().into_owned(),
            },
            other => other.type_name(self.heap).into_owned(),
        }
    }

    /// Splits the trailing keyword values of a `CallFunctionKw` off the positional arguments.
    pub(super) fn split_keywords(
        &self,
        names: Value,
        mut args: ArgVec,
    ) -> RunResult<(ArgVec, Vec<(String, Value)>)> {
        let names = self
            .sequence_items(names)?
            .into_iter()
            .map(|name| {
                self.heap
                    .as_str(name)
                    .map(str::to_owned)
                    .ok_or_else(|| RunError::internal("keyword names must be strings"))
            })
            .collect::<RunResult<Vec<_>>>()?;
        let split = args
            .len()
            .checked_sub(names.len())
            .ok_or_else(|| RunError::internal("more keyword names than arguments"))?;
        let values = args.drain(split..);
        let kwargs = names.into_iter().zip(values).collect();
        Ok((args, kwargs))
    }
}

fn too_many_positional(qualname: &str, argcount: usize, defaults: usize, given: usize) -> RunError {
    let takes = if defaults > 0 && defaults <= argcount {
        format!("from {} to {argcount} positional arguments", argcount - defaults)
    } else if argcount == 1 {
        "1 positional argument".to_owned()
    } else {
        format!("{argcount} positional arguments")
    };
    let verb = if given == 1 { "was" } else { "were" };
    ExcType::type_error(format!("{qualname}() takes {takes} but {given} {verb} given"))
}

fn missing_arguments(qualname: &str, kind: &str, names: &[&str]) -> RunError {
    let plural = if names.len() == 1 { "" } else { "s" };
    ExcType::type_error(format!(
        "{qualname}() missing {} required {kind} argument{plural}: {}",
        names.len(),
        join_names(names)
    ))
}

/// `'a'`, `'a' and 'b'`, `'a', 'b', and 'c'`.
fn join_names(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{n}'")).collect();
    match quoted.as_slice() {
        [] => String::new(),
        [one] => one.clone(),
        [a, b] => format!("{a} and {b}"),
        [init @ .., last] => format!("{}, and {last}", init.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn names_join_like_python() {
        assert_eq!(join_names(&["a"]), "'a'");
        assert_eq!(join_names(&["a", "b"]), "'a' and 'b'");
        assert_eq!(join_names(&["a", "b", "c"]), "'a', 'b', and 'c'");
    }

    #[test]
    fn positional_count_messages() {
        let RunError::Exc(exc) = too_many_positional("f", 2, 1, 3) else {
            panic!("expected a pending exception");
        };
        assert_eq!(exc.message(), Some("f() takes from 1 to 2 positional arguments but 3 were given"));
        let RunError::Exc(exc) = too_many_positional("g", 0, 0, 1) else {
            panic!("expected a pending exception");
        };
        assert_eq!(exc.message(), Some("g() takes 0 positional arguments but 1 was given"));
    }
}
