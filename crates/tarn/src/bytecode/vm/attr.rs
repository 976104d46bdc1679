//! Attribute and item access on built-in objects and host objects.
//!
//! Methods of built-in objects are looked up as [`BoundMethod`]s holding the
//! receiver and the method name; calling one lands in `call_bound_method`.

use std::rc::Rc;

use super::{ArgVec, Vm};
use crate::{
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::{BoundMethod, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{AwaitableKind, DictKey, ExceptionObject, GenAction, GenKind, GenOutcome, Range, Slice},
    value::Value,
};

const GENERATOR_METHODS: &[&str] = &["send", "throw", "close", "__next__", "__iter__"];
const COROUTINE_METHODS: &[&str] = &["send", "throw", "close", "__await__"];
const ASYNC_GENERATOR_METHODS: &[&str] = &["asend", "athrow", "aclose", "__anext__", "__aiter__"];
const AWAITABLE_METHODS: &[&str] = &["send", "throw", "close", "__next__", "__iter__", "__await__"];
const LIST_METHODS: &[&str] = &["append", "extend", "pop"];
const DICT_METHODS: &[&str] = &["get", "keys", "values", "items"];
const STR_METHODS: &[&str] = &["join"];

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// `object.name`.
    pub(super) fn load_attr(&mut self, object: Value, name: &str) -> RunResult<Value> {
        let Value::Ref(id) = object else {
            return Err(ExcType::attribute_error(object.type_name(self.heap), name));
        };
        let methods: &[&str] = match self.heap.get(id) {
            HeapData::Exception(_) => return self.exception_attr(id, name),
            HeapData::Function(_) => return self.function_attr(id, name),
            HeapData::Generator(generator) => {
                let label = match name {
                    "__name__" => Some(generator.name.clone()),
                    "__qualname__" => Some(generator.qualname.clone()),
                    _ => None,
                };
                if let Some(label) = label {
                    return Ok(self.heap.alloc_str(label)?);
                }
                match generator.kind {
                    GenKind::Generator => GENERATOR_METHODS,
                    GenKind::Coroutine => COROUTINE_METHODS,
                    GenKind::AsyncGenerator => ASYNC_GENERATOR_METHODS,
                }
            }
            HeapData::AsyncGenAwaitable(_) => AWAITABLE_METHODS,
            HeapData::List(_) => LIST_METHODS,
            HeapData::Dict(_) => DICT_METHODS,
            HeapData::Str(_) => STR_METHODS,
            HeapData::Host(host) => {
                if host.has_method(name) {
                    return self.bind_method(object, name);
                }
                let host = Rc::clone(host);
                return match host.get_attr(name) {
                    Ok(result) => self.from_object(result),
                    Err(exc) => Err(self.host_error(exc)),
                };
            }
            _ => &[],
        };
        if methods.contains(&name) {
            self.bind_method(object, name)
        } else {
            Err(ExcType::attribute_error(object.type_name(self.heap), name))
        }
    }

    fn bind_method(&mut self, receiver: Value, name: &str) -> RunResult<Value> {
        let method = BoundMethod {
            receiver,
            name: name.to_owned(),
        };
        Ok(Value::Ref(self.heap.allocate(HeapData::BoundMethod(method))?))
    }

    fn exception_attr(&mut self, id: HeapId, name: &str) -> RunResult<Value> {
        let Some(exc) = self.heap.exception(id) else {
            return Err(RunError::internal("not an exception"));
        };
        let link = |link: Option<HeapId>| link.map_or(Value::None, Value::Ref);
        Ok(match name {
            "args" => {
                let args = exc.args.clone();
                self.heap.alloc_tuple(args)?
            }
            "__cause__" => link(exc.cause),
            "__context__" => link(exc.context),
            "__suppress_context__" => Value::Bool(exc.suppress_context),
            "value" if exc.exc_type == ExcType::StopIteration => exc.value(),
            "exceptions" | "message" if exc.group.is_some() => {
                let Some(group) = exc.group.clone() else {
                    return Err(RunError::internal("group data vanished"));
                };
                if name == "message" {
                    self.heap.alloc_str(group.message)?
                } else {
                    self.heap.alloc_tuple(group.exceptions.into_iter().map(Value::Ref).collect())?
                }
            }
            _ => return Err(ExcType::attribute_error(exc.exc_type, name)),
        })
    }

    fn function_attr(&mut self, id: HeapId, name: &str) -> RunResult<Value> {
        let HeapData::Function(function) = self.heap.get(id) else {
            return Err(RunError::internal("not a function"));
        };
        Ok(match name {
            "__name__" => {
                let name = function.name.clone();
                self.heap.alloc_str(name)?
            }
            "__qualname__" => {
                let qualname = function.qualname.clone();
                self.heap.alloc_str(qualname)?
            }
            "__doc__" => match function.code.docstring().map(str::to_owned) {
                Some(doc) => self.heap.alloc_str(doc)?,
                None => Value::None,
            },
            "__defaults__" if function.defaults.is_empty() => Value::None,
            "__defaults__" => {
                let defaults = function.defaults.clone();
                self.heap.alloc_tuple(defaults)?
            }
            _ => return Err(ExcType::attribute_error("function", name)),
        })
    }

    /// `object.name = value`.
    pub(super) fn store_attr(&mut self, object: Value, name: &str, value: Value) -> RunResult<()> {
        let Value::Ref(id) = object else {
            return Err(ExcType::attribute_error(object.type_name(self.heap), name));
        };
        match self.heap.get(id) {
            HeapData::Host(host) => {
                let host = Rc::clone(host);
                let value = self.to_object(value);
                return host.set_attr(name, value).map_err(|exc| self.host_error(exc));
            }
            HeapData::Exception(_) => return self.store_exception_attr(id, name, value),
            HeapData::Function(_) if matches!(name, "__name__" | "__qualname__") => {
                let Some(text) = self.heap.as_str(value).map(str::to_owned) else {
                    return Err(ExcType::type_error(format!(
                        "{name} must be set to a string object"
                    )));
                };
                if let HeapData::Function(function) = self.heap.get_mut(id) {
                    if name == "__name__" {
                        function.name = text;
                    } else {
                        function.qualname = text;
                    }
                }
                return Ok(());
            }
            _ => {}
        }
        Err(ExcType::attribute_error(object.type_name(self.heap), name))
    }

    /// `del object.name`.
    pub(super) fn delete_attr(&mut self, object: Value, name: &str) -> RunResult<()> {
        let Value::Ref(id) = object else {
            return Err(ExcType::attribute_error(object.type_name(self.heap), name));
        };
        match self.heap.get(id) {
            HeapData::Host(host) => {
                let host = Rc::clone(host);
                host.del_attr(name).map_err(|exc| self.host_error(exc))
            }
            HeapData::Exception(_) if matches!(name, "__cause__" | "__context__" | "__suppress_context__") => {
                Err(ExcType::type_error(format!("{name} may not be deleted")))
            }
            HeapData::Function(_) if matches!(name, "__name__" | "__qualname__") => {
                Err(ExcType::type_error(format!("{name} must be set to a string object")))
            }
            _ => Err(ExcType::attribute_error(object.type_name(self.heap), name)),
        }
    }

    fn store_exception_attr(&mut self, id: HeapId, name: &str, value: Value) -> RunResult<()> {
        let link = match name {
            "__suppress_context__" => {
                let suppress = value.is_truthy(self.heap);
                if let Some(exc) = self.heap.exception_mut(id) {
                    exc.suppress_context = suppress;
                }
                return Ok(());
            }
            "__cause__" | "__context__" => match value {
                Value::None => None,
                Value::Ref(link) if self.heap.exception(link).is_some() => Some(link),
                _ => {
                    return Err(ExcType::type_error(format!(
                        "exception {} must be None or derive from BaseException",
                        if name == "__cause__" { "cause" } else { "context" }
                    )));
                }
            },
            _ => {
                let exc_type = self.heap.exception(id).map(|e| e.exc_type);
                return Err(ExcType::attribute_error(
                    exc_type.map_or("BaseException".into(), |t| t.to_string()),
                    name,
                ));
            }
        };
        if let Some(exc) = self.heap.exception_mut(id) {
            if name == "__cause__" {
                exc.cause = link;
                exc.suppress_context = true;
            } else {
                exc.context = link;
            }
        }
        Ok(())
    }

    /// `container[key]`.
    pub(super) fn get_item(&mut self, container: Value, key: Value) -> RunResult<Value> {
        let Value::Ref(id) = container else {
            return Err(not_subscriptable(container.type_name(self.heap)));
        };
        if let Some(slice) = self.slice_key(key)
            && is_sliceable(self.heap.get(id))
        {
            return self.get_slice(id, slice);
        }
        match self.heap.get(id) {
            HeapData::List(items) | HeapData::Tuple(items) => {
                let kind = if matches!(self.heap.get(id), HeapData::List(_)) { "list" } else { "tuple" };
                let index = self.sequence_index(key, items.len(), kind)?;
                match index {
                    Some(index) => Ok(items[index]),
                    None => Err(index_error(format!("{kind} index out of range"))),
                }
            }
            HeapData::Str(s) => {
                let Some(index) = key.as_index() else {
                    return Err(ExcType::type_error(format!(
                        "string indices must be integers, not '{}'",
                        key.type_name(self.heap)
                    )));
                };
                let count = s.chars().count();
                let c = normalize_index(index, count).and_then(|i| s.chars().nth(i));
                match c {
                    Some(c) => Ok(self.heap.alloc_str(c)?),
                    None => Err(index_error("string index out of range")),
                }
            }
            HeapData::Range(range) => {
                let range = *range;
                let index = self.sequence_index(key, range.len(), "range")?;
                match index.and_then(|i| range.get(i)) {
                    Some(item) => Ok(Value::Int(item)),
                    None => Err(index_error("range object index out of range")),
                }
            }
            HeapData::Dict(dict) => {
                let dict_key = DictKey::from_value(key, self.heap)?;
                match dict.get(&dict_key) {
                    Some(value) => Ok(value),
                    None => Err(self.key_error(key)),
                }
            }
            HeapData::Host(host) => {
                let host = Rc::clone(host);
                let key = self.to_object(key);
                match host.get_item(&key) {
                    Ok(result) => self.from_object(result),
                    Err(exc) => Err(self.host_error(exc)),
                }
            }
            data => Err(not_subscriptable(data.type_name())),
        }
    }

    /// `container[key] = value`.
    pub(super) fn set_item(&mut self, container: Value, key: Value, value: Value) -> RunResult<()> {
        let Value::Ref(id) = container else {
            return Err(no_item_assignment(container.type_name(self.heap)));
        };
        if let Some(slice) = self.slice_key(key)
            && matches!(self.heap.get(id), HeapData::List(_))
        {
            return self.set_slice(id, slice, value);
        }
        match self.heap.get(id) {
            HeapData::List(items) => {
                let index = self.sequence_index(key, items.len(), "list")?;
                let Some(index) = index else {
                    return Err(index_error("list assignment index out of range"));
                };
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items[index] = value;
                }
                Ok(())
            }
            HeapData::Dict(_) => {
                let dict_key = DictKey::from_value(key, self.heap)?;
                if let HeapData::Dict(dict) = self.heap.get_mut(id) {
                    dict.insert(dict_key, key, value);
                }
                Ok(())
            }
            HeapData::Host(host) => {
                let host = Rc::clone(host);
                let key = self.to_object(key);
                let value = self.to_object(value);
                host.set_item(key, value).map_err(|exc| self.host_error(exc))
            }
            data => Err(no_item_assignment(data.type_name())),
        }
    }

    /// `del container[key]`.
    pub(super) fn delete_item(&mut self, container: Value, key: Value) -> RunResult<()> {
        if let Value::Ref(id) = container {
            if let Some(slice) = self.slice_key(key)
                && matches!(self.heap.get(id), HeapData::List(_))
            {
                return self.delete_slice(id, slice);
            }
            match self.heap.get(id) {
                HeapData::List(items) => {
                    let index = self.sequence_index(key, items.len(), "list")?;
                    let Some(index) = index else {
                        return Err(index_error("list assignment index out of range"));
                    };
                    if let HeapData::List(items) = self.heap.get_mut(id) {
                        items.remove(index);
                    }
                    return Ok(());
                }
                HeapData::Dict(_) => {
                    let dict_key = DictKey::from_value(key, self.heap)?;
                    let removed = match self.heap.get_mut(id) {
                        HeapData::Dict(dict) => dict.remove(&dict_key),
                        _ => None,
                    };
                    return match removed {
                        Some(_) => Ok(()),
                        None => Err(self.key_error(key)),
                    };
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object doesn't support item deletion",
            container.type_name(self.heap)
        )))
    }

    fn slice_key(&self, key: Value) -> Option<Slice> {
        match key {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Slice(slice) => Some(*slice),
                _ => None,
            },
            _ => None,
        }
    }

    /// `container[start:stop:step]`: a new object of the container's type.
    fn get_slice(&mut self, id: HeapId, slice: Slice) -> RunResult<Value> {
        match self.heap.get(id) {
            HeapData::List(items) | HeapData::Tuple(items) => {
                let is_list = matches!(self.heap.get(id), HeapData::List(_));
                let indices = slice.indices(items.len(), self.heap)?;
                let picked: Vec<Value> = indices.positions().filter_map(|i| items.get(i).copied()).collect();
                Ok(if is_list {
                    self.heap.alloc_list(picked)?
                } else {
                    self.heap.alloc_tuple(picked)?
                })
            }
            HeapData::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let indices = slice.indices(chars.len(), self.heap)?;
                let picked: String = indices.positions().filter_map(|i| chars.get(i)).collect();
                Ok(self.heap.alloc_str(picked)?)
            }
            HeapData::Range(range) => {
                let range = *range;
                let indices = slice.indices(range.len(), self.heap)?;
                let at = |i: i64| i128::from(range.start) + i128::from(i) * i128::from(range.step);
                let bounds = (
                    i64::try_from(at(indices.start)),
                    i64::try_from(at(indices.stop)),
                    i64::try_from(i128::from(range.step) * i128::from(indices.step)),
                );
                let (Ok(start), Ok(stop), Ok(step)) = bounds else {
                    return Err(SimpleException::new_msg(ExcType::OverflowError, "range slice out of bounds").into());
                };
                Ok(Value::Ref(self.heap.allocate(HeapData::Range(Range::new(start, stop, step)))?))
            }
            data => Err(not_subscriptable(data.type_name())),
        }
    }

    /// `items[start:stop:step] = iterable`. A step of 1 may change the length;
    /// extended slices need an iterable of the same size.
    fn set_slice(&mut self, id: HeapId, slice: Slice, value: Value) -> RunResult<()> {
        let len = match self.heap.get(id) {
            HeapData::List(items) => items.len(),
            _ => return Err(RunError::internal("slice assignment target is not a list")),
        };
        let indices = slice.indices(len, self.heap)?;
        let values = match value {
            Value::Ref(other) if other == id => match self.heap.get(id) {
                HeapData::List(items) => items.clone(),
                _ => Vec::new(),
            },
            _ if self.is_iterable(value) => self.collect_iterable(value)?,
            _ => return Err(ExcType::type_error("can only assign an iterable")),
        };
        let positions: Vec<usize> = indices.positions().collect();
        if indices.step != 1 && positions.len() != values.len() {
            return Err(ExcType::value_error(format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                values.len(),
                positions.len()
            )));
        }
        let HeapData::List(items) = self.heap.get_mut(id) else {
            return Err(RunError::internal("slice assignment target is not a list"));
        };
        if indices.step == 1 {
            let start = usize::try_from(indices.start).unwrap_or(0).min(items.len());
            let stop = usize::try_from(indices.stop).unwrap_or(0).clamp(start, items.len());
            items.splice(start..stop, values);
        } else {
            for (position, value) in positions.into_iter().zip(values) {
                if let Some(slot) = items.get_mut(position) {
                    *slot = value;
                }
            }
        }
        Ok(())
    }

    /// `del items[start:stop:step]`.
    fn delete_slice(&mut self, id: HeapId, slice: Slice) -> RunResult<()> {
        let len = match self.heap.get(id) {
            HeapData::List(items) => items.len(),
            _ => return Err(RunError::internal("slice deletion target is not a list")),
        };
        let mut positions: Vec<usize> = slice.indices(len, self.heap)?.positions().collect();
        positions.sort_unstable();
        if let HeapData::List(items) = self.heap.get_mut(id) {
            for position in positions.into_iter().rev() {
                items.remove(position);
            }
        }
        Ok(())
    }

    /// Resolves an integer subscript against a sequence of `len` items.
    /// `Ok(None)` means out of range.
    fn sequence_index(&self, key: Value, len: usize, kind: &str) -> RunResult<Option<usize>> {
        match key {
            Value::Bool(_) | Value::Int(_) => Ok(key.as_index().and_then(|i| normalize_index(i, len))),
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::LongInt(_)) => {
                Err(index_error("cannot fit 'int' into an index-sized integer"))
            }
            _ => Err(ExcType::type_error(format!(
                "{kind} indices must be integers or slices, not {}",
                key.type_name(self.heap)
            ))),
        }
    }

    /// A `KeyError` carrying the missing key as its argument.
    fn key_error(&mut self, key: Value) -> RunError {
        let exc = ExceptionObject::new(ExcType::KeyError, vec![key]);
        match self.heap.allocate(HeapData::Exception(exc)) {
            Ok(id) => RunError::raised(id),
            Err(err) => err.into(),
        }
    }

    /// Calls a method of a built-in object that `load_attr` bound.
    pub(crate) fn call_bound_method(
        &mut self,
        receiver: Value,
        name: &str,
        args: ArgVec,
        kwargs: Vec<(String, Value)>,
    ) -> RunResult<Value> {
        if !kwargs.is_empty() {
            return Err(ExcType::type_error(format!("{name}() takes no keyword arguments")));
        }
        let Value::Ref(id) = receiver else {
            return Err(ExcType::attribute_error(receiver.type_name(self.heap), name));
        };
        match self.heap.get(id) {
            HeapData::Generator(generator) if generator.kind == GenKind::AsyncGenerator => {
                self.async_generator_method(id, receiver, name, &args)
            }
            HeapData::Generator(_) => self.generator_method(id, receiver, name, &args),
            HeapData::AsyncGenAwaitable(_) => self.awaitable_method(id, receiver, name, &args),
            HeapData::List(_) => self.list_method(id, name, &args),
            HeapData::Dict(_) => self.dict_method(id, name, &args),
            HeapData::Str(_) => self.str_method(id, name, &args),
            HeapData::Host(host) => {
                let host = Rc::clone(host);
                let args = args.into_iter().map(|arg| self.to_object(arg)).collect();
                match host.call_method(name, args) {
                    Ok(result) => self.from_object(result),
                    Err(exc) => Err(self.host_error(exc)),
                }
            }
            data => Err(ExcType::attribute_error(data.type_name(), name)),
        }
    }

    fn generator_method(&mut self, id: HeapId, receiver: Value, name: &str, args: &[Value]) -> RunResult<Value> {
        let outcome = match name {
            "send" => {
                let [value] = exact_args::<1>(name, args)?;
                self.resume_generator(id, GenAction::Send(value))?
            }
            "__next__" => {
                exact_args::<0>(name, args)?;
                self.resume_generator(id, GenAction::Send(Value::None))?
            }
            "throw" => {
                let exc = self.thrown_exception(name, args)?;
                self.resume_generator(id, GenAction::Throw(exc))?
            }
            "close" => {
                exact_args::<0>(name, args)?;
                return self.close_generator(id);
            }
            "__iter__" | "__await__" => {
                exact_args::<0>(name, args)?;
                return Ok(receiver);
            }
            _ => return Err(ExcType::attribute_error(receiver.type_name(self.heap), name)),
        };
        self.outcome_value(outcome)
    }

    fn async_generator_method(&mut self, id: HeapId, receiver: Value, name: &str, args: &[Value]) -> RunResult<Value> {
        let kind = match name {
            "asend" => {
                let [value] = exact_args::<1>(name, args)?;
                AwaitableKind::Send(value)
            }
            "__anext__" => {
                exact_args::<0>(name, args)?;
                AwaitableKind::Send(Value::None)
            }
            "athrow" => AwaitableKind::Throw(self.thrown_exception(name, args)?),
            "aclose" => {
                exact_args::<0>(name, args)?;
                AwaitableKind::Close
            }
            "__aiter__" => {
                exact_args::<0>(name, args)?;
                return Ok(receiver);
            }
            _ => return Err(ExcType::attribute_error(receiver.type_name(self.heap), name)),
        };
        self.async_gen_awaitable(id, kind)
    }

    fn awaitable_method(&mut self, id: HeapId, receiver: Value, name: &str, args: &[Value]) -> RunResult<Value> {
        let outcome = match name {
            "send" => {
                let [value] = exact_args::<1>(name, args)?;
                self.awaitable_resume(id, GenAction::Send(value))?
            }
            "__next__" => {
                exact_args::<0>(name, args)?;
                self.awaitable_resume(id, GenAction::Send(Value::None))?
            }
            "throw" => {
                let exc = self.thrown_exception(name, args)?;
                self.awaitable_resume(id, GenAction::Throw(exc))?
            }
            "close" => {
                exact_args::<0>(name, args)?;
                self.awaitable_resume(id, GenAction::Close)?;
                return Ok(Value::None);
            }
            "__iter__" | "__await__" => {
                exact_args::<0>(name, args)?;
                return Ok(receiver);
            }
            _ => return Err(ExcType::attribute_error(receiver.type_name(self.heap), name)),
        };
        self.outcome_value(outcome)
    }

    /// A yielded value is the method's result; completion raises `StopIteration`.
    fn outcome_value(&mut self, outcome: GenOutcome) -> RunResult<Value> {
        match outcome {
            GenOutcome::Yielded(value) => Ok(value),
            GenOutcome::Returned(value) => Err(self.stop_iteration(value)),
        }
    }

    /// The exception argument of `throw`/`athrow`: an instance or an exception class.
    fn thrown_exception(&mut self, name: &str, args: &[Value]) -> RunResult<HeapId> {
        let [value] = exact_args::<1>(name, args)?;
        self.make_exception(value, "exceptions must derive from BaseException")
    }

    fn list_method(&mut self, id: HeapId, name: &str, args: &[Value]) -> RunResult<Value> {
        match name {
            "append" => {
                let [value] = exact_args::<1>(name, args)?;
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.push(value);
                }
                Ok(Value::None)
            }
            "extend" => {
                let [iterable] = exact_args::<1>(name, args)?;
                let values = self.collect_iterable(iterable)?;
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.extend(values);
                }
                Ok(Value::None)
            }
            "pop" => {
                if args.len() > 1 {
                    return Err(ExcType::type_error(format!(
                        "pop expected at most 1 argument, got {}",
                        args.len()
                    )));
                }
                let HeapData::List(items) = self.heap.get(id) else {
                    return Err(RunError::internal("not a list"));
                };
                if items.is_empty() {
                    return Err(index_error("pop from empty list"));
                }
                let index = match args.first() {
                    Some(&key) => self.sequence_index(key, items.len(), "list")?,
                    None => Some(items.len() - 1),
                };
                let Some(index) = index else {
                    return Err(index_error("pop index out of range"));
                };
                match self.heap.get_mut(id) {
                    HeapData::List(items) => Ok(items.remove(index)),
                    _ => Err(RunError::internal("not a list")),
                }
            }
            _ => Err(ExcType::attribute_error("list", name)),
        }
    }

    fn dict_method(&mut self, id: HeapId, name: &str, args: &[Value]) -> RunResult<Value> {
        let HeapData::Dict(dict) = self.heap.get(id) else {
            return Err(RunError::internal("not a dict"));
        };
        match name {
            "get" => {
                let (key, default) = match args {
                    [key] => (*key, Value::None),
                    [key, default] => (*key, *default),
                    _ => {
                        return Err(ExcType::type_error(format!(
                            "get expected 1 or 2 arguments, got {}",
                            args.len()
                        )));
                    }
                };
                let dict_key = DictKey::from_value(key, self.heap)?;
                Ok(dict.get(&dict_key).unwrap_or(default))
            }
            "keys" | "values" | "items" => {
                exact_args::<0>(name, args)?;
                let values: Vec<Value> = match name {
                    "keys" => dict.keys().collect(),
                    "values" => dict.values().collect(),
                    _ => {
                        let pairs: Vec<(Value, Value)> = dict.items().collect();
                        let mut items = Vec::with_capacity(pairs.len());
                        for (key, value) in pairs {
                            items.push(self.heap.alloc_tuple(vec![key, value])?);
                        }
                        items
                    }
                };
                Ok(self.heap.alloc_list(values)?)
            }
            _ => Err(ExcType::attribute_error("dict", name)),
        }
    }

    fn str_method(&mut self, id: HeapId, name: &str, args: &[Value]) -> RunResult<Value> {
        if name != "join" {
            return Err(ExcType::attribute_error("str", name));
        }
        let [iterable] = exact_args::<1>(name, args)?;
        let parts = self.collect_iterable(iterable)?;
        let mut pieces = Vec::with_capacity(parts.len());
        for (index, part) in parts.into_iter().enumerate() {
            match self.heap.as_str(part) {
                Some(s) => pieces.push(s.to_owned()),
                None => {
                    return Err(ExcType::type_error(format!(
                        "sequence item {index}: expected str instance, {} found",
                        part.type_name(self.heap)
                    )));
                }
            }
        }
        let HeapData::Str(separator) = self.heap.get(id) else {
            return Err(RunError::internal("not a str"));
        };
        let joined = pieces.join(separator.as_str());
        Ok(self.heap.alloc_str(joined)?)
    }
}

/// Checks the argument count of a fixed-arity method and returns the arguments.
fn exact_args<const N: usize>(name: &str, args: &[Value]) -> RunResult<[Value; N]> {
    <[Value; N]>::try_from(args).map_err(|_| match N {
        0 => ExcType::type_error(format!("{name}() takes no arguments ({} given)", args.len())),
        1 => ExcType::type_error(format!("{name}() takes exactly one argument ({} given)", args.len())),
        _ => ExcType::type_error(format!("{name}() takes exactly {N} arguments ({} given)", args.len())),
    })
}

/// Maps a possibly negative index into `0..len`.
/// Built-in sequences that slice keys select from.
fn is_sliceable(data: &HeapData) -> bool {
    matches!(
        data,
        HeapData::List(_) | HeapData::Tuple(_) | HeapData::Str(_) | HeapData::Range(_)
    )
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

fn index_error(msg: impl std::fmt::Display) -> RunError {
    SimpleException::new_msg(ExcType::IndexError, msg).into()
}

fn not_subscriptable(type_name: impl std::fmt::Display) -> RunError {
    ExcType::type_error(format!("'{type_name}' object is not subscriptable"))
}

fn no_item_assignment(type_name: impl std::fmt::Display) -> RunError {
    ExcType::type_error(format!("'{type_name}' object does not support item assignment"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_wrap_once() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(-3, 3), Some(0));
        assert_eq!(normalize_index(-4, 3), None);
        assert_eq!(normalize_index(3, 3), None);
        assert_eq!(normalize_index(0, 0), None);
    }

    #[test]
    fn arity_messages() {
        let args = [Value::None, Value::None];
        let Err(RunError::Exc(exc)) = exact_args::<1>("send", &args) else {
            panic!("expected an arity error");
        };
        assert_eq!(exc.message(), Some("send() takes exactly one argument (2 given)"));
        let Err(RunError::Exc(exc)) = exact_args::<0>("close", &args[..1]) else {
            panic!("expected an arity error");
        };
        assert_eq!(exc.message(), Some("close() takes no arguments (1 given)"));
    }
}
