//! Container building, unpacking and the iteration protocol.

use std::rc::Rc;

use super::Vm;
use crate::{
    exception::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{Dict, DictKey, GenAction, GenKind, GenOutcome, IterSource, Range, SeqIter},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// `BuildDict(n)`: pops `n` key/value pairs, pushed key first.
    pub(super) fn build_dict(&mut self, n: usize) -> RunResult<()> {
        let items = self.pop_n(n * 2)?;
        let mut dict = Dict::new();
        for pair in items.chunks_exact(2) {
            let key = DictKey::from_value(pair[0], self.heap)?;
            dict.insert(key, pair[0], pair[1]);
        }
        let id = self.heap.allocate(HeapData::Dict(dict))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    /// The list `n` entries below the top once the operand has been popped.
    fn list_operand(&self, n: usize) -> RunResult<HeapId> {
        let target = self.peek(n.saturating_sub(1))?;
        match target {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::List(_)) => Ok(id),
            _ => Err(RunError::internal("list instruction target is not a list")),
        }
    }

    pub(super) fn list_append(&mut self, n: usize) -> RunResult<()> {
        let value = self.pop()?;
        let id = self.list_operand(n)?;
        if let HeapData::List(items) = self.heap.get_mut(id) {
            items.push(value);
        }
        Ok(())
    }

    pub(super) fn list_extend(&mut self, n: usize) -> RunResult<()> {
        let iterable = self.pop()?;
        let id = self.list_operand(n)?;
        if !self.is_iterable(iterable) {
            return Err(ExcType::type_error(format!(
                "Value after * must be an iterable, not {}",
                iterable.type_name(self.heap)
            )));
        }
        let values = self.collect_iterable(iterable)?;
        if let HeapData::List(items) = self.heap.get_mut(id) {
            items.extend(values);
        }
        Ok(())
    }

    pub(super) fn list_to_tuple(&mut self) -> RunResult<()> {
        let list = self.pop()?;
        let items = self.sequence_items(list)?;
        let tuple = self.heap.alloc_tuple(items)?;
        self.push(tuple);
        Ok(())
    }

    /// `UnpackSequence(n)`: pushes exactly `n` items, the first on top.
    pub(super) fn unpack_sequence(&mut self, n: usize) -> RunResult<()> {
        let value = self.pop()?;
        let items = match self.fixed_items(value) {
            Some(items) => {
                if items.len() < n {
                    return Err(ExcType::not_enough_values(n, items.len()));
                }
                if items.len() > n {
                    return Err(ExcType::too_many_values(n));
                }
                items
            }
            None => {
                let iterator = self.unpack_iter(value)?;
                let mut items = Vec::with_capacity(n);
                while items.len() < n {
                    match self.iter_next(iterator)? {
                        Some(item) => items.push(item),
                        None => return Err(ExcType::not_enough_values(n, items.len())),
                    }
                }
                if self.iter_next(iterator)?.is_some() {
                    return Err(ExcType::too_many_values(n));
                }
                items
            }
        };
        self.stack.extend(items.into_iter().rev());
        Ok(())
    }

    /// `UnpackEx(before, after)`: `before` targets, a starred list, then `after` targets.
    pub(super) fn unpack_ex(&mut self, before: usize, after: usize) -> RunResult<()> {
        let value = self.pop()?;
        let mut items = match self.fixed_items(value) {
            Some(items) => items,
            None => {
                let iterator = self.unpack_iter(value)?;
                let mut items = Vec::new();
                while let Some(item) = self.iter_next(iterator)? {
                    items.push(item);
                }
                items
            }
        };
        if items.len() < before + after {
            return Err(ExcType::not_enough_values_star(before + after, items.len()));
        }
        let tail = items.split_off(items.len() - after);
        let middle = items.split_off(before);
        let star = self.heap.alloc_list(middle)?;
        self.stack.extend(tail.into_iter().rev());
        self.push(star);
        self.stack.extend(items.into_iter().rev());
        Ok(())
    }

    /// The items of a list or tuple, copied out; `None` for other values.
    fn fixed_items(&self, value: Value) -> Option<Vec<Value>> {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::List(items) | HeapData::Tuple(items) => Some(items.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    fn unpack_iter(&mut self, value: Value) -> RunResult<Value> {
        if !self.is_iterable(value) {
            return Err(ExcType::cannot_unpack(value.type_name(self.heap)));
        }
        self.get_iter(value)
    }

    pub(super) fn is_iterable(&self, value: Value) -> bool {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Str(_)
                | HeapData::List(_)
                | HeapData::Tuple(_)
                | HeapData::Dict(_)
                | HeapData::Range(_)
                | HeapData::Iter(_)
                | HeapData::Host(_) => true,
                HeapData::Generator(generator) => generator.kind == GenKind::Generator,
                _ => false,
            },
            _ => false,
        }
    }

    /// `iter(value)`.
    pub(crate) fn get_iter(&mut self, value: Value) -> RunResult<Value> {
        let Value::Ref(id) = value else {
            return Err(ExcType::not_iterable(value.type_name(self.heap)));
        };
        let source = match self.heap.get(id) {
            HeapData::List(_) => IterSource::List(id),
            HeapData::Tuple(_) => IterSource::Tuple(id),
            HeapData::Str(_) => IterSource::Str(id),
            HeapData::Dict(_) => IterSource::Dict(id),
            HeapData::Range(range) => IterSource::Range(*range),
            HeapData::Iter(_) => return Ok(value),
            HeapData::Generator(generator) if generator.kind == GenKind::Generator => return Ok(value),
            HeapData::Host(host) => {
                if !host.has_method("__iter__") {
                    return Ok(value);
                }
                let host = Rc::clone(host);
                return match host.call_method("__iter__", Vec::new()) {
                    Ok(object) => self.from_object(object),
                    Err(exc) => Err(self.host_error(exc)),
                };
            }
            data => return Err(ExcType::not_iterable(data.type_name())),
        };
        let id = self.heap.allocate(HeapData::Iter(SeqIter::new(source)))?;
        Ok(Value::Ref(id))
    }

    /// `next(iterator)`; `Ok(None)` on exhaustion.
    pub(crate) fn iter_next(&mut self, iterator: Value) -> RunResult<Option<Value>> {
        let Value::Ref(id) = iterator else {
            return Err(not_an_iterator(iterator.type_name(self.heap)));
        };
        match self.heap.get(id) {
            HeapData::Iter(_) => self.seq_iter_next(id),
            HeapData::Generator(generator) if generator.kind == GenKind::Generator => {
                match self.resume_generator(id, GenAction::Send(Value::None))? {
                    GenOutcome::Yielded(value) => Ok(Some(value)),
                    GenOutcome::Returned(_) => Ok(None),
                }
            }
            HeapData::Host(host) => {
                let host = Rc::clone(host);
                match host.iter_next() {
                    Ok(Some(object)) => self.from_object(object).map(Some),
                    Ok(None) => Ok(None),
                    Err(exc) if exc.exc_type() == ExcType::StopIteration => Ok(None),
                    Err(exc) => Err(self.host_error(exc)),
                }
            }
            data => Err(not_an_iterator(data.type_name())),
        }
    }

    fn seq_iter_next(&mut self, id: HeapId) -> RunResult<Option<Value>> {
        let HeapData::Iter(iter) = self.heap.get(id) else {
            return Err(RunError::internal("not a sequence iterator"));
        };
        if iter.exhausted {
            return Ok(None);
        }
        let (source, position) = (iter.source, iter.position);
        let (item, advance) = match source {
            IterSource::List(seq) | IterSource::Tuple(seq) => match self.heap.get(seq) {
                HeapData::List(items) | HeapData::Tuple(items) => (items.get(position).copied().map(Next::Value), 1),
                _ => (None, 0),
            },
            IterSource::Str(seq) => match self.heap.get(seq) {
                HeapData::Str(s) => match s.get(position..).and_then(|rest| rest.chars().next()) {
                    Some(c) => (Some(Next::Char(c)), c.len_utf8()),
                    None => (None, 0),
                },
                _ => (None, 0),
            },
            IterSource::Dict(seq) => match self.heap.get(seq) {
                HeapData::Dict(dict) => (dict.key_at(position).map(Next::Value), 1),
                _ => (None, 0),
            },
            IterSource::Range(range) => (range_item(range, position).map(Next::Value), 1),
        };
        let item = match item {
            Some(Next::Value(value)) => Some(value),
            Some(Next::Char(c)) => Some(self.heap.alloc_str(c)?),
            None => None,
        };
        if let HeapData::Iter(iter) = self.heap.get_mut(id) {
            if item.is_some() {
                iter.position += advance;
            } else {
                iter.exhausted = true;
            }
        }
        Ok(item)
    }

    /// Drains an iterable into a vector.
    pub(crate) fn collect_iterable(&mut self, iterable: Value) -> RunResult<Vec<Value>> {
        if let Some(items) = self.fixed_items(iterable) {
            return Ok(items);
        }
        let iterator = self.get_iter(iterable)?;
        let mut items = Vec::new();
        while let Some(item) = self.iter_next(iterator)? {
            items.push(item);
        }
        Ok(items)
    }
}

/// One step of a sequence iterator before allocation.
enum Next {
    Value(Value),
    Char(char),
}

fn range_item(range: Range, position: usize) -> Option<Value> {
    range.get(position).map(Value::Int)
}

fn not_an_iterator(type_name: impl std::fmt::Display) -> RunError {
    ExcType::type_error(format!("'{type_name}' object is not an iterator"))
}
