//! Exception unwinding, implicit chaining and the handler instructions,
//! including the `except*` group-splitting protocol.

use ahash::AHashSet;

use super::Vm;
use crate::{
    builtins::Builtins,
    exception::{ExcType, RunError, RunResult, StackFrame},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{ExceptionGroupData, ExceptionObject},
    value::Value,
};

/// Upper bound on context links walked when breaking a chain cycle.
const MAX_CONTEXT_WALK: usize = 10_000;

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Routes an error raised in the top frame to a handler.
    ///
    /// Returns `None` once a handler in some frame at or above `entry_depth`
    /// has been entered, or the error to propagate out of the run loop.
    pub(super) fn handle_exception(&mut self, mut err: RunError, entry_depth: usize) -> Option<RunError> {
        loop {
            if !err.is_catchable() {
                while self.frames.len() >= entry_depth && self.discard_frame().is_some() {}
                return Some(err);
            }
            let (id, reraise) = match self.materialize_error(err) {
                Ok(raised) => raised,
                Err(failure) => {
                    err = failure;
                    continue;
                }
            };
            if !reraise {
                self.chain_context(id);
            }
            let new_frame = self.record_traceback(id);
            if (!reraise || new_frame)
                && self.thread.is_active()
                && let Err(hook_err) = self.fire_exception(id)
            {
                err = hook_err;
                continue;
            }

            let Some(frame) = self.frames.last_mut() else {
                return Some(RunError::reraised(id));
            };
            // `ip == 0`: nothing has run yet (a throw into an unstarted generator),
            // so no protected region of the body is active.
            if frame.ip > 0
                && let Some(entry) = frame.code.find_exception_handler(frame.op_ip)
            {
                let handler = entry.handler() as usize;
                let depth = frame.stack_base + usize::from(entry.stack_depth());
                frame.ip = handler;
                self.stack.truncate(depth);
                self.push(Value::Ref(id));
                return None;
            }

            let mut pending = RunError::reraised(id);
            if let Err(hook_err) = self.fire_return(Value::None) {
                pending = hook_err;
            }
            let was_entry = self.frames.len() <= entry_depth;
            self.discard_frame();
            if was_entry {
                return Some(pending);
            }
            err = pending;
        }
    }

    /// Makes sure a catchable error is a heap exception.
    fn materialize_error(&mut self, err: RunError) -> RunResult<(HeapId, bool)> {
        match err {
            RunError::Exc(exc) => Ok((ExceptionObject::allocate(self.heap, *exc)?, false)),
            RunError::Raised(raise) => Ok((raise.id, raise.reraise)),
            other => Err(other),
        }
    }

    /// The exception currently being handled, searching outward through the slots.
    pub(super) fn ambient_exception(&self) -> Option<HeapId> {
        self.exc_slots.iter().rev().find_map(|slot| *slot)
    }

    /// Records the handled exception as the implicit context of a newly raised one.
    fn chain_context(&mut self, id: HeapId) {
        if let Some(ambient) = self.ambient_exception() {
            self.link_context(id, ambient);
        }
    }

    /// Chains `err` to `context` when it is raised while `context` is being
    /// handled outside any `except` block.
    pub(super) fn chain_error(&mut self, err: RunError, context: HeapId) -> RunError {
        match self.materialize_error(err) {
            Ok((id, reraise)) => {
                self.link_context(id, context);
                if reraise {
                    RunError::reraised(id)
                } else {
                    RunError::raised(id)
                }
            }
            Err(other) => other,
        }
    }

    fn link_context(&mut self, id: HeapId, ambient: HeapId) {
        if ambient == id {
            return;
        }
        match self.heap.exception(id) {
            Some(exc) if exc.context.is_none() && exc.cause.is_none() => {}
            _ => return,
        }
        // Cut the ambient chain where it leads back to `id`.
        let mut cursor = ambient;
        for _ in 0..MAX_CONTEXT_WALK {
            let Some(next) = self.heap.exception(cursor).and_then(|exc| exc.context) else {
                break;
            };
            if next == id {
                if let Some(exc) = self.heap.exception_mut(cursor) {
                    exc.context = None;
                }
                break;
            }
            cursor = next;
        }
        if let Some(exc) = self.heap.exception_mut(id) {
            exc.context = Some(ambient);
        }
    }

    /// Adds the current frame to the traceback. Returns false if this
    /// activation already recorded itself.
    fn record_traceback(&mut self, id: HeapId) -> bool {
        let Some(frame) = self.frames.last() else {
            return false;
        };
        let serial = frame.serial;
        let entry = StackFrame {
            name: frame.code.qualname.clone(),
            line: frame.code.line_for(frame.op_ip),
        };
        let Some(exc) = self.heap.exception_mut(id) else {
            return false;
        };
        if exc.traced_frame == Some(serial) {
            return false;
        }
        exc.traceback.insert(0, entry);
        exc.traced_frame = Some(serial);
        true
    }

    pub(super) fn exception_id(&self, value: Value) -> RunResult<HeapId> {
        match value {
            Value::Ref(id) if self.heap.exception(id).is_some() => Ok(id),
            _ => Err(RunError::internal(format!(
                "expected an exception object, got '{}'",
                value.type_name(self.heap)
            ))),
        }
    }

    /// True if `err` is (or will become) an exception of class `exc_type` or a subclass.
    pub(super) fn error_is(&self, err: &RunError, exc_type: ExcType) -> bool {
        match err {
            RunError::Exc(exc) => exc.exc_type().is_subclass_of(exc_type),
            RunError::Raised(raise) => self
                .heap
                .exception(raise.id)
                .is_some_and(|exc| exc.exc_type.is_subclass_of(exc_type)),
            _ => false,
        }
    }

    /// Turns a raised operand into an exception object: instances are used
    /// as-is, classes are instantiated without arguments.
    pub(super) fn make_exception(&mut self, value: Value, not_exception: &'static str) -> RunResult<HeapId> {
        match value {
            Value::Ref(id) if self.heap.exception(id).is_some() => Ok(id),
            Value::Builtin(Builtins::ExcType(exc_type)) => {
                let instance = self.construct_exception(exc_type, &[], Vec::new())?;
                self.exception_id(instance)
            }
            _ => Err(ExcType::type_error(not_exception)),
        }
    }

    /// `Raise(argc)`: 0 re-raises the handled exception, 1 raises TOS, 2 raises with a cause.
    pub(super) fn raise(&mut self, argc: usize) -> RunResult<RunError> {
        const NOT_EXCEPTION: &str = "exceptions must derive from BaseException";
        match argc {
            0 => self
                .ambient_exception()
                .map(RunError::reraised)
                .ok_or_else(ExcType::no_active_exception),
            1 => {
                let value = self.pop()?;
                Ok(RunError::raised(self.make_exception(value, NOT_EXCEPTION)?))
            }
            2 => {
                let cause = self.pop()?;
                let value = self.pop()?;
                let id = self.make_exception(value, NOT_EXCEPTION)?;
                let cause = match cause {
                    Value::None => None,
                    other => Some(self.make_exception(other, "exception causes must derive from BaseException")?),
                };
                if let Some(exc) = self.heap.exception_mut(id) {
                    exc.cause = cause;
                    exc.suppress_context = true;
                }
                Ok(RunError::raised(id))
            }
            _ => Err(RunError::internal(format!("Raise with operand {argc}"))),
        }
    }

    /// `[exc] -> [previous, exc]`, making `exc` the handled exception.
    pub(super) fn push_exc_info(&mut self) -> RunResult<()> {
        let exc = self.pop()?;
        let previous = self.exc_slots.last().copied().flatten();
        self.push(previous.map_or(Value::None, Value::Ref));
        self.push(exc);
        if let Some(slot) = self.exc_slots.last_mut() {
            *slot = exc.ref_id();
        }
        Ok(())
    }

    /// `[previous] -> []`, restoring the handled exception.
    pub(super) fn pop_except(&mut self) -> RunResult<()> {
        let previous = self.pop()?;
        if let Some(slot) = self.exc_slots.last_mut() {
            *slot = previous.ref_id();
        }
        Ok(())
    }

    /// `[previous, exc] -> []`: restores the handled exception, then re-raises `exc`.
    pub(super) fn except_cleanup(&mut self) -> RunResult<RunError> {
        let exc = self.pop()?;
        self.pop_except()?;
        Ok(RunError::reraised(self.exception_id(exc)?))
    }

    /// `[exc, type] -> [exc, matched]`.
    pub(super) fn check_exc_match(&mut self) -> RunResult<()> {
        let handler = self.pop()?;
        let exc = self.peek(0)?;
        let types = self.handler_types(handler)?;
        let id = self.exception_id(exc)?;
        let exc_type = self.heap.exception(id).map(|e| e.exc_type);
        let matched = exc_type.is_some_and(|t| types.iter().any(|h| t.is_subclass_of(*h)));
        self.push(Value::Bool(matched));
        Ok(())
    }

    /// Classes named by an `except` clause: one class or a tuple of classes.
    fn handler_types(&self, handler: Value) -> RunResult<Vec<ExcType>> {
        const NOT_CLASS: &str = "catching classes that do not inherit from BaseException is not allowed";
        match handler {
            Value::Builtin(Builtins::ExcType(t)) => Ok(vec![t]),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Tuple(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::Builtin(Builtins::ExcType(t)) => Ok(*t),
                        _ => Err(ExcType::type_error(NOT_CLASS)),
                    })
                    .collect(),
                _ => Err(ExcType::type_error(NOT_CLASS)),
            },
            _ => Err(ExcType::type_error(NOT_CLASS)),
        }
    }

    /// `[exc, type] -> [rest, matched]` for one `except*` clause.
    pub(super) fn check_eg_match(&mut self) -> RunResult<()> {
        let handler = self.pop()?;
        let exc = self.pop()?;
        let types = self.handler_types(handler)?;
        if types.iter().any(|t| t.is_group()) {
            return Err(ExcType::type_error(
                "catching ExceptionGroup with except* is not allowed. Use except instead.",
            ));
        }
        if exc == Value::None {
            self.push(Value::None);
            self.push(Value::None);
            return Ok(());
        }
        let id = self.exception_id(exc)?;
        let (matched, rest) = self.match_eg(id, &types)?;
        self.push(rest.map_or(Value::None, Value::Ref));
        self.push(matched.map_or(Value::None, Value::Ref));
        if let Some(matched) = matched
            && let Some(slot) = self.exc_slots.last_mut()
        {
            *slot = Some(matched);
        }
        Ok(())
    }

    fn match_eg(&mut self, id: HeapId, types: &[ExcType]) -> RunResult<(Option<HeapId>, Option<HeapId>)> {
        let Some(exc) = self.heap.exception(id) else {
            return Err(RunError::internal("except* operand is not an exception"));
        };
        if types.iter().any(|t| exc.exc_type.is_subclass_of(*t)) {
            if exc.group.is_some() {
                return Ok((Some(id), None));
            }
            // A naked exception matched by except* is wrapped in a group.
            let traceback = exc.traceback.clone();
            let wrapper = self.new_group(String::new(), vec![id])?;
            if let Some(group) = self.heap.exception_mut(wrapper) {
                group.traceback = traceback;
            }
            return Ok((Some(wrapper), None));
        }
        if exc.group.is_none() {
            return Ok((None, Some(id)));
        }
        self.split_group(id, &|_, exc_type| types.iter().any(|t| exc_type.is_subclass_of(*t)))
    }

    /// Splits a group into `(matching, rest)` by a predicate over its leaves,
    /// preserving nesting and reusing any subgroup that is kept whole.
    fn split_group(
        &mut self,
        id: HeapId,
        predicate: &dyn Fn(HeapId, ExcType) -> bool,
    ) -> RunResult<(Option<HeapId>, Option<HeapId>)> {
        let Some(exc) = self.heap.exception(id) else {
            return Err(RunError::internal("group member is not an exception"));
        };
        let Some(group) = &exc.group else {
            return Ok(if predicate(id, exc.exc_type) {
                (Some(id), None)
            } else {
                (None, Some(id))
            });
        };
        let leaves = group.exceptions.clone();
        let mut matched = Vec::new();
        let mut rest = Vec::new();
        for leaf in &leaves {
            let (m, r) = self.split_group(*leaf, predicate)?;
            matched.extend(m);
            rest.extend(r);
        }
        Ok((self.derive_group(id, &leaves, matched)?, self.derive_group(id, &leaves, rest)?))
    }

    /// A group like `original` holding `parts`; `original` itself when nothing was removed.
    fn derive_group(&mut self, original: HeapId, leaves: &[HeapId], parts: Vec<HeapId>) -> RunResult<Option<HeapId>> {
        if parts.is_empty() {
            return Ok(None);
        }
        if parts == leaves {
            return Ok(Some(original));
        }
        let list = self.heap.alloc_list(parts.iter().copied().map(Value::Ref).collect())?;
        let Some(exc) = self.heap.exception(original) else {
            return Err(RunError::internal("group is not an exception"));
        };
        let exc_type = if exc.exc_type == ExcType::ExceptionGroup || self.all_exceptions(&parts) {
            ExcType::ExceptionGroup
        } else {
            ExcType::BaseExceptionGroup
        };
        let derived = exc.derive_group(exc_type, parts, list);
        Ok(Some(self.heap.allocate(HeapData::Exception(derived))?))
    }

    fn all_exceptions(&self, parts: &[HeapId]) -> bool {
        parts.iter().all(|part| {
            self.heap
                .exception(*part)
                .is_some_and(|exc| exc.exc_type.is_subclass_of(ExcType::Exception))
        })
    }

    /// Allocates a fresh group, `ExceptionGroup` when every part is an `Exception`.
    pub(super) fn new_group(&mut self, message: String, parts: Vec<HeapId>) -> RunResult<HeapId> {
        let exc_type = if self.all_exceptions(&parts) {
            ExcType::ExceptionGroup
        } else {
            ExcType::BaseExceptionGroup
        };
        let message_value = self.heap.alloc_str(message.as_str())?;
        let list = self.heap.alloc_list(parts.iter().copied().map(Value::Ref).collect())?;
        let mut exc = ExceptionObject::new(exc_type, vec![message_value, list]);
        exc.group = Some(ExceptionGroupData {
            message,
            exceptions: parts,
        });
        Ok(self.heap.allocate(HeapData::Exception(exc))?)
    }

    /// Identities of the non-group exceptions inside `id`.
    fn leaf_ids(&self, id: HeapId, out: &mut Vec<HeapId>) {
        match self.heap.exception(id).and_then(|exc| exc.group.as_ref()) {
            Some(group) => {
                for leaf in &group.exceptions {
                    self.leaf_ids(*leaf, out);
                }
            }
            None => out.push(id),
        }
    }

    /// `[original, results] -> [exc_or_none]`: combines what the `except*`
    /// clauses raised or re-raised into the exception that leaves the statement.
    pub(super) fn prep_reraise_star(&mut self) -> RunResult<()> {
        let results = self.pop()?;
        let original = self.pop()?;
        let raised: Vec<Value> = self
            .sequence_items(results)?
            .into_iter()
            .filter(|v| *v != Value::None)
            .collect();
        if raised.is_empty() {
            self.push(Value::None);
            return Ok(());
        }
        let original = self.exception_id(original)?;
        if self.heap.exception(original).is_some_and(|exc| exc.group.is_none()) {
            self.push(raised[0]);
            return Ok(());
        }

        let mut original_leaves = Vec::new();
        self.leaf_ids(original, &mut original_leaves);
        let original_leaves: AHashSet<HeapId> = original_leaves.into_iter().collect();
        let mut reraised = AHashSet::new();
        let mut new_raises = Vec::new();
        for value in raised {
            let id = self.exception_id(value)?;
            let mut leaves = Vec::new();
            self.leaf_ids(id, &mut leaves);
            if !leaves.is_empty() && leaves.iter().all(|leaf| original_leaves.contains(leaf)) {
                reraised.extend(leaves);
            } else {
                new_raises.push(id);
            }
        }

        let projection = if reraised.is_empty() {
            None
        } else {
            self.split_group(original, &|leaf, _| reraised.contains(&leaf))?.0
        };
        let result = if new_raises.is_empty() {
            projection
        } else {
            new_raises.extend(projection);
            Some(self.new_group(String::new(), new_raises)?)
        };
        self.push(result.map_or(Value::None, Value::Ref));
        Ok(())
    }
}
