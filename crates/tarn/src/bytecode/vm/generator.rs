//! The generator, coroutine and async generator protocol.
//!
//! A resumption rebuilds the saved activation on top of the VM stacks and runs
//! a nested loop whose entry frame is the generator's frame. The loop exits when
//! the frame yields (its state is saved back into the generator) or finishes.

use std::{rc::Rc, sync::Arc};

use tracing::debug;

use super::{Frame, FrameExit, Step, Vm};
use crate::{
    bytecode::op::Opcode,
    code::CodeFlags,
    exception::{ExcType, Exception, RunError, RunResult, SimpleException},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    object::Object,
    resource::ResourceTracker,
    types::{
        AsyncGenAwaitable, AwaitableKind, AwaitableState, ExceptionObject, Function, GenAction, GenKind, GenOutcome,
        GenState, Generator, SavedFrame,
    },
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Wraps a bound activation of a resumable code unit in a new generator object.
    pub(super) fn make_generator(&mut self, function: &Function, locals: Vec<Value>, cells: Vec<HeapId>) -> RunResult<Value> {
        let flags = function.code.flags;
        let kind = if flags.contains(CodeFlags::IS_COROUTINE) {
            GenKind::Coroutine
        } else if flags.contains(CodeFlags::IS_ASYNC_GENERATOR) {
            GenKind::AsyncGenerator
        } else {
            GenKind::Generator
        };
        let frame = SavedFrame {
            ip: 0,
            yield_ip: 0,
            stack: Vec::new(),
            locals,
            cells,
            exc_state: None,
        };
        let generator = Generator::new(
            kind,
            Arc::clone(&function.code),
            function.name.clone(),
            function.qualname.clone(),
            frame,
        );
        Ok(Value::Ref(self.heap.allocate(HeapData::Generator(generator))?))
    }

    fn generator_ref(&self, id: HeapId) -> RunResult<&Generator> {
        self.heap
            .generator(id)
            .ok_or_else(|| RunError::internal("resumed object is not a generator"))
    }

    fn generator_ref_mut(&mut self, id: HeapId) -> RunResult<&mut Generator> {
        self.heap
            .generator_mut(id)
            .ok_or_else(|| RunError::internal("resumed object is not a generator"))
    }

    /// Resumes a generator with `action` and runs it to its next yield or completion.
    pub(crate) fn resume_generator(&mut self, id: HeapId, action: GenAction) -> RunResult<GenOutcome> {
        let generator = self.generator_ref(id)?;
        let kind = generator.kind;
        let state = generator.state;
        let delegate = generator.delegate();
        match state {
            GenState::Running => return Err(ExcType::generator_already_executing(kind.noun())),
            GenState::Finished => {
                return match action {
                    GenAction::Send(_) if kind == GenKind::Coroutine => {
                        Err(ExcType::runtime_error("cannot reuse already awaited coroutine"))
                    }
                    GenAction::Send(_) | GenAction::Close => Ok(GenOutcome::Returned(Value::None)),
                    GenAction::Throw(exc) => Err(RunError::raised(exc)),
                };
            }
            GenState::Unstarted => match action {
                GenAction::Send(value) if value != Value::None => {
                    return Err(ExcType::cant_send_non_none(kind.noun()));
                }
                GenAction::Close => {
                    self.finish_generator(id)?;
                    return Ok(GenOutcome::Returned(Value::None));
                }
                GenAction::Send(_) | GenAction::Throw(_) => {}
            },
            GenState::Suspended => {}
        }

        let mut pending = None;
        let mut push_sent = state == GenState::Suspended;
        match action {
            GenAction::Send(_) => {}
            GenAction::Close => {
                if let Some(delegate) = delegate
                    && let Err(err) = self.close_delegate(delegate)
                {
                    pending = Some(err);
                }
                if pending.is_none() {
                    pending = Some(SimpleException::new_none(ExcType::GeneratorExit).into());
                }
            }
            GenAction::Throw(exc) => {
                if let Some(exc_obj) = self.heap.exception_mut(exc) {
                    exc_obj.context = None;
                }
                let is_exit = self
                    .heap
                    .exception(exc)
                    .is_some_and(|e| e.exc_type.is_subclass_of(ExcType::GeneratorExit));
                match delegate {
                    Some(delegate) if is_exit => {
                        if let Err(err) = self.close_delegate(delegate) {
                            pending = Some(err);
                        }
                    }
                    Some(delegate) if self.delegate_has_throw(delegate) => {
                        self.generator_ref_mut(id)?.state = GenState::Running;
                        let result = self.delegate_throw(delegate, exc);
                        let generator = self.generator_ref_mut(id)?;
                        if generator.state == GenState::Running {
                            generator.state = GenState::Suspended;
                        }
                        match result {
                            Ok(GenOutcome::Yielded(value)) => return Ok(GenOutcome::Yielded(value)),
                            Ok(GenOutcome::Returned(value)) => {
                                // The delegation finished: continue after the YieldFrom with its result.
                                let generator = self.generator_ref_mut(id)?;
                                if let Some(frame) = generator.frame.as_mut() {
                                    if let Some(top) = frame.stack.last_mut() {
                                        *top = value;
                                    }
                                    frame.ip = frame.yield_ip + Opcode::YieldFrom.size();
                                }
                                generator.suspended_in_yield_from = false;
                                push_sent = false;
                            }
                            Err(err) => pending = Some(err),
                        }
                    }
                    _ => {}
                }
                // An unstarted body receives the exception before its first instruction.
                if (push_sent || state == GenState::Unstarted) && pending.is_none() {
                    pending = Some(RunError::raised(exc));
                }
            }
        }
        let sent = match action {
            GenAction::Send(value) if push_sent && pending.is_none() => Some(value),
            _ => None,
        };
        self.run_generator(id, kind, sent, pending)
    }

    /// Re-enters the saved activation and runs it until it yields or finishes.
    fn run_generator(
        &mut self,
        id: HeapId,
        kind: GenKind,
        sent: Option<Value>,
        pending: Option<RunError>,
    ) -> RunResult<GenOutcome> {
        let generator = self.generator_ref_mut(id)?;
        let saved = generator
            .frame
            .take()
            .ok_or_else(|| RunError::internal("suspended generator has no frame"))?;
        generator.state = GenState::Running;
        let code = Arc::clone(&generator.code);
        debug!(generator = %generator.qualname, kind = kind.type_name(), "resuming");

        let SavedFrame {
            ip,
            yield_ip,
            stack,
            locals,
            cells,
            exc_state,
        } = saved;
        self.exc_slots.push(exc_state);
        let base = self.stack.len();
        self.stack.extend(stack);
        if let Some(value) = sent {
            self.push(value);
        }
        let code_idx = self.codes.index_of(&code);
        let mut frame = Frame::new(code, code_idx, base, locals, cells);
        frame.ip = ip;
        frame.op_ip = yield_ip;
        frame.generator = Some(id);

        let depth = self.frames.len() + 1;
        if let Err(err) = self.push_frame(frame) {
            self.exc_slots.pop();
            self.stack.truncate(base);
            self.finish_generator(id)?;
            return Err(err);
        }
        let result = self.run_frames(depth, pending);
        let slot = self.exc_slots.pop().flatten();
        match result {
            Ok(FrameExit::Yield(value)) => {
                let generator = self.generator_ref_mut(id)?;
                generator.state = GenState::Suspended;
                if let Some(frame) = generator.frame.as_mut() {
                    frame.exc_state = slot;
                }
                Ok(GenOutcome::Yielded(value))
            }
            Ok(FrameExit::Return(value)) => {
                self.finish_generator(id)?;
                Ok(GenOutcome::Returned(value))
            }
            Err(err) => {
                self.finish_generator(id)?;
                Err(self.convert_stop_iteration(err, kind))
            }
        }
    }

    fn finish_generator(&mut self, id: HeapId) -> RunResult<()> {
        let generator = self.generator_ref_mut(id)?;
        if generator.state != GenState::Finished {
            debug!(generator = %generator.qualname, "finished");
        }
        generator.finish();
        Ok(())
    }

    /// A `StopIteration` (or, for async generators, `StopAsyncIteration`)
    /// escaping a body becomes a `RuntimeError` caused by it.
    fn convert_stop_iteration(&mut self, err: RunError, kind: GenKind) -> RunError {
        let message = if self.error_is(&err, ExcType::StopIteration) {
            format!("{} raised StopIteration", kind.noun())
        } else if kind == GenKind::AsyncGenerator && self.error_is(&err, ExcType::StopAsyncIteration) {
            "async generator raised StopAsyncIteration".to_owned()
        } else {
            return err;
        };
        let original = match err {
            RunError::Exc(exc) => match ExceptionObject::allocate(self.heap, *exc) {
                Ok(id) => id,
                Err(failure) => return failure,
            },
            RunError::Raised(raise) => raise.id,
            other => return other,
        };
        let replacement = match ExceptionObject::allocate(self.heap, SimpleException::new_msg(ExcType::RuntimeError, message)) {
            Ok(id) => id,
            Err(failure) => return failure,
        };
        if let Some(exc) = self.heap.exception_mut(replacement) {
            exc.cause = Some(original);
            exc.context = Some(original);
            exc.suppress_context = true;
        }
        RunError::raised(replacement)
    }

    /// Suspends the generator frame on top of the stack, saving its state.
    ///
    /// With `in_yield_from`, the frame resumes by re-executing the `YieldFrom`
    /// at `yield_ip`; otherwise it resumes after the yield and receives the
    /// sent value on its stack.
    pub(super) fn suspend(
        &mut self,
        value: Value,
        yield_ip: usize,
        in_yield_from: bool,
        entry_depth: usize,
    ) -> RunResult<Step> {
        let Some(id) = self.frame()?.generator else {
            return Err(RunError::internal("yield outside a generator frame"));
        };
        if self.frames.len() != entry_depth {
            return Err(RunError::internal("generator frame is not the entry frame"));
        }
        self.fire_return(value)?;
        let frame = self.frames.pop().ok_or_else(super::no_frame)?;
        self.thread.pop_frame();
        let stack = self.stack.split_off(frame.stack_base.min(self.stack.len()));
        let saved = SavedFrame {
            ip: if in_yield_from { yield_ip } else { frame.ip },
            yield_ip,
            stack,
            locals: frame.locals,
            cells: frame.cells,
            exc_state: self.exc_slots.last().copied().flatten(),
        };
        let generator = self.generator_ref_mut(id)?;
        generator.frame = Some(saved);
        generator.suspended_in_yield_from = in_yield_from;
        Ok(Step::Exit(FrameExit::Yield(value)))
    }

    /// `[delegate, value] -> [result]`, or suspends while the delegate yields.
    pub(super) fn yield_from(&mut self, at: usize, entry_depth: usize) -> RunResult<Step> {
        let value = self.pop()?;
        let delegate = self.peek(0)?;
        match self.delegate_send(delegate, value)? {
            GenOutcome::Yielded(yielded) => self.suspend(yielded, at, true, entry_depth),
            GenOutcome::Returned(result) => {
                self.pop()?;
                self.push(result);
                Ok(Step::Continue)
            }
        }
    }

    fn delegate_send(&mut self, delegate: Value, value: Value) -> RunResult<GenOutcome> {
        if let Value::Ref(id) = delegate {
            match self.heap.get(id) {
                HeapData::Generator(_) => return self.resume_generator(id, GenAction::Send(value)),
                HeapData::AsyncGenAwaitable(_) => return self.awaitable_resume(id, GenAction::Send(value)),
                HeapData::Host(host) => {
                    let host = Rc::clone(host);
                    let result = if value == Value::None {
                        host.iter_next()
                    } else {
                        let arg = self.to_object(value);
                        host.call_method("send", vec![arg]).map(Some)
                    };
                    return self.host_delegate_result(result);
                }
                _ => {}
            }
        }
        if value != Value::None {
            return Err(ExcType::attribute_error(delegate.type_name(self.heap), "send"));
        }
        Ok(match self.iter_next(delegate)? {
            Some(item) => GenOutcome::Yielded(item),
            None => GenOutcome::Returned(Value::None),
        })
    }

    /// Maps a host delegate step: a value is a yield, exhaustion or
    /// `StopIteration` is the delegation's result.
    fn host_delegate_result(
        &mut self,
        result: Result<Option<Object>, Exception>,
    ) -> RunResult<GenOutcome> {
        match result {
            Ok(Some(object)) => Ok(GenOutcome::Yielded(self.from_object(object)?)),
            Ok(None) => Ok(GenOutcome::Returned(Value::None)),
            Err(exc) if exc.exc_type() == ExcType::StopIteration => {
                let value = exc.value().cloned().unwrap_or(Object::None);
                Ok(GenOutcome::Returned(self.from_object(value)?))
            }
            Err(exc) => Err(self.host_error(exc)),
        }
    }

    fn delegate_has_throw(&self, delegate: Value) -> bool {
        match delegate {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Generator(_) | HeapData::AsyncGenAwaitable(_) => true,
                HeapData::Host(host) => host.has_method("throw"),
                _ => false,
            },
            _ => false,
        }
    }

    fn delegate_throw(&mut self, delegate: Value, exc: HeapId) -> RunResult<GenOutcome> {
        let Value::Ref(id) = delegate else {
            return Err(RunError::raised(exc));
        };
        match self.heap.get(id) {
            HeapData::Generator(_) => self.resume_generator(id, GenAction::Throw(exc)),
            HeapData::AsyncGenAwaitable(_) => self.awaitable_resume(id, GenAction::Throw(exc)),
            HeapData::Host(host) => {
                let host = Rc::clone(host);
                let arg = self.to_object(Value::Ref(exc));
                let result = host.call_method("throw", vec![arg]).map(Some);
                self.host_delegate_result(result)
            }
            _ => Err(RunError::raised(exc)),
        }
    }

    fn close_delegate(&mut self, delegate: Value) -> RunResult<()> {
        let Value::Ref(id) = delegate else {
            return Ok(());
        };
        match self.heap.get_mut(id) {
            HeapData::Generator(_) => self.close_generator(id).map(drop),
            HeapData::AsyncGenAwaitable(awaitable) => {
                awaitable.state = AwaitableState::Closed;
                Ok(())
            }
            HeapData::Host(host) if host.has_method("close") => {
                let host = Rc::clone(host);
                match host.call_method("close", Vec::new()) {
                    Ok(_) => Ok(()),
                    Err(exc) => Err(self.host_error(exc)),
                }
            }
            _ => Ok(()),
        }
    }

    /// `close()`: raises `GeneratorExit` inside the body and returns its return
    /// value, if it returns one.
    pub(crate) fn close_generator(&mut self, id: HeapId) -> RunResult<Value> {
        let generator = self.generator_ref(id)?;
        let noun = generator.kind.noun();
        match generator.state {
            GenState::Finished => return Ok(Value::None),
            GenState::Unstarted => {
                self.finish_generator(id)?;
                return Ok(Value::None);
            }
            GenState::Running | GenState::Suspended => {}
        }
        match self.resume_generator(id, GenAction::Close) {
            Ok(GenOutcome::Yielded(_)) => {
                self.finish_generator(id)?;
                Err(ExcType::ignored_generator_exit(noun))
            }
            Ok(GenOutcome::Returned(value)) => Ok(value),
            Err(err) if self.error_is(&err, ExcType::GeneratorExit) || self.error_is(&err, ExcType::StopIteration) => {
                Ok(Value::None)
            }
            Err(err) => Err(err),
        }
    }

    /// Steps an `asend`/`athrow`/`aclose` awaitable.
    pub(crate) fn awaitable_resume(&mut self, id: HeapId, action: GenAction) -> RunResult<GenOutcome> {
        let HeapData::AsyncGenAwaitable(awaitable) = self.heap.get(id) else {
            return Err(RunError::internal("expected an async generator awaitable"));
        };
        let AsyncGenAwaitable { agen, kind, state } = awaitable.clone();
        if state == AwaitableState::Closed {
            return Err(ExcType::runtime_error(match kind {
                AwaitableKind::Send(_) => "cannot reuse already awaited __anext__()/asend()",
                AwaitableKind::Throw(_) | AwaitableKind::Close => "cannot reuse already awaited aclose()/athrow()",
            }));
        }
        let gen_action = match (state, action) {
            (_, GenAction::Throw(exc)) => GenAction::Throw(exc),
            (_, GenAction::Close) => {
                self.set_awaitable_state(id, AwaitableState::Closed);
                return Ok(GenOutcome::Returned(Value::None));
            }
            (AwaitableState::Init, GenAction::Send(value)) => match kind {
                AwaitableKind::Send(initial) => GenAction::Send(if value == Value::None { initial } else { value }),
                AwaitableKind::Throw(exc) => GenAction::Throw(exc),
                AwaitableKind::Close => GenAction::Close,
            },
            (_, GenAction::Send(value)) => GenAction::Send(value),
        };
        self.set_awaitable_state(id, AwaitableState::Iter);
        let result = self.resume_generator(agen, gen_action);

        match kind {
            AwaitableKind::Send(_) | AwaitableKind::Throw(_) => match result {
                Ok(GenOutcome::Yielded(value)) => match self.unwrap_async_yield(value) {
                    Some(inner) => {
                        self.set_awaitable_state(id, AwaitableState::Closed);
                        Ok(GenOutcome::Returned(inner))
                    }
                    None => Ok(GenOutcome::Yielded(value)),
                },
                Ok(GenOutcome::Returned(_)) => {
                    self.set_awaitable_state(id, AwaitableState::Closed);
                    Err(SimpleException::new_none(ExcType::StopAsyncIteration).into())
                }
                Err(err) => {
                    self.set_awaitable_state(id, AwaitableState::Closed);
                    Err(err)
                }
            },
            AwaitableKind::Close => match result {
                Ok(GenOutcome::Yielded(value)) => {
                    if self.unwrap_async_yield(value).is_some() {
                        self.set_awaitable_state(id, AwaitableState::Closed);
                        self.finish_generator(agen)?;
                        Err(ExcType::ignored_generator_exit(GenKind::AsyncGenerator.noun()))
                    } else {
                        Ok(GenOutcome::Yielded(value))
                    }
                }
                Ok(GenOutcome::Returned(_)) => {
                    self.set_awaitable_state(id, AwaitableState::Closed);
                    Ok(GenOutcome::Returned(Value::None))
                }
                Err(err)
                    if self.error_is(&err, ExcType::GeneratorExit)
                        || self.error_is(&err, ExcType::StopAsyncIteration) =>
                {
                    self.set_awaitable_state(id, AwaitableState::Closed);
                    Ok(GenOutcome::Returned(Value::None))
                }
                Err(err) => {
                    self.set_awaitable_state(id, AwaitableState::Closed);
                    Err(err)
                }
            },
        }
    }

    fn set_awaitable_state(&mut self, id: HeapId, state: AwaitableState) {
        if let HeapData::AsyncGenAwaitable(awaitable) = self.heap.get_mut(id) {
            awaitable.state = state;
        }
    }

    fn unwrap_async_yield(&self, value: Value) -> Option<Value> {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::AsyncGenWrapped(inner) => Some(*inner),
                _ => None,
            },
            _ => None,
        }
    }

    /// Allocates the awaitable returned by `asend`, `athrow`, `aclose` or `__anext__`.
    pub(super) fn async_gen_awaitable(&mut self, agen: HeapId, kind: AwaitableKind) -> RunResult<Value> {
        let awaitable = AsyncGenAwaitable::new(agen, kind);
        Ok(Value::Ref(self.heap.allocate(HeapData::AsyncGenAwaitable(awaitable))?))
    }

    /// `GetAwaitable`: the iterator an `await` delegates to.
    pub(super) fn get_awaitable(&mut self, value: Value) -> RunResult<Value> {
        if let Value::Ref(id) = value {
            match self.heap.get(id) {
                HeapData::Generator(generator) if generator.kind == GenKind::Coroutine => {
                    if generator.state == GenState::Running || generator.suspended_in_yield_from {
                        return Err(ExcType::runtime_error("coroutine is being awaited already"));
                    }
                    return Ok(value);
                }
                HeapData::AsyncGenAwaitable(_) => return Ok(value),
                HeapData::Host(host) if host.has_method("__await__") => {
                    let host = Rc::clone(host);
                    let iterator = match host.call_method("__await__", Vec::new()) {
                        Ok(object) => self.from_object(object)?,
                        Err(exc) => return Err(self.host_error(exc)),
                    };
                    return self.get_iter(iterator);
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object can't be awaited",
            value.type_name(self.heap)
        )))
    }

    /// `GetAIter`.
    pub(super) fn get_aiter(&mut self, value: Value) -> RunResult<Value> {
        if let Value::Ref(id) = value {
            match self.heap.get(id) {
                HeapData::Generator(generator) if generator.kind == GenKind::AsyncGenerator => return Ok(value),
                HeapData::Host(host) if host.has_method("__aiter__") => {
                    let host = Rc::clone(host);
                    return match host.call_method("__aiter__", Vec::new()) {
                        Ok(object) => self.from_object(object),
                        Err(exc) => Err(self.host_error(exc)),
                    };
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'async for' requires an object with __aiter__ method, got {}",
            value.type_name(self.heap)
        )))
    }

    /// `GetANext`: the awaitable for the next item of an async iterator.
    pub(super) fn get_anext(&mut self, aiter: Value) -> RunResult<Value> {
        if let Value::Ref(id) = aiter {
            match self.heap.get(id) {
                HeapData::Generator(generator) if generator.kind == GenKind::AsyncGenerator => {
                    return self.async_gen_awaitable(id, AwaitableKind::Send(Value::None));
                }
                HeapData::Host(host) if host.has_method("__anext__") => {
                    let host = Rc::clone(host);
                    let awaitable = match host.call_method("__anext__", Vec::new()) {
                        Ok(object) => self.from_object(object)?,
                        Err(exc) => return Err(self.host_error(exc)),
                    };
                    return self.get_awaitable(awaitable);
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'async for' requires an iterator with __anext__ method, got {}",
            aiter.type_name(self.heap)
        )))
    }

    /// `[aiter, exc] -> []`: ends an `async for` on `StopAsyncIteration`, re-raises anything else.
    pub(super) fn end_async_for(&mut self) -> RunResult<()> {
        let exc = self.pop()?;
        self.pop()?;
        let id = self.exception_id(exc)?;
        let exhausted = self
            .heap
            .exception(id)
            .is_some_and(|e| e.exc_type.is_subclass_of(ExcType::StopAsyncIteration));
        if exhausted {
            Ok(())
        } else {
            Err(RunError::reraised(id))
        }
    }

    /// `GetYieldFromIter`: generators and coroutines delegate directly.
    pub(super) fn get_yield_from_iter(&mut self, value: Value) -> RunResult<Value> {
        if let Value::Ref(id) = value
            && let HeapData::Generator(generator) = self.heap.get(id)
            && generator.kind != GenKind::AsyncGenerator
        {
            return Ok(value);
        }
        self.get_iter(value)
    }

    /// Raises `StopIteration(value)` for a finished resumption seen through `send`/`next`.
    pub(super) fn stop_iteration(&mut self, value: Value) -> RunError {
        match ExceptionObject::stop_iteration(self.heap, value) {
            Ok(id) => RunError::raised(id),
            Err(err) => err,
        }
    }
}
