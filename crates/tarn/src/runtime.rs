//! Public interface for running code units.

use std::{
    any::Any,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::AHashMap;
use crate::{
    bytecode::vm::{ArgVec, CodeStates, Vm},
    code::{CodeUnit, LazyCode},
    exception::{ExcType, Exception, RunResult},
    heap::{Heap, HeapData, HeapId},
    io::{PrintWriter, StdPrint},
    object::{Object, exception_from_public, from_object, run_error_to_public, to_object},
    resource::{NoLimitTracker, ResourceTracker},
    tracer::{HookSlot, ThreadState, TraceHook},
    types::{GenAction, GenOutcome},
    value::Value,
};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Try the guarded fast paths for arithmetic and comparisons. When false,
    /// every site takes the generic path. Results are identical either way.
    pub specialize: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self { specialize: true }
    }
}

/// Result of resuming a generator from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumed {
    /// The generator suspended, producing this value.
    Yielded(Object),
    /// The generator finished with this return value.
    Returned(Object),
}

/// One logical thread of execution: a heap, module globals, hooks and the
/// per-site specialization state of every code unit it has run.
///
/// Code units are shared (`Arc<CodeUnit>` is `Send + Sync`); a runtime is not.
/// Values created by one runtime come back to the host as [`Object`]s, and
/// objects without an owned form as handles that only this runtime accepts.
///
/// # Example
/// ```
/// use tarn::{CodeBuilder, Object, Opcode, Runtime};
///
/// let mut builder = CodeBuilder::new("<module>");
/// builder.emit_load_int(40);
/// builder.emit_load_int(2);
/// builder.emit(Opcode::BinaryAdd);
/// builder.emit(Opcode::ReturnValue);
/// let code = builder.build_arc();
///
/// let mut runtime = Runtime::new();
/// assert_eq!(runtime.run(&code).unwrap(), Object::Int(42));
/// ```
pub struct Runtime<T: ResourceTracker = NoLimitTracker, P: PrintWriter = StdPrint> {
    id: u64,
    heap: Heap<T>,
    print: P,
    globals: AHashMap<String, Value>,
    codes: CodeStates,
    thread: ThreadState,
    options: RuntimeOptions,
}

impl Runtime {
    /// A runtime without resource limits that prints to stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(NoLimitTracker, StdPrint, RuntimeOptions::default())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ResourceTracker, P: PrintWriter> Runtime<T, P> {
    pub fn with_parts(tracker: T, print: P, options: RuntimeOptions) -> Self {
        Self {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            heap: Heap::new(tracker),
            print,
            globals: AHashMap::new(),
            codes: CodeStates::default(),
            thread: ThreadState::default(),
            options,
        }
    }

    fn vm(&mut self) -> Vm<'_, T, P> {
        Vm::new(
            &mut self.heap,
            &mut self.print,
            &mut self.globals,
            &mut self.codes,
            &mut self.thread,
            self.options,
            self.id,
        )
    }

    /// Converts the outcome of a VM operation into the public form.
    fn finish(&self, result: RunResult<Value>) -> Result<Object, Exception> {
        match result {
            Ok(value) => Ok(to_object(value, &self.heap, self.id)),
            Err(err) => Err(run_error_to_public(err, &self.heap, self.id)),
        }
    }

    /// Runs a module-level code unit and returns its return value.
    pub fn run(&mut self, code: &Arc<CodeUnit>) -> Result<Object, Exception> {
        code.validate()
            .map_err(|err| Exception::runtime_error(format!("invalid code unit: {err}")))?;
        let result = self.vm().run_code(Arc::clone(code));
        self.finish(result)
    }

    /// Materializes a serialized code unit and runs it.
    pub fn run_lazy(&mut self, code: &LazyCode) -> Result<Object, Exception> {
        let unit = code
            .materialize()
            .map_err(|err| Exception::runtime_error(format!("invalid code unit: {err}")))?;
        self.run(&unit)
    }

    /// Calls a callable with positional arguments.
    pub fn call(&mut self, callable: &Object, args: Vec<Object>) -> Result<Object, Exception> {
        self.call_kw(callable, args, Vec::new())
    }

    /// Calls a callable with positional and keyword arguments.
    pub fn call_kw(
        &mut self,
        callable: &Object,
        args: Vec<Object>,
        kwargs: Vec<(String, Object)>,
    ) -> Result<Object, Exception> {
        let result = self.import_call(callable, args, kwargs).and_then(|(callable, args, kwargs)| {
            self.vm().call_sync(callable, args, kwargs)
        });
        self.finish(result)
    }

    /// Calls `receiver.name(*args)`.
    pub fn call_method(&mut self, receiver: &Object, name: &str, args: Vec<Object>) -> Result<Object, Exception> {
        let result = self
            .import_call(receiver, args, Vec::new())
            .and_then(|(receiver, args, _)| self.vm().call_method_sync(receiver, name, args));
        self.finish(result)
    }

    fn import_call(
        &mut self,
        target: &Object,
        args: Vec<Object>,
        kwargs: Vec<(String, Object)>,
    ) -> RunResult<(Value, ArgVec, Vec<(String, Value)>)> {
        let target = self.import(target.clone())?;
        let args = args
            .into_iter()
            .map(|arg| self.import(arg))
            .collect::<RunResult<ArgVec>>()?;
        let kwargs = kwargs
            .into_iter()
            .map(|(name, value)| Ok((name, self.import(value)?)))
            .collect::<RunResult<Vec<_>>>()?;
        Ok((target, args, kwargs))
    }

    fn import(&mut self, object: Object) -> RunResult<Value> {
        from_object(object, &mut self.heap, self.id)
    }

    /// `generator.send(value)`.
    pub fn send(&mut self, generator: &Object, value: Object) -> Result<Resumed, Exception> {
        let result = self.import(value).map(GenAction::Send);
        self.resume(generator, result)
    }

    /// `next(generator)`.
    pub fn next(&mut self, generator: &Object) -> Result<Resumed, Exception> {
        self.resume(generator, Ok(GenAction::Send(Value::None)))
    }

    /// `generator.throw(exc)`.
    pub fn throw(&mut self, generator: &Object, exc: Exception) -> Result<Resumed, Exception> {
        let action = exception_from_public(exc, &mut self.heap, self.id).map(GenAction::Throw);
        self.resume(generator, action)
    }

    /// `generator.close()`: returns the generator's return value, if it returned one.
    pub fn close(&mut self, generator: &Object) -> Result<Object, Exception> {
        let result = self
            .resumable(generator)
            .and_then(|(id, awaitable)| {
                let mut vm = self.vm();
                if awaitable {
                    vm.awaitable_resume(id, GenAction::Close).map(|_| Value::None)
                } else {
                    vm.close_generator(id)
                }
            });
        self.finish(result)
    }

    fn resume(&mut self, target: &Object, action: RunResult<GenAction>) -> Result<Resumed, Exception> {
        let outcome = action.and_then(|action| {
            let (id, awaitable) = self.resumable(target)?;
            let mut vm = self.vm();
            if awaitable {
                vm.awaitable_resume(id, action)
            } else {
                vm.resume_generator(id, action)
            }
        });
        match outcome {
            Ok(GenOutcome::Yielded(value)) => Ok(Resumed::Yielded(to_object(value, &self.heap, self.id))),
            Ok(GenOutcome::Returned(value)) => Ok(Resumed::Returned(to_object(value, &self.heap, self.id))),
            Err(err) => Err(run_error_to_public(err, &self.heap, self.id)),
        }
    }

    /// The heap id of a generator, coroutine or async generator awaitable,
    /// and whether it is an awaitable.
    fn resumable(&mut self, target: &Object) -> RunResult<(HeapId, bool)> {
        let value = self.import(target.clone())?;
        if let Value::Ref(id) = value {
            match self.heap.get(id) {
                HeapData::Generator(_) => return Ok((id, false)),
                HeapData::AsyncGenAwaitable(_) => return Ok((id, true)),
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "'{}' object cannot be resumed",
            value.type_name(&self.heap)
        )))
    }

    /// Binds a module-level name.
    pub fn set_global(&mut self, name: impl Into<String>, value: Object) -> Result<(), Exception> {
        match self.import(value) {
            Ok(value) => {
                self.globals.insert(name.into(), value);
                Ok(())
            }
            Err(err) => Err(run_error_to_public(err, &self.heap, self.id)),
        }
    }

    /// Reads a module-level name.
    #[must_use]
    pub fn global(&self, name: &str) -> Option<Object> {
        self.globals
            .get(name)
            .map(|value| to_object(*value, &self.heap, self.id))
    }

    /// Installs a trace hook, returning the previous one.
    pub fn set_trace(&mut self, hook: Option<Box<dyn TraceHook>>) -> Option<Box<dyn TraceHook>> {
        self.thread.replace(HookSlot::Trace, hook)
    }

    /// Installs a profile hook, returning the previous one.
    pub fn set_profile(&mut self, hook: Option<Box<dyn TraceHook>>) -> Option<Box<dyn TraceHook>> {
        self.thread.replace(HookSlot::Profile, hook)
    }

    /// The installed trace hook, if it is an `H`.
    #[must_use]
    pub fn trace_hook<H: TraceHook>(&self) -> Option<&H> {
        let hook: &dyn Any = self.thread.hook(HookSlot::Trace)?;
        hook.downcast_ref()
    }

    pub fn trace_hook_mut<H: TraceHook>(&mut self) -> Option<&mut H> {
        let hook: &mut dyn Any = self.thread.hook_mut(HookSlot::Trace)?;
        hook.downcast_mut()
    }

    /// The installed profile hook, if it is an `H`.
    #[must_use]
    pub fn profile_hook<H: TraceHook>(&self) -> Option<&H> {
        let hook: &dyn Any = self.thread.hook(HookSlot::Profile)?;
        hook.downcast_ref()
    }

    pub fn print_writer(&self) -> &P {
        &self.print
    }

    pub fn print_writer_mut(&mut self) -> &mut P {
        &mut self.print
    }

    pub fn tracker(&self) -> &T {
        self.heap.tracker()
    }

    pub fn options(&self) -> RuntimeOptions {
        self.options
    }

    /// Number of arithmetic and comparison sites that have fallen back to the generic path.
    pub fn despecialized_sites(&self) -> usize {
        self.codes.despecialized_sites()
    }
}

