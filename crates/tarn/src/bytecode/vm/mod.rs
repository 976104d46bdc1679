//! Bytecode interpreter for compiled code units.
//!
//! The VM uses a stack-based execution model: one operand stack shared by all
//! frames (each frame owns the slice above its `stack_base`) and a call stack
//! of [`Frame`]s. Calls to user functions push a frame and keep running in the
//! same loop; generators are resumed by a nested loop that exits when the
//! generator's frame yields or returns.
//!
//! Instructions report failures as [`RunError`]. The loop hands every error to
//! `handle_exception`, which either finds a protected region in the current
//! frame or unwinds to the caller.

mod attr;
mod binary;
mod call;
mod collections;
mod compare;
mod exceptions;
mod generator;
mod managers;
mod trace;

use std::sync::Arc;

use ahash::AHashMap;
use tracing::trace;

pub(crate) use call::{ArgVec, CallOutcome};

use crate::{
    builtins::Builtins,
    bytecode::op::{CALL_VARARGS_KWARGS, MAKE_FUNCTION_CLOSURE, MAKE_FUNCTION_DEFAULTS, MAKE_FUNCTION_KWDEFAULTS, Opcode, Operands},
    code::{CodeUnit, Constant},
    exception::{ExcType, Exception, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    io::PrintWriter,
    object::{Object, exception_from_public, from_object, to_object},
    resource::ResourceTracker,
    runtime::RuntimeOptions,
    tracer::ThreadState,
    types::{DictKey, Function, Slice},
    value::Value,
};

/// Handles an error raised inside the run loop.
///
/// Returns from the loop when the error escapes the entry frame.
macro_rules! catch {
    ($self:expr, $entry_depth:expr, $err:expr) => {{
        if let Some(escaped) = $self.handle_exception($err, $entry_depth) {
            return Err(escaped);
        }
    }};
}

/// Per-runtime state attached to each code unit that has run.
///
/// Code units are shared and immutable, so materialized constants and the
/// despecialization flags of arithmetic and comparison sites live here,
/// keyed by unit identity.
#[derive(Debug, Default)]
pub(crate) struct CodeStates {
    states: Vec<CodeState>,
    by_unit: AHashMap<usize, usize>,
    despecialized: usize,
}

#[derive(Debug)]
struct CodeState {
    /// Keeps the unit alive so its address stays a valid key.
    _code: Arc<CodeUnit>,
    consts: Vec<Option<Value>>,
    /// Sites, by instruction offset, that take the generic path from now on.
    generic: Vec<bool>,
}

impl CodeStates {
    pub fn index_of(&mut self, code: &Arc<CodeUnit>) -> usize {
        let key = Arc::as_ptr(code).addr();
        if let Some(&idx) = self.by_unit.get(&key) {
            return idx;
        }
        let idx = self.states.len();
        self.states.push(CodeState {
            _code: Arc::clone(code),
            consts: vec![None; code.constants.len()],
            generic: vec![false; code.bytecode.len()],
        });
        self.by_unit.insert(key, idx);
        idx
    }

    fn cached_const(&self, idx: usize, const_idx: usize) -> Option<Value> {
        self.states.get(idx)?.consts.get(const_idx).copied().flatten()
    }

    fn cache_const(&mut self, idx: usize, const_idx: usize, value: Value) {
        if let Some(slot) = self.states.get_mut(idx).and_then(|s| s.consts.get_mut(const_idx)) {
            *slot = Some(value);
        }
    }

    fn is_generic(&self, idx: usize, site: usize) -> bool {
        self.states
            .get(idx)
            .and_then(|s| s.generic.get(site).copied())
            .unwrap_or(true)
    }

    /// Marks `site` as generic. Returns true the first time.
    fn despecialize(&mut self, idx: usize, site: usize) -> bool {
        let Some(flag) = self.states.get_mut(idx).and_then(|s| s.generic.get_mut(site)) else {
            return false;
        };
        if *flag {
            return false;
        }
        *flag = true;
        self.despecialized += 1;
        true
    }

    /// Number of sites that have fallen back to the generic path.
    pub fn despecialized_sites(&self) -> usize {
        self.despecialized
    }
}

/// One activation record.
#[derive(Debug)]
pub(crate) struct Frame {
    code: Arc<CodeUnit>,
    code_idx: usize,
    /// Offset of the next instruction.
    ip: usize,
    /// Offset of the instruction being executed; exception handlers and line
    /// numbers are looked up by it.
    op_ip: usize,
    stack_base: usize,
    locals: Vec<Value>,
    /// Cell variables followed by free variables.
    cells: Vec<HeapId>,
    /// Mapping consulted by the `*Name` instructions, for class bodies.
    namespace: Option<HeapId>,
    /// Set when the frame runs a generator body.
    generator: Option<HeapId>,
    /// Ambient exception slot value restored when the frame is popped.
    entry_exc: Option<HeapId>,
    /// The frame returns its namespace instead of its return value.
    returns_namespace: bool,
    serial: u64,
}

impl Frame {
    fn new(code: Arc<CodeUnit>, code_idx: usize, stack_base: usize, locals: Vec<Value>, cells: Vec<HeapId>) -> Self {
        Self {
            code,
            code_idx,
            ip: 0,
            op_ip: 0,
            stack_base,
            locals,
            cells,
            namespace: None,
            generator: None,
            entry_exc: None,
            returns_namespace: false,
            serial: 0,
        }
    }
}

/// How the entry frame of a run loop finished.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FrameExit {
    Return(Value),
    Yield(Value),
}

enum Step {
    Continue,
    Exit(FrameExit),
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy)]
struct Instr {
    op: Opcode,
    at: usize,
    arg: usize,
    arg2: usize,
    offset: isize,
}

/// The interpreter, borrowing a runtime's state for the duration of one entry call.
pub(crate) struct Vm<'a, T: ResourceTracker, P: PrintWriter> {
    heap: &'a mut Heap<T>,
    print: &'a mut P,
    globals: &'a mut AHashMap<String, Value>,
    codes: &'a mut CodeStates,
    thread: &'a mut ThreadState,
    options: RuntimeOptions,
    runtime_id: u64,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Ambient exception slots: one for the host caller, plus one per running generator.
    exc_slots: Vec<Option<HeapId>>,
}

impl<'a, T: ResourceTracker, P: PrintWriter> Vm<'a, T, P> {
    pub fn new(
        heap: &'a mut Heap<T>,
        print: &'a mut P,
        globals: &'a mut AHashMap<String, Value>,
        codes: &'a mut CodeStates,
        thread: &'a mut ThreadState,
        options: RuntimeOptions,
        runtime_id: u64,
    ) -> Self {
        Self {
            heap,
            print,
            globals,
            codes,
            thread,
            options,
            runtime_id,
            stack: Vec::new(),
            frames: Vec::new(),
            exc_slots: vec![None],
        }
    }

    /// Runs a module-level code unit to completion.
    pub fn run_code(&mut self, code: Arc<CodeUnit>) -> RunResult<Value> {
        if !code.freevars.is_empty() {
            return Err(RunError::internal(format!(
                "code unit '{}' has free variables and cannot run at module level",
                code.qualname
            )));
        }
        let mut locals = vec![Value::Undefined; code.varnames.len()];
        let cells = self.make_cells(&code, &mut locals, &[])?;
        let code_idx = self.codes.index_of(&code);
        let frame = Frame::new(code, code_idx, self.stack.len(), locals, cells);
        let depth = self.frames.len() + 1;
        self.push_frame(frame)?;
        match self.run_frames(depth, None)? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(_) => Err(RunError::internal("module code yielded")),
        }
    }

    /// Runs until the frame at `entry_depth - 1` returns or yields.
    ///
    /// A `pending` error is raised in the top frame before the first instruction.
    fn run_frames(&mut self, entry_depth: usize, pending: Option<RunError>) -> RunResult<FrameExit> {
        if let Some(err) = pending {
            catch!(self, entry_depth, err);
        }
        loop {
            if let Err(err) = self.heap.tracker_mut().check_time() {
                catch!(self, entry_depth, err.into());
                continue;
            }
            let instr = match self.decode() {
                Ok(instr) => instr,
                Err(err) => {
                    catch!(self, entry_depth, err);
                    continue;
                }
            };
            if self.thread.is_active()
                && let Err(err) = self.trace_line()
            {
                catch!(self, entry_depth, err);
                continue;
            }
            match self.execute(instr, entry_depth) {
                Ok(Step::Continue) => {}
                Ok(Step::Exit(exit)) => return Ok(exit),
                Err(err) => catch!(self, entry_depth, err),
            }
        }
    }

    fn decode(&mut self) -> RunResult<Instr> {
        let frame = self.frames.last_mut().ok_or_else(no_frame)?;
        let bytecode = &frame.code.bytecode;
        let at = frame.ip;
        let Some(&byte) = bytecode.get(at) else {
            return Err(RunError::internal(format!(
                "'{}' ran past the end of its bytecode",
                frame.code.qualname
            )));
        };
        let op = Opcode::try_from(byte).map_err(|b| RunError::internal(format!("invalid opcode {b} at offset {at}")))?;
        let next = at + op.size();
        let operand = bytecode
            .get(at + 1..next)
            .ok_or_else(|| RunError::internal(format!("truncated {op} at offset {at}")))?;
        let mut instr = Instr {
            op,
            at,
            arg: 0,
            arg2: 0,
            offset: 0,
        };
        match op.operands() {
            Operands::None => {}
            Operands::U8 => instr.arg = usize::from(operand[0]),
            Operands::I8 => instr.offset = isize::from(i8::from_le_bytes([operand[0]])),
            Operands::U16 => instr.arg = usize::from(u16::from_le_bytes([operand[0], operand[1]])),
            Operands::Jump => instr.offset = isize::from(i16::from_le_bytes([operand[0], operand[1]])),
            Operands::U8U8 => {
                instr.arg = usize::from(operand[0]);
                instr.arg2 = usize::from(operand[1]);
            }
            Operands::U16U8 => {
                instr.arg = usize::from(u16::from_le_bytes([operand[0], operand[1]]));
                instr.arg2 = usize::from(operand[2]);
            }
        }
        frame.op_ip = at;
        frame.ip = next;
        Ok(instr)
    }

    fn execute(&mut self, instr: Instr, entry_depth: usize) -> RunResult<Step> {
        match instr.op {
            Opcode::Nop => {}
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let value = self.peek(0)?;
                self.push(value);
            }
            Opcode::Rot2 => {
                let len = self.require(2)?;
                self.stack.swap(len - 1, len - 2);
            }
            Opcode::Rot3 => {
                let len = self.require(3)?;
                self.stack[len - 3..].rotate_right(1);
            }
            Opcode::Copy => {
                let depth = instr.arg.checked_sub(1).ok_or_else(|| RunError::internal("Copy 0"))?;
                let value = self.peek(depth)?;
                self.push(value);
            }
            Opcode::Swap => {
                let len = self.require(instr.arg.max(1))?;
                self.stack.swap(len - 1, len - instr.arg.max(1));
            }

            Opcode::LoadConst => {
                let value = self.load_const(instr.arg)?;
                self.push(value);
            }
            Opcode::LoadNone => self.push(Value::None),
            Opcode::LoadTrue => self.push(Value::Bool(true)),
            Opcode::LoadFalse => self.push(Value::Bool(false)),
            Opcode::LoadSmallInt => self.push(Value::Int(instr.offset as i64)),
            Opcode::LoadAssertionError => self.push(Value::Builtin(Builtins::ExcType(ExcType::AssertionError))),

            Opcode::LoadLocal | Opcode::LoadLocalW => {
                let value = self.load_local(instr.arg)?;
                self.push(value);
            }
            Opcode::StoreLocal | Opcode::StoreLocalW => {
                let value = self.pop()?;
                *self.local_slot(instr.arg)? = value;
            }
            Opcode::DeleteLocal => {
                self.load_local(instr.arg)?;
                *self.local_slot(instr.arg)? = Value::Undefined;
            }

            Opcode::LoadGlobal => {
                let code = self.code()?;
                let value = self.load_global(name_at(&code, instr.arg)?)?;
                self.push(value);
            }
            Opcode::StoreGlobal => {
                let code = self.code()?;
                let value = self.pop()?;
                self.globals.insert(name_at(&code, instr.arg)?.to_owned(), value);
            }
            Opcode::DeleteGlobal => {
                let code = self.code()?;
                let name = name_at(&code, instr.arg)?;
                if self.globals.remove(name).is_none() {
                    return Err(ExcType::name_error(name));
                }
            }
            Opcode::LoadName => {
                let code = self.code()?;
                let value = self.load_name(name_at(&code, instr.arg)?)?;
                self.push(value);
            }
            Opcode::StoreName => {
                let code = self.code()?;
                let value = self.pop()?;
                self.store_name(name_at(&code, instr.arg)?, value)?;
            }
            Opcode::DeleteName => {
                let code = self.code()?;
                self.delete_name(name_at(&code, instr.arg)?)?;
            }

            Opcode::LoadCell => {
                let value = self.load_cell(instr.arg)?;
                self.push(value);
            }
            Opcode::StoreCell => {
                let value = self.pop()?;
                let cell = self.cell_id(instr.arg)?;
                self.cell(cell)?.set(value);
            }
            Opcode::DeleteCell => {
                self.load_cell(instr.arg)?;
                let cell = self.cell_id(instr.arg)?;
                self.cell(cell)?.clear();
            }
            Opcode::LoadClassCell => {
                let value = self.load_class_cell(instr.arg)?;
                self.push(value);
            }
            Opcode::LoadClosure => {
                let cell = self.cell_id(instr.arg)?;
                self.push(Value::Ref(cell));
            }

            Opcode::LoadAttr => {
                let code = self.code()?;
                let object = self.pop()?;
                let value = self.load_attr(object, name_at(&code, instr.arg)?)?;
                self.push(value);
            }
            Opcode::StoreAttr => {
                let code = self.code()?;
                let object = self.pop()?;
                let value = self.pop()?;
                self.store_attr(object, name_at(&code, instr.arg)?, value)?;
            }
            Opcode::DeleteAttr => {
                let code = self.code()?;
                let object = self.pop()?;
                self.delete_attr(object, name_at(&code, instr.arg)?)?;
            }
            Opcode::BinarySubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                let value = self.get_item(container, key)?;
                self.push(value);
            }
            Opcode::StoreSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                self.set_item(container, key, value)?;
            }
            Opcode::DeleteSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                self.delete_item(container, key)?;
            }
            Opcode::BuildSlice => {
                let step = if instr.arg == 3 { self.pop()? } else { Value::None };
                let stop = self.pop()?;
                let start = self.pop()?;
                let slice = self.heap.allocate(HeapData::Slice(Slice { start, stop, step }))?;
                self.push(Value::Ref(slice));
            }

            Opcode::BinaryAdd
            | Opcode::BinarySub
            | Opcode::BinaryMul
            | Opcode::BinaryTrueDiv
            | Opcode::BinaryFloorDiv
            | Opcode::BinaryMod
            | Opcode::BinaryPow
            | Opcode::BinaryLShift
            | Opcode::BinaryRShift
            | Opcode::BinaryAnd
            | Opcode::BinaryOr
            | Opcode::BinaryXor => self.binary_instr(instr.op, instr.at)?,
            Opcode::UnaryNeg | Opcode::UnaryPos | Opcode::UnaryNot | Opcode::UnaryInvert => {
                let operand = self.pop()?;
                let value = self.unary(instr.op, operand)?;
                self.push(value);
            }

            Opcode::CompareEq
            | Opcode::CompareNe
            | Opcode::CompareLt
            | Opcode::CompareLe
            | Opcode::CompareGt
            | Opcode::CompareGe
            | Opcode::CompareIs
            | Opcode::CompareIsNot
            | Opcode::CompareIn
            | Opcode::CompareNotIn => self.compare_instr(instr.op, instr.at)?,

            Opcode::Jump => self.jump(instr.offset)?,
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let value = self.pop()?;
                if value.is_truthy(self.heap) == (instr.op == Opcode::JumpIfTrue) {
                    self.jump(instr.offset)?;
                }
            }
            Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => {
                let value = self.peek(0)?;
                if value.is_truthy(self.heap) == (instr.op == Opcode::JumpIfTrueOrPop) {
                    self.jump(instr.offset)?;
                } else {
                    self.pop()?;
                }
            }
            Opcode::JumpIfNone | Opcode::JumpIfNotNone => {
                let value = self.pop()?;
                if (value == Value::None) == (instr.op == Opcode::JumpIfNone) {
                    self.jump(instr.offset)?;
                }
            }

            Opcode::GetIter => {
                let iterable = self.pop()?;
                let iterator = self.get_iter(iterable)?;
                self.push(iterator);
            }
            Opcode::ForIter => {
                let iterator = self.peek(0)?;
                match self.iter_next(iterator)? {
                    Some(item) => self.push(item),
                    None => {
                        self.pop()?;
                        self.jump(instr.offset)?;
                    }
                }
            }
            Opcode::GetYieldFromIter => {
                let iterable = self.pop()?;
                let iterator = self.get_yield_from_iter(iterable)?;
                self.push(iterator);
            }
            Opcode::GetAwaitable => {
                let value = self.pop()?;
                let awaitable = self.get_awaitable(value)?;
                self.push(awaitable);
            }
            Opcode::GetAIter => {
                let value = self.pop()?;
                let aiter = self.get_aiter(value)?;
                self.push(aiter);
            }
            Opcode::GetANext => {
                let aiter = self.peek(0)?;
                let awaitable = self.get_anext(aiter)?;
                self.push(awaitable);
            }
            Opcode::EndAsyncFor => self.end_async_for()?,

            Opcode::BuildTuple => {
                let items = self.pop_n(instr.arg)?;
                let tuple = self.heap.alloc_tuple(items.into_vec())?;
                self.push(tuple);
            }
            Opcode::BuildList => {
                let items = self.pop_n(instr.arg)?;
                let list = self.heap.alloc_list(items.into_vec())?;
                self.push(list);
            }
            Opcode::BuildDict => self.build_dict(instr.arg)?,
            Opcode::ListAppend => self.list_append(instr.arg)?,
            Opcode::ListExtend => self.list_extend(instr.arg)?,
            Opcode::ListToTuple => self.list_to_tuple()?,
            Opcode::UnpackSequence => self.unpack_sequence(instr.arg)?,
            Opcode::UnpackEx => self.unpack_ex(instr.arg, instr.arg2)?,

            Opcode::MakeFunction => self.make_function(instr.arg)?,
            Opcode::CallFunction => {
                let args = self.pop_n(instr.arg)?;
                let callable = self.pop()?;
                let outcome = self.call_value(callable, args, Vec::new())?;
                self.finish_call(outcome);
            }
            Opcode::CallFunctionKw => {
                let names = self.pop()?;
                let args = self.pop_n(instr.arg)?;
                let callable = self.pop()?;
                let (args, kwargs) = self.split_keywords(names, args)?;
                let outcome = self.call_value(callable, args, kwargs)?;
                self.finish_call(outcome);
            }
            Opcode::CallMethod => {
                let code = self.code()?;
                let args = self.pop_n(instr.arg2)?;
                let receiver = self.pop()?;
                let method = self.load_attr(receiver, name_at(&code, instr.arg)?)?;
                let outcome = self.call_value(method, args, Vec::new())?;
                self.finish_call(outcome);
            }
            Opcode::CallFunctionVarargs => {
                let kwargs = self.pop_varargs_kwargs(instr.arg)?;
                let args = self.pop()?;
                let callable = self.pop()?;
                let outcome = self.call_varargs(callable, args, kwargs)?;
                self.finish_call(outcome);
            }
            Opcode::CallMethodVarargs => {
                let code = self.code()?;
                let kwargs = self.pop_varargs_kwargs(instr.arg2)?;
                let args = self.pop()?;
                let receiver = self.pop()?;
                let method = self.load_attr(receiver, name_at(&code, instr.arg)?)?;
                let outcome = self.call_varargs(method, args, kwargs)?;
                self.finish_call(outcome);
            }
            Opcode::ReturnValue => {
                let value = self.pop()?;
                return self.return_value(value, entry_depth);
            }

            Opcode::YieldValue => {
                let value = self.pop()?;
                return self.suspend(value, instr.at, false, entry_depth);
            }
            Opcode::YieldFrom => return self.yield_from(instr.at, entry_depth),
            Opcode::AsyncGenWrap => {
                let value = self.pop()?;
                let wrapped = self.heap.allocate(HeapData::AsyncGenWrapped(value))?;
                self.push(Value::Ref(wrapped));
            }

            Opcode::Raise => return Err(self.raise(instr.arg)?),
            Opcode::Reraise => {
                let exc = self.pop()?;
                return Err(RunError::reraised(self.exception_id(exc)?));
            }
            Opcode::PushExcInfo => self.push_exc_info()?,
            Opcode::PopExcept => self.pop_except()?,
            Opcode::ExceptCleanup => return Err(self.except_cleanup()?),
            Opcode::CheckExcMatch => self.check_exc_match()?,
            Opcode::CheckEgMatch => self.check_eg_match()?,
            Opcode::PrepReraiseStar => self.prep_reraise_star()?,

            Opcode::SetupWith => self.setup_with()?,
            Opcode::ExitWith => self.exit_with()?,
            Opcode::SetupAsyncWith => self.setup_async_with()?,
            Opcode::GetAExitCoro => self.get_aexit_coro()?,
            Opcode::ExitAsyncWith => self.exit_async_with()?,
        }
        Ok(Step::Continue)
    }

    // ------------------------------------------------------------------
    // operand stack
    // ------------------------------------------------------------------

    /// The `**` dict of a varargs call, present when `flags` says so.
    fn pop_varargs_kwargs(&mut self, flags: usize) -> RunResult<Option<Value>> {
        if flags & usize::from(CALL_VARARGS_KWARGS) == 0 {
            return Ok(None);
        }
        self.pop().map(Some)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn stack_base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.stack_base)
    }

    /// Checks that the current frame owns at least `n` stack entries and returns the stack length.
    fn require(&self, n: usize) -> RunResult<usize> {
        let len = self.stack.len();
        if len < self.stack_base() + n {
            return Err(RunError::internal("operand stack underflow"));
        }
        Ok(len)
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.require(1)?;
        self.stack.pop().ok_or_else(|| RunError::internal("operand stack underflow"))
    }

    /// The value `depth` entries below the top (0 is the top).
    fn peek(&self, depth: usize) -> RunResult<Value> {
        let len = self.require(depth + 1)?;
        Ok(self.stack[len - 1 - depth])
    }

    /// Pops `n` values, returned in push order.
    fn pop_n(&mut self, n: usize) -> RunResult<ArgVec> {
        let len = self.require(n)?;
        Ok(self.stack.drain(len - n..).collect())
    }

    // ------------------------------------------------------------------
    // frames
    // ------------------------------------------------------------------

    fn frame(&self) -> RunResult<&Frame> {
        self.frames.last().ok_or_else(no_frame)
    }

    fn frame_mut(&mut self) -> RunResult<&mut Frame> {
        self.frames.last_mut().ok_or_else(no_frame)
    }

    fn code(&self) -> RunResult<Arc<CodeUnit>> {
        self.frame().map(|f| Arc::clone(&f.code))
    }

    /// Pushes an activation and delivers its `call` event.
    ///
    /// If a hook fails on the `call` event the frame is popped again and the
    /// hook's exception is returned to the caller.
    fn push_frame(&mut self, mut frame: Frame) -> RunResult<()> {
        self.heap.tracker().check_recursion_depth(self.frames.len())?;
        frame.serial = self.thread.next_serial();
        frame.entry_exc = self.exc_slots.last().copied().flatten();
        self.frames.push(frame);
        self.thread.push_frame();
        if self.thread.is_active()
            && let Err(err) = self.fire_call()
        {
            self.discard_frame();
            return Err(err);
        }
        Ok(())
    }

    /// Pops the top frame without delivering events.
    fn discard_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.thread.pop_frame();
        self.stack.truncate(frame.stack_base);
        if let Some(slot) = self.exc_slots.last_mut() {
            *slot = frame.entry_exc;
        }
        Some(frame)
    }

    fn return_value(&mut self, value: Value, entry_depth: usize) -> RunResult<Step> {
        self.fire_return(value)?;
        let frame = self.discard_frame().ok_or_else(no_frame)?;
        let value = match frame.namespace {
            Some(namespace) if frame.returns_namespace => Value::Ref(namespace),
            _ => value,
        };
        if self.frames.len() < entry_depth {
            return Ok(Step::Exit(FrameExit::Return(value)));
        }
        self.push(value);
        Ok(Step::Continue)
    }

    fn finish_call(&mut self, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Push(value) => self.push(value),
            CallOutcome::FramePushed => {}
        }
    }

    fn jump(&mut self, offset: isize) -> RunResult<()> {
        let frame = self.frame_mut()?;
        frame.ip = frame
            .ip
            .checked_add_signed(offset)
            .ok_or_else(|| RunError::internal("jump target out of range"))?;
        if offset < 0
            && let Some(data) = self.thread.top_mut()
        {
            data.past_line = None;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // constants and variables
    // ------------------------------------------------------------------

    fn load_const(&mut self, index: usize) -> RunResult<Value> {
        let frame = self.frame()?;
        let code_idx = frame.code_idx;
        if let Some(value) = self.codes.cached_const(code_idx, index) {
            return Ok(value);
        }
        let code = Arc::clone(&frame.code);
        let constant = code
            .constants
            .get(index)
            .ok_or_else(|| RunError::internal(format!("constant {index} out of range")))?;
        let value = self.materialize_constant(constant)?;
        self.codes.cache_const(code_idx, index, value);
        Ok(value)
    }

    fn materialize_constant(&mut self, constant: &Constant) -> RunResult<Value> {
        let value = match constant {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::BigInt(b) => Value::from_bigint(b.clone(), self.heap)?,
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => self.heap.alloc_str(s.as_str())?,
            Constant::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|item| self.materialize_constant(item))
                    .collect::<RunResult<Vec<_>>>()?;
                self.heap.alloc_tuple(items)?
            }
            Constant::Code(unit) => Value::Ref(self.heap.allocate(HeapData::Code(Arc::clone(unit)))?),
            Constant::LazyCode(lazy) => {
                let unit = lazy.materialize().map_err(|err| RunError::internal(err.to_string()))?;
                Value::Ref(self.heap.allocate(HeapData::Code(unit))?)
            }
        };
        Ok(value)
    }

    fn local_slot(&mut self, slot: usize) -> RunResult<&mut Value> {
        self.frame_mut()?
            .locals
            .get_mut(slot)
            .ok_or_else(|| RunError::internal(format!("local slot {slot} out of range")))
    }

    fn load_local(&self, slot: usize) -> RunResult<Value> {
        let frame = self.frame()?;
        match frame.locals.get(slot) {
            Some(Value::Undefined) => Err(ExcType::unbound_local(
                frame.code.varnames.get(slot).map_or("?", String::as_str),
            )),
            Some(value) => Ok(*value),
            None => Err(RunError::internal(format!("local slot {slot} out of range"))),
        }
    }

    fn cell_id(&self, index: usize) -> RunResult<HeapId> {
        self.frame()?
            .cells
            .get(index)
            .copied()
            .ok_or_else(|| RunError::internal(format!("cell {index} out of range")))
    }

    fn cell(&mut self, id: HeapId) -> RunResult<&mut crate::types::Cell> {
        self.heap
            .cell_mut(id)
            .ok_or_else(|| RunError::internal("cell slot does not hold a cell"))
    }

    fn load_cell(&mut self, index: usize) -> RunResult<Value> {
        let id = self.cell_id(index)?;
        if let Some(value) = self.cell(id)?.get() {
            return Ok(value);
        }
        let code = &self.frame()?.code;
        let name = code.cell_name(index).unwrap_or("?");
        if index < code.cellvars.len() {
            Err(ExcType::unbound_local(name))
        } else {
            Err(ExcType::unbound_free_var(name))
        }
    }

    fn load_class_cell(&mut self, index: usize) -> RunResult<Value> {
        let frame = self.frame()?;
        if let Some(namespace) = frame.namespace
            && let Some(name) = frame.code.cell_name(index)
            && let HeapData::Dict(dict) = self.heap.get(namespace)
            && let Some(value) = dict.get_str(name)
        {
            return Ok(value);
        }
        self.load_cell(index)
    }

    fn load_global(&self, name: &str) -> RunResult<Value> {
        if let Some(value) = self.globals.get(name) {
            return Ok(*value);
        }
        Builtins::from_name(name)
            .map(Value::Builtin)
            .ok_or_else(|| ExcType::name_error(name))
    }

    fn load_name(&self, name: &str) -> RunResult<Value> {
        if let Some(namespace) = self.frame()?.namespace
            && let HeapData::Dict(dict) = self.heap.get(namespace)
            && let Some(value) = dict.get_str(name)
        {
            return Ok(value);
        }
        self.load_global(name)
    }

    fn store_name(&mut self, name: &str, value: Value) -> RunResult<()> {
        match self.frame()?.namespace {
            Some(namespace) => {
                let key = self.heap.alloc_str(name)?;
                match self.heap.get_mut(namespace) {
                    HeapData::Dict(dict) => dict.insert(DictKey::Str(name.to_owned()), key, value),
                    _ => return Err(RunError::internal("frame namespace is not a dict")),
                }
            }
            None => {
                self.globals.insert(name.to_owned(), value);
            }
        }
        Ok(())
    }

    fn delete_name(&mut self, name: &str) -> RunResult<()> {
        let removed = match self.frame()?.namespace {
            Some(namespace) => match self.heap.get_mut(namespace) {
                HeapData::Dict(dict) => dict.remove(&DictKey::Str(name.to_owned())).is_some(),
                _ => return Err(RunError::internal("frame namespace is not a dict")),
            },
            None => self.globals.remove(name).is_some(),
        };
        if removed { Ok(()) } else { Err(ExcType::name_error(name)) }
    }

    fn make_function(&mut self, flags: usize) -> RunResult<()> {
        let flags = u8::try_from(flags).map_err(|_| RunError::internal("MakeFunction flags out of range"))?;
        let code = match self.pop()? {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Code(code) => Some(Arc::clone(code)),
                _ => None,
            },
            _ => None,
        }
        .ok_or_else(|| RunError::internal("MakeFunction expects a code object"))?;
        let mut function = Function::new(code);
        if flags & MAKE_FUNCTION_CLOSURE != 0 {
            let closure = self.pop()?;
            function.closure = self
                .sequence_items(closure)?
                .into_iter()
                .map(|cell| match cell {
                    Value::Ref(id) if matches!(self.heap.get(id), HeapData::Cell(_)) => Ok(id),
                    _ => Err(RunError::internal("closure tuple must hold cells")),
                })
                .collect::<RunResult<_>>()?;
        }
        if flags & MAKE_FUNCTION_KWDEFAULTS != 0 {
            let kwdefaults = self.pop()?;
            let HeapData::Dict(dict) = self.heap.get(kwdefaults.ref_id().ok_or_else(|| RunError::internal("kwdefaults must be a dict"))?)
            else {
                return Err(RunError::internal("kwdefaults must be a dict"));
            };
            function.kwdefaults = dict
                .items()
                .map(|(k, v)| {
                    self.heap
                        .as_str(k)
                        .map(|name| (name.to_owned(), v))
                        .ok_or_else(|| RunError::internal("kwdefaults keys must be strings"))
                })
                .collect::<RunResult<_>>()?;
        }
        if flags & MAKE_FUNCTION_DEFAULTS != 0 {
            let defaults = self.pop()?;
            function.defaults = self.sequence_items(defaults)?;
        }
        if function.closure.len() != function.code.freevars.len() {
            return Err(RunError::internal(format!(
                "'{}' needs {} closure cells, got {}",
                function.qualname,
                function.code.freevars.len(),
                function.closure.len()
            )));
        }
        let id = self.heap.allocate(HeapData::Function(function))?;
        self.push(Value::Ref(id));
        Ok(())
    }

    /// Items of a tuple or list value.
    fn sequence_items(&self, value: Value) -> RunResult<Vec<Value>> {
        match value {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Tuple(items) | HeapData::List(items) => Ok(items.clone()),
                _ => Err(RunError::internal("expected a tuple")),
            },
            _ => Err(RunError::internal("expected a tuple")),
        }
    }

    // ------------------------------------------------------------------
    // host boundary
    // ------------------------------------------------------------------

    pub fn to_object(&self, value: Value) -> Object {
        to_object(value, self.heap, self.runtime_id)
    }

    pub fn from_object(&mut self, object: Object) -> RunResult<Value> {
        from_object(object, self.heap, self.runtime_id)
    }

    /// Turns an exception raised by host code into a raised heap exception.
    fn host_error(&mut self, exc: Exception) -> RunError {
        match exception_from_public(exc, self.heap, self.runtime_id) {
            Ok(id) => RunError::raised(id),
            Err(err) => err,
        }
    }

    fn note_despecialized(&mut self, site: usize, what: &'static str) {
        let Some(frame) = self.frames.last() else { return };
        if self.codes.despecialize(frame.code_idx, site) {
            trace!(code = %frame.code.qualname, site, what, "site despecialized");
        }
    }

    /// True when the site at `site` in the current frame may try fast paths.
    fn site_is_specialized(&self, site: usize) -> bool {
        self.options.specialize
            && self
                .frame()
                .is_ok_and(|frame| !self.codes.is_generic(frame.code_idx, site))
    }
}

fn no_frame() -> RunError {
    RunError::internal("no active frame")
}

fn name_at(code: &CodeUnit, index: usize) -> RunResult<&str> {
    code.names
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| RunError::internal(format!("name {index} out of range")))
}
