#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "operand widths are checked by the code unit validator")]
// first so every module can name heap ids
mod heap;

mod builtins;
mod bytecode;
mod code;
mod exception;
mod io;
mod object;
mod protocol;
mod resource;
mod runtime;
pub mod tracer;
mod types;
mod value;

pub use crate::{
    bytecode::{
        CALL_VARARGS_KWARGS, CodeBuilder, JumpLabel, MAKE_FUNCTION_CLOSURE, MAKE_FUNCTION_DEFAULTS,
        MAKE_FUNCTION_KWDEFAULTS, Opcode, Operands,
    },
    code::{CodeError, CodeFlags, CodeUnit, Constant, ExceptionEntry, LazyCode, LineEntry},
    exception::{ExcType, Exception, StackFrame},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    object::{Handle, HostRef, Object},
    protocol::{BinaryOp, CompareOp, HostObject},
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker,
    },
    runtime::{Resumed, Runtime, RuntimeOptions},
    tracer::{
        CoverageHook, FrameView, LocalTrace, LogHook, ProfilingHook, ProfilingReport, RecordedEvent, RecordingHook,
        TraceEvent, TraceHook,
    },
};
