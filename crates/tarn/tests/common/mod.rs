//! Assembly helpers shared by the integration tests.
//!
//! There is no front end in this crate, so tests build code units by hand.
//! The helpers emit the same instruction shapes a compiler would.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Arc;

use tarn::{
    CodeBuilder, CodeFlags, CodeUnit, CollectStringPrint, Constant, ExceptionEntry, NoLimitTracker, Opcode, Runtime,
    RuntimeOptions,
};

pub type TestRuntime = Runtime<NoLimitTracker, CollectStringPrint>;

/// A runtime that captures `print` output.
pub fn runtime() -> TestRuntime {
    Runtime::with_parts(NoLimitTracker, CollectStringPrint::new(), RuntimeOptions::default())
}

/// A module unit named `<module>`, with line numbers starting at 1.
pub fn module(body: impl FnOnce(&mut CodeBuilder)) -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("<module>");
    b.set_line(1);
    body(&mut b);
    b.build_arc()
}

/// A function unit with `params` positional parameters declared first.
pub fn function(name: &str, params: &[&str], body: impl FnOnce(&mut CodeBuilder)) -> Arc<CodeUnit> {
    function_with_flags(name, params, CodeFlags::empty(), body)
}

pub fn function_with_flags(
    name: &str,
    params: &[&str],
    flags: CodeFlags,
    body: impl FnOnce(&mut CodeBuilder),
) -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new(name);
    let count = u16::try_from(params.len()).unwrap();
    b.set_arg_counts(count, 0, 0);
    b.insert_flags(flags);
    for param in params {
        b.add_varname(param);
    }
    b.set_line(10);
    body(&mut b);
    b.build_arc()
}

/// `name = <function built from unit>` at module level.
pub fn define(b: &mut CodeBuilder, name: &str, unit: Arc<CodeUnit>) {
    b.emit_load_const(Constant::Code(unit));
    b.emit_u8(Opcode::MakeFunction, 0);
    b.emit_store_global(name);
}

/// `name(args...)`, leaving the result on the stack.
pub fn call_global(b: &mut CodeBuilder, name: &str, args: &[i64]) {
    b.emit_load_global(name);
    for arg in args {
        b.emit_load_int(*arg);
    }
    b.emit_u8(Opcode::CallFunction, u8::try_from(args.len()).unwrap());
}

/// `return value` for a string constant.
pub fn return_str(b: &mut CodeBuilder, value: &str) {
    b.emit_load_const(Constant::Str(value.to_owned()));
    b.emit(Opcode::ReturnValue);
}

/// `raise name(message)`.
pub fn raise_new(b: &mut CodeBuilder, name: &str, message: &str) {
    b.emit_load_global(name);
    b.emit_load_const(Constant::Str(message.to_owned()));
    b.emit_u8(Opcode::CallFunction, 1);
    b.emit_u8(Opcode::Raise, 1);
}

/// `try: body except catch: handler`.
///
/// `handler` starts with `[previous, exc]` on the stack and must consume the
/// exception; the helper emits the `PopExcept` epilogue. Unmatched
/// exceptions are re-raised through `ExceptCleanup`.
pub fn try_except(
    b: &mut CodeBuilder,
    catch: &str,
    body: impl FnOnce(&mut CodeBuilder),
    handler: impl FnOnce(&mut CodeBuilder),
) {
    let depth = b.stack_depth();
    let start = b.offset_u32();
    body(b);
    let end = b.offset_u32();
    let done = b.emit_jump(Opcode::Jump);

    let handler_start = b.offset_u32();
    b.set_stack_depth(depth + 1);
    b.emit(Opcode::PushExcInfo);
    b.emit_load_global(catch);
    b.emit(Opcode::CheckExcMatch);
    let no_match = b.emit_jump(Opcode::JumpIfFalse);
    handler(b);
    b.emit(Opcode::PopExcept);
    let handled = b.emit_jump(Opcode::Jump);

    b.patch_jump(no_match);
    b.set_stack_depth(depth + 2);
    b.emit(Opcode::ExceptCleanup);

    b.patch_jump(done);
    b.patch_jump(handled);
    b.set_stack_depth(depth);
    b.add_exception_entry(ExceptionEntry::new(start, end, handler_start, depth));
}
