//! Coroutines and async generators driven by a host event loop.

mod common;

use std::sync::Arc;

use common::{call_global, define, function_with_flags, module, return_str, runtime};
use pretty_assertions::assert_eq;
use tarn::{
    CodeBuilder, CodeFlags, CodeUnit, Constant, ExcType, Exception, ExceptionEntry, HostObject, Object, Opcode, Resumed,
};

fn coroutine(name: &str, body: impl FnOnce(&mut CodeBuilder)) -> Arc<CodeUnit> {
    function_with_flags(name, &[], CodeFlags::IS_COROUTINE, body)
}

/// `async def numbers(): yield 1; yield 2`
fn numbers() -> Arc<CodeUnit> {
    function_with_flags("numbers", &[], CodeFlags::IS_ASYNC_GENERATOR, |b| {
        for n in [1, 2] {
            b.emit_load_int(n);
            b.emit(Opcode::AsyncGenWrap);
            b.emit(Opcode::YieldValue);
            b.emit(Opcode::Pop);
        }
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
    })
}

/// `await expr` inside a coroutine body.
fn emit_await(b: &mut CodeBuilder) {
    b.emit(Opcode::GetAwaitable);
    b.emit(Opcode::LoadNone);
    b.emit(Opcode::YieldFrom);
}

/// A leaf awaitable that suspends once with `"tick"` and returns whatever the
/// event loop sends back, awaited by `main`, which adds one.
fn sleeper_program() -> Arc<CodeUnit> {
    let sleep = coroutine("sleep", |b| {
        b.emit_load_const(Constant::Str("tick".to_owned()));
        b.emit(Opcode::YieldValue);
        b.emit(Opcode::ReturnValue);
    });
    let main = coroutine("main", |b| {
        call_global(b, "sleep", &[]);
        emit_await(b);
        b.emit_load_int(1);
        b.emit(Opcode::BinaryAdd);
        b.emit(Opcode::ReturnValue);
    });
    module(|b| {
        define(b, "sleep", sleep);
        define(b, "main", main);
        call_global(b, "main", &[]);
        b.emit(Opcode::ReturnValue);
    })
}

#[test]
fn awaited_suspension_reaches_the_event_loop() {
    let mut rt = runtime();
    let task = rt.run(&sleeper_program()).unwrap();
    assert_eq!(
        rt.send(&task, Object::None).unwrap(),
        Resumed::Yielded(Object::String("tick".to_owned()))
    );
    assert_eq!(rt.send(&task, Object::Int(41)).unwrap(), Resumed::Returned(Object::Int(42)));
}

#[test]
fn finished_coroutines_cannot_be_resumed() {
    let mut rt = runtime();
    let task = rt.run(&sleeper_program()).unwrap();
    rt.send(&task, Object::None).unwrap();
    rt.send(&task, Object::Int(0)).unwrap();
    let err = rt.send(&task, Object::None).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::RuntimeError);
    assert_eq!(err.message(), Some("cannot reuse already awaited coroutine"));
}

#[test]
fn awaiting_a_plain_value_is_a_type_error() {
    let main = coroutine("main", |b| {
        b.emit_load_int(3);
        emit_await(b);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = runtime();
    let code = module(|b| {
        define(b, "main", main);
        call_global(b, "main", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let task = rt.run(&code).unwrap();
    let err = rt.send(&task, Object::None).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(err.message(), Some("'int' object can't be awaited"));
}

/// Throwing into a suspended coroutine reaches the innermost awaited frame.
#[test]
fn throw_propagates_through_await() {
    let mut rt = runtime();
    let task = rt.run(&sleeper_program()).unwrap();
    rt.send(&task, Object::None).unwrap();
    let err = rt
        .throw(&task, Exception::new(ExcType::TimeoutError, None))
        .unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TimeoutError);
    let names: Vec<&str> = err.traceback().iter().map(|frame| frame.name.as_str()).collect();
    assert_eq!(names, vec!["main", "sleep"]);
}

/// Each `__anext__()` awaitable completes with the next item.
#[test]
fn async_generator_items_from_the_host() {
    let mut rt = runtime();
    let code = module(|b| {
        define(b, "numbers", numbers());
        call_global(b, "numbers", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let agen = rt.run(&code).unwrap();

    let first = rt.call_method(&agen, "__anext__", Vec::new()).unwrap();
    assert_eq!(rt.send(&first, Object::None).unwrap(), Resumed::Returned(Object::Int(1)));
    let err = rt.send(&first, Object::None).unwrap_err();
    assert_eq!(err.message(), Some("cannot reuse already awaited __anext__()/asend()"));

    let second = rt.call_method(&agen, "__anext__", Vec::new()).unwrap();
    assert_eq!(rt.next(&second).unwrap(), Resumed::Returned(Object::Int(2)));

    let third = rt.call_method(&agen, "__anext__", Vec::new()).unwrap();
    let err = rt.next(&third).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::StopAsyncIteration);
}

#[test]
fn aclose_finishes_an_async_generator() {
    let mut rt = runtime();
    let code = module(|b| {
        define(b, "numbers", numbers());
        call_global(b, "numbers", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let agen = rt.run(&code).unwrap();
    let first = rt.call_method(&agen, "__anext__", Vec::new()).unwrap();
    rt.next(&first).unwrap();

    let closing = rt.call_method(&agen, "aclose", Vec::new()).unwrap();
    assert_eq!(rt.next(&closing).unwrap(), Resumed::Returned(Object::None));
    let after = rt.call_method(&agen, "__anext__", Vec::new()).unwrap();
    assert_eq!(rt.next(&after).unwrap_err().exc_type(), ExcType::StopAsyncIteration);
}

/// ```text
/// async def main():
///     total = 0
///     async for n in numbers():
///         total = total + n
///     return total
/// ```
#[test]
fn async_for_drains_an_async_generator() {
    let main = coroutine("main", |b| {
        b.emit_load_int(0);
        b.emit_store_global("total");
        call_global(b, "numbers", &[]);
        b.emit(Opcode::GetAIter);
        let top = b.current_offset();
        let start = b.offset_u32();
        b.emit(Opcode::GetANext);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::YieldFrom);
        let end = b.offset_u32();
        b.emit_load_global("total");
        b.emit(Opcode::BinaryAdd);
        b.emit_store_global("total");
        b.emit_jump_to(Opcode::Jump, top);

        let handler = b.offset_u32();
        b.set_stack_depth(2);
        b.emit(Opcode::EndAsyncFor);
        b.emit_load_global("total");
        b.emit(Opcode::ReturnValue);
        b.add_exception_entry(ExceptionEntry::new(start, end, handler, 1));
    });
    let code = module(|b| {
        define(b, "numbers", numbers());
        define(b, "main", main);
        call_global(b, "main", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = runtime();
    let task = rt.run(&code).unwrap();
    assert_eq!(rt.next(&task).unwrap(), Resumed::Returned(Object::Int(3)));
}

/// Host objects are not async iterable unless they say so.
#[test]
fn async_for_over_a_list_is_rejected() {
    let main = coroutine("main", |b| {
        b.emit_u16(Opcode::BuildList, 0);
        b.emit(Opcode::GetAIter);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "main", main);
        call_global(b, "main", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = runtime();
    let task = rt.run(&code).unwrap();
    let err = rt.next(&task).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(
        err.message(),
        Some("'async for' requires an object with __aiter__ method, got list")
    );
}

/// An async context manager whose methods are coroutine functions from module code.
#[derive(Debug)]
struct AsyncManaged {
    aenter: Object,
    aexit: Object,
}

impl HostObject for AsyncManaged {
    fn type_name(&self) -> &str {
        "AsyncManaged"
    }

    fn get_attr(&self, name: &str) -> Result<Object, Exception> {
        match name {
            "__aenter__" => Ok(self.aenter.clone()),
            "__aexit__" => Ok(self.aexit.clone()),
            _ => Err(Exception::new(
                ExcType::AttributeError,
                Some(format!("'AsyncManaged' object has no attribute '{name}'")),
            )),
        }
    }
}

/// ```text
/// async def aenter(): return "resource"
/// async def aexit(t, e, tb):
///     await tick("exiting")
///     exit_type = t
///     return t
/// async def main():
///     async with manager as entered:
///         raise ValueError("boom")
///     return "done"
/// ```
fn async_with_program() -> (Arc<CodeUnit>, Arc<CodeUnit>) {
    let aenter = coroutine("aenter", |b| return_str(b, "resource"));
    let aexit = function_with_flags("aexit", &["t", "e", "tb"], CodeFlags::IS_COROUTINE, |b| {
        b.emit_load_const(Constant::Str("exiting".to_owned()));
        b.emit(Opcode::YieldValue);
        b.emit(Opcode::Pop);
        b.emit_load_local(0);
        b.emit_store_global("exit_type");
        b.emit_load_local(0);
        b.emit(Opcode::ReturnValue);
    });
    let main = coroutine("main", |b| {
        b.emit_load_global("manager");
        b.emit(Opcode::SetupAsyncWith);
        emit_await(b);
        let depth = b.stack_depth() - 1;
        let start = b.offset_u32();
        b.emit_store_global("entered");
        common::raise_new(b, "ValueError", "boom");
        let end = b.offset_u32();
        b.emit(Opcode::LoadNone);
        let exit = b.offset_u32();
        b.emit(Opcode::GetAExitCoro);
        emit_await(b);
        b.emit(Opcode::ExitAsyncWith);
        b.add_exception_entry(ExceptionEntry::new(start, end, exit, depth));
        return_str(b, "done");
    });
    let setup = module(|b| {
        define(b, "aenter", aenter);
        define(b, "aexit", aexit);
        define(b, "main", main);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
    });
    let start = module(|b| {
        call_global(b, "main", &[]);
        b.emit(Opcode::ReturnValue);
    });
    (setup, start)
}

/// `__aexit__` is awaited with the exception and a true result swallows it.
#[test]
fn async_with_awaits_exit_with_the_exception() {
    let (setup, start) = async_with_program();
    let mut rt = runtime();
    rt.run(&setup).unwrap();
    let managed = AsyncManaged {
        aenter: rt.global("aenter").unwrap(),
        aexit: rt.global("aexit").unwrap(),
    };
    rt.set_global("manager", Object::host(managed)).unwrap();

    let task = rt.run(&start).unwrap();
    assert_eq!(
        rt.next(&task).unwrap(),
        Resumed::Yielded(Object::String("exiting".to_owned()))
    );
    assert_eq!(
        rt.send(&task, Object::None).unwrap(),
        Resumed::Returned(Object::String("done".to_owned()))
    );
    assert_eq!(rt.global("entered"), Some(Object::String("resource".to_owned())));
    assert_eq!(rt.global("exit_type"), Some(Object::ExcType(ExcType::ValueError)));
}

#[test]
fn async_with_requires_the_async_protocol() {
    let main = coroutine("main", |b| {
        b.emit_load_int(1);
        b.emit(Opcode::SetupAsyncWith);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "main", main);
        call_global(b, "main", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = runtime();
    let task = rt.run(&code).unwrap();
    let err = rt.next(&task).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(
        err.message(),
        Some("'int' object does not support the asynchronous context manager protocol")
    );
}
