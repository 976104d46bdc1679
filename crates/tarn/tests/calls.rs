//! Calls, argument binding, closures and class bodies.

mod common;

use common::{call_global, define, function, module, runtime};
use pretty_assertions::assert_eq;
use tarn::{
    CALL_VARARGS_KWARGS, CodeBuilder, CodeFlags, Constant, ExcType, MAKE_FUNCTION_CLOSURE, MAKE_FUNCTION_DEFAULTS,
    Object, Opcode, Runtime,
};

/// `def add(a, b): return a + b` called from module code.
#[test]
fn positional_call_returns_value() {
    let add = function("add", &["a", "b"], |b| {
        b.emit_load_local(0);
        b.emit_load_local(1);
        b.emit(Opcode::BinaryAdd);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "add", add);
        call_global(b, "add", &[10, 20]);
        call_global(b, "add", &[30, 40]);
        b.emit(Opcode::BinaryAdd);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = Runtime::new();
    assert_eq!(rt.run(&code).unwrap(), Object::Int(100));
}

/// Defaults fill trailing parameters and keyword arguments bind by name.
#[test]
fn defaults_and_keywords_bind() {
    let sub = function("sub", &["a", "b"], |b| {
        b.emit_load_local(0);
        b.emit_load_local(1);
        b.emit(Opcode::BinarySub);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        b.emit_load_const(Constant::Tuple(vec![Constant::Int(1)]));
        b.emit_load_const(Constant::Code(sub));
        b.emit_u8(Opcode::MakeFunction, MAKE_FUNCTION_DEFAULTS);
        b.emit_store_global("sub");
        // sub(10) - sub(b=10, a=3)
        call_global(b, "sub", &[10]);
        b.emit_load_global("sub");
        b.emit_load_int(10);
        b.emit_load_int(3);
        b.emit_load_const(Constant::Tuple(vec![
            Constant::Str("b".to_owned()),
            Constant::Str("a".to_owned()),
        ]));
        b.emit_u8(Opcode::CallFunctionKw, 2);
        b.emit(Opcode::BinarySub);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = Runtime::new();
    assert_eq!(rt.run(&code).unwrap(), Object::Int(9 - (3 - 10)));
}

#[test]
fn missing_argument_message() {
    let pair = function("pair", &["first", "second"], |b| {
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "pair", pair);
        call_global(b, "pair", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let err = Runtime::new().run(&code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(
        err.message(),
        Some("pair() missing 2 required positional arguments: 'first' and 'second'")
    );
}

#[test]
fn too_many_positional_message() {
    let one = function("one", &["x"], |b| {
        b.emit_load_local(0);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "one", one);
        call_global(b, "one", &[1, 2]);
        b.emit(Opcode::ReturnValue);
    });
    let err = Runtime::new().run(&code).unwrap_err();
    assert_eq!(err.message(), Some("one() takes 1 positional argument but 2 were given"));
}

/// A counter closure: the inner function rebinds a free variable of the outer one.
///
/// ```text
/// def make():
///     n = 0
///     def bump():
///         nonlocal n
///         n += 1
///         return n
///     return bump
/// ```
#[test]
fn closures_share_cells() {
    let bump = {
        let mut b = CodeBuilder::new("bump");
        b.set_qualname("make.<locals>.bump");
        let n = b.add_freevar("n");
        b.emit_u16(Opcode::LoadCell, n);
        b.emit_load_int(1);
        b.emit(Opcode::BinaryAdd);
        b.emit_u16(Opcode::StoreCell, n);
        b.emit_u16(Opcode::LoadCell, n);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let make = {
        let mut b = CodeBuilder::new("make");
        let n = b.add_cellvar("n", None);
        b.emit_load_int(0);
        b.emit_u16(Opcode::StoreCell, n);
        b.emit_u16(Opcode::LoadClosure, n);
        b.emit_u16(Opcode::BuildTuple, 1);
        b.emit_load_const(Constant::Code(bump));
        b.emit_u8(Opcode::MakeFunction, MAKE_FUNCTION_CLOSURE);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let code = module(|b| {
        define(b, "make", make);
        call_global(b, "make", &[]);
        b.emit_store_global("counter");
        call_global(b, "counter", &[]);
        b.emit(Opcode::Pop);
        call_global(b, "counter", &[]);
        b.emit(Opcode::Pop);
        call_global(b, "counter", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = Runtime::new();
    assert_eq!(rt.run(&code).unwrap(), Object::Int(3));

    // The closure keeps its cell across host calls too.
    let counter = rt.global("counter").unwrap();
    assert_eq!(rt.call(&counter, vec![]).unwrap(), Object::Int(4));
}

/// A cell variable aliasing a parameter starts out holding the argument.
#[test]
fn parameter_cells_are_seeded_from_arguments() {
    let get = {
        let mut b = CodeBuilder::new("get");
        let x = b.add_freevar("x");
        b.emit_u16(Opcode::LoadCell, x);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let outer = {
        let mut b = CodeBuilder::new("outer");
        b.set_arg_counts(1, 0, 0);
        b.add_varname("x");
        let x = b.add_cellvar("x", Some(0));
        b.emit_u16(Opcode::LoadClosure, x);
        b.emit_u16(Opcode::BuildTuple, 1);
        b.emit_load_const(Constant::Code(get));
        b.emit_u8(Opcode::MakeFunction, MAKE_FUNCTION_CLOSURE);
        b.emit_u8(Opcode::CallFunction, 0);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let code = module(|b| {
        define(b, "outer", outer);
        call_global(b, "outer", &[42]);
        b.emit(Opcode::ReturnValue);
    });
    assert_eq!(Runtime::new().run(&code).unwrap(), Object::Int(42));
}

#[test]
fn reading_an_empty_free_variable_raises() {
    let get = {
        let mut b = CodeBuilder::new("get");
        let x = b.add_freevar("x");
        b.emit_u16(Opcode::LoadCell, x);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let outer = {
        let mut b = CodeBuilder::new("outer");
        let x = b.add_cellvar("x", None);
        b.emit_u16(Opcode::LoadClosure, x);
        b.emit_u16(Opcode::BuildTuple, 1);
        b.emit_load_const(Constant::Code(get));
        b.emit_u8(Opcode::MakeFunction, MAKE_FUNCTION_CLOSURE);
        b.emit_u8(Opcode::CallFunction, 0);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let code = module(|b| {
        define(b, "outer", outer);
        call_global(b, "outer", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let err = Runtime::new().run(&code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::NameError);
    assert_eq!(
        err.message(),
        Some("cannot access free variable 'x' where it is not associated with a value in enclosing scope")
    );
}

const UNBOUND_X: &str = "cannot access local variable 'x' where it is not associated with a value";

/// `x = 1; del x; return x`, and a read of a local that was never stored.
#[test]
fn reading_an_unbound_local_raises() {
    let deleted = function("deleted", &[], |b| {
        let x = b.add_varname("x");
        b.emit_load_int(1);
        b.emit_store_local(x);
        b.emit_u16(Opcode::DeleteLocal, x);
        b.emit_load_local(x);
        b.emit(Opcode::ReturnValue);
    });
    let never_stored = function("never_stored", &[], |b| {
        let x = b.add_varname("x");
        b.emit_load_local(x);
        b.emit(Opcode::ReturnValue);
    });
    for (name, unit) in [("deleted", deleted), ("never_stored", never_stored)] {
        let code = module(|b| {
            define(b, name, unit);
            call_global(b, name, &[]);
            b.emit(Opcode::ReturnValue);
        });
        let err = runtime().run(&code).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::UnboundLocalError);
        assert_eq!(err.message(), Some(UNBOUND_X));
    }
}

/// Deleting an unbound local is itself an error.
#[test]
fn deleting_an_unbound_local_raises() {
    let unit = function("f", &[], |b| {
        let x = b.add_varname("x");
        b.emit_u16(Opcode::DeleteLocal, x);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "f", unit);
        call_global(b, "f", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let err = runtime().run(&code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::UnboundLocalError);
    assert_eq!(err.message(), Some(UNBOUND_X));
}

/// `x = 1; del x; return x` where `x` lives in a cell.
#[test]
fn reading_a_deleted_cell_raises() {
    let unit = {
        let mut b = CodeBuilder::new("f");
        let x = b.add_cellvar("x", None);
        b.emit_load_int(1);
        b.emit_u16(Opcode::StoreCell, x);
        b.emit_u16(Opcode::DeleteCell, x);
        b.emit_u16(Opcode::LoadCell, x);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let code = module(|b| {
        define(b, "f", unit);
        call_global(b, "f", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let err = runtime().run(&code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::UnboundLocalError);
    assert_eq!(err.message(), Some(UNBOUND_X));
}

/// ```text
/// def outer():
///     x = 5
///     class C:
///         before = x
///         x = 7
///         after = x
///     return C
/// ```
///
/// A class body reads its own namespace first and falls back to the cell.
#[test]
fn class_cell_reads_prefer_the_namespace() {
    let body = {
        let mut b = CodeBuilder::new("C");
        let x = b.add_freevar("x");
        let before = b.add_name("before");
        let after = b.add_name("after");
        let x_name = b.add_name("x");
        b.emit_u16(Opcode::LoadClassCell, x);
        b.emit_u16(Opcode::StoreName, before);
        b.emit_load_int(7);
        b.emit_u16(Opcode::StoreName, x_name);
        b.emit_u16(Opcode::LoadClassCell, x);
        b.emit_u16(Opcode::StoreName, after);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let outer = {
        let mut b = CodeBuilder::new("outer");
        let x = b.add_cellvar("x", None);
        b.emit_load_int(5);
        b.emit_u16(Opcode::StoreCell, x);
        b.emit_load_global("__build_class__");
        b.emit_u16(Opcode::LoadClosure, x);
        b.emit_u16(Opcode::BuildTuple, 1);
        b.emit_load_const(Constant::Code(body));
        b.emit_u8(Opcode::MakeFunction, MAKE_FUNCTION_CLOSURE);
        b.emit_load_const(Constant::Str("C".to_owned()));
        b.emit_u8(Opcode::CallFunction, 2);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let code = module(|b| {
        define(b, "outer", outer);
        call_global(b, "outer", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let namespace = Runtime::new().run(&code).unwrap();
    assert_eq!(
        namespace,
        Object::Dict(vec![
            (Object::String("before".to_owned()), Object::Int(5)),
            (Object::String("x".to_owned()), Object::Int(7)),
            (Object::String("after".to_owned()), Object::Int(7)),
        ])
    );
}

/// `class Point: x = 1; y = x + 1` through `__build_class__`.
#[test]
fn class_body_builds_a_namespace() {
    let body = {
        let mut b = CodeBuilder::new("Point");
        b.emit_load_int(1);
        let x = b.add_name("x");
        b.emit_u16(Opcode::StoreName, x);
        b.emit_u16(Opcode::LoadName, x);
        b.emit_load_int(1);
        b.emit(Opcode::BinaryAdd);
        let y = b.add_name("y");
        b.emit_u16(Opcode::StoreName, y);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let code = module(|b| {
        b.emit_load_global("__build_class__");
        b.emit_load_const(Constant::Code(body));
        b.emit_u8(Opcode::MakeFunction, 0);
        b.emit_load_const(Constant::Str("Point".to_owned()));
        b.emit_u8(Opcode::CallFunction, 2);
        b.emit(Opcode::ReturnValue);
    });
    let namespace = Runtime::new().run(&code).unwrap();
    assert_eq!(
        namespace,
        Object::Dict(vec![
            (Object::String("x".to_owned()), Object::Int(1)),
            (Object::String("y".to_owned()), Object::Int(2)),
        ])
    );
}

/// Host calls reach user functions through handles.
#[test]
fn host_calls_function_handle_with_keywords() {
    let scale = {
        let mut b = CodeBuilder::new("scale");
        b.set_arg_counts(1, 0, 1);
        b.add_varname("value");
        b.add_varname("factor");
        b.emit_load_local(0);
        b.emit_load_local(1);
        b.emit(Opcode::BinaryMul);
        b.emit(Opcode::ReturnValue);
        b.build_arc()
    };
    let code = module(|b| {
        define(b, "scale", scale);
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = Runtime::new();
    rt.run(&code).unwrap();
    let scale = rt.global("scale").unwrap();
    assert!(scale.as_handle().is_some());
    let result = rt
        .call_kw(&scale, vec![Object::Int(7)], vec![("factor".to_owned(), Object::Int(6))])
        .unwrap();
    assert_eq!(result, Object::Int(42));

    let err = rt.call(&scale, vec![Object::Int(7)]).unwrap_err();
    assert_eq!(
        err.message(),
        Some("scale() missing 1 required keyword-only argument: 'factor'")
    );
}

/// Handles only resolve in the runtime that created them.
#[test]
fn handles_do_not_cross_runtimes() {
    let identity = function("identity", &["x"], |b| {
        b.emit_load_local(0);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "identity", identity);
        b.emit_load_global("identity");
        b.emit(Opcode::ReturnValue);
    });
    let mut first = Runtime::new();
    let handle = first.run(&code).unwrap();
    let mut second = Runtime::new();
    let err = second.call(&handle, vec![Object::Int(1)]).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(err.message(), Some("object handle belongs to a different runtime"));
}

#[test]
fn builtins_resolve_after_globals() {
    let code = module(|b| {
        b.emit_load_global("len");
        b.emit_load_const(Constant::Str("héllo".to_owned()));
        b.emit_u8(Opcode::CallFunction, 1);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = Runtime::new();
    assert_eq!(rt.run(&code).unwrap(), Object::Int(5));

    rt.set_global("len", Object::Int(0)).unwrap();
    let err = rt.run(&code).unwrap_err();
    assert_eq!(err.message(), Some("'int' object is not callable"));
}

#[test]
fn print_writes_through_the_writer() {
    let code = module(|b| {
        b.emit_load_global("print");
        b.emit_load_const(Constant::Str("a".to_owned()));
        b.emit_load_int(1);
        b.emit_load_const(Constant::Str("-".to_owned()));
        b.emit_load_const(Constant::Tuple(vec![Constant::Str("sep".to_owned())]));
        b.emit_u8(Opcode::CallFunctionKw, 3);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = common::runtime();
    assert_eq!(rt.run(&code).unwrap(), Object::None);
    assert_eq!(rt.print_writer().output(), "a-1\n");
}

/// Recursion past the configured depth surfaces as `RecursionError`.
#[test]
fn recursion_limit_is_enforced() {
    use tarn::{LimitedTracker, ResourceLimits, RuntimeOptions, StdPrint};

    let forever = function("forever", &[], |b| {
        b.emit_load_global("forever");
        b.emit_u8(Opcode::CallFunction, 0);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "forever", forever);
        call_global(b, "forever", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let limits = ResourceLimits::new().max_recursion_depth(Some(50));
    let mut rt = Runtime::with_parts(LimitedTracker::new(limits), StdPrint, RuntimeOptions::default());
    let err = rt.run(&code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::RecursionError);
}

#[test]
fn generator_flag_makes_calls_return_generators() {
    let gen_fn = common::function_with_flags("gen", &[], CodeFlags::IS_GENERATOR, |b| {
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
    });
    let code = module(|b| {
        define(b, "gen", gen_fn);
        call_global(b, "gen", &[]);
        b.emit(Opcode::ReturnValue);
    });
    let generator = runtime().run(&code).unwrap();
    let handle = generator.as_handle().unwrap();
    assert_eq!(handle.repr(), "<generator object gen>");
}

/// `def triple(a, b, c): return (a, b, c)`
fn triple() -> std::sync::Arc<tarn::CodeUnit> {
    function("triple", &["a", "b", "c"], |b| {
        for slot in 0..3 {
            b.emit_load_local(slot);
        }
        b.emit_u16(Opcode::BuildTuple, 3);
        b.emit(Opcode::ReturnValue);
    })
}

/// `triple(*[1, 2], **{"c": 3})`
#[test]
fn varargs_calls_unpack_positional_and_keyword_arguments() {
    let code = module(|b| {
        define(b, "triple", triple());
        b.emit_load_global("triple");
        b.emit_load_int(1);
        b.emit_load_int(2);
        b.emit_u16(Opcode::BuildList, 2);
        b.emit_load_const(Constant::Str("c".to_owned()));
        b.emit_load_int(3);
        b.emit_u16(Opcode::BuildDict, 1);
        b.emit_u8(Opcode::CallFunctionVarargs, CALL_VARARGS_KWARGS);
        b.emit(Opcode::ReturnValue);
    });
    assert_eq!(
        runtime().run(&code).unwrap(),
        Object::Tuple(vec![Object::Int(1), Object::Int(2), Object::Int(3)])
    );
}

#[test]
fn varargs_arguments_must_be_iterable() {
    let code = module(|b| {
        define(b, "triple", triple());
        b.emit_load_global("triple");
        b.emit_load_int(5);
        b.emit_u8(Opcode::CallFunctionVarargs, 0);
        b.emit(Opcode::ReturnValue);
    });
    let err = runtime().run(&code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(err.message(), Some("triple() argument after * must be an iterable, not int"));
}

#[test]
fn varargs_keywords_must_be_a_dict_of_strings() {
    let not_a_mapping = module(|b| {
        define(b, "triple", triple());
        b.emit_load_global("triple");
        b.emit_load_const(Constant::Tuple(vec![]));
        b.emit_load_int(5);
        b.emit_u8(Opcode::CallFunctionVarargs, CALL_VARARGS_KWARGS);
        b.emit(Opcode::ReturnValue);
    });
    let err = runtime().run(&not_a_mapping).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(err.message(), Some("triple() argument after ** must be a mapping, not int"));

    let int_key = module(|b| {
        define(b, "triple", triple());
        b.emit_load_global("triple");
        b.emit_load_const(Constant::Tuple(vec![]));
        b.emit_load_int(1);
        b.emit_load_int(2);
        b.emit_u16(Opcode::BuildDict, 1);
        b.emit_u8(Opcode::CallFunctionVarargs, CALL_VARARGS_KWARGS);
        b.emit(Opcode::ReturnValue);
    });
    let err = runtime().run(&int_key).unwrap_err();
    assert_eq!(err.message(), Some("keywords must be strings"));
}

/// `items = [1]; items.append(*(2,)); return items`
#[test]
fn method_varargs_calls_bind_the_receiver() {
    let code = module(|b| {
        b.emit_load_int(1);
        b.emit_u16(Opcode::BuildList, 1);
        b.emit_store_global("items");
        b.emit_load_global("items");
        b.emit_load_const(Constant::Tuple(vec![Constant::Int(2)]));
        b.emit_call_method_varargs("append", 0);
        b.emit(Opcode::Pop);
        b.emit_load_global("items");
        b.emit(Opcode::ReturnValue);
    });
    assert_eq!(
        runtime().run(&code).unwrap(),
        Object::List(vec![Object::Int(1), Object::Int(2)])
    );
}
