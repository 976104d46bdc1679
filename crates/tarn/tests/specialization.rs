//! Guarded fast paths for arithmetic and comparisons.

mod common;

use std::sync::Arc;

use common::{define, function, module, runtime};
use num_bigint::BigInt;
use pretty_assertions::assert_eq;
use tarn::{CodeUnit, CollectStringPrint, Constant, NoLimitTracker, Object, Opcode, Runtime, RuntimeOptions};

/// `def combine(a, b): return a + b`, returned to the host.
fn combine() -> Arc<CodeUnit> {
    let unit = function("combine", &["a", "b"], |b| {
        b.emit_load_local(0);
        b.emit_load_local(1);
        b.emit(Opcode::BinaryAdd);
        b.emit(Opcode::ReturnValue);
    });
    module(|b| {
        define(b, "combine", unit);
        b.emit_load_global("combine");
        b.emit(Opcode::ReturnValue);
    })
}

fn with_options(specialize: bool) -> Runtime<NoLimitTracker, CollectStringPrint> {
    Runtime::with_parts(NoLimitTracker, CollectStringPrint::new(), RuntimeOptions { specialize })
}

fn s(value: &str) -> Object {
    Object::String(value.to_owned())
}

/// Runs a mix of operand types through one site and returns the results.
fn exercise(rt: &mut Runtime<NoLimitTracker, CollectStringPrint>) -> Vec<Object> {
    let combine = rt.run(&combine()).unwrap();
    let inputs = [
        (Object::Int(1), Object::Int(2)),
        (Object::Int(i64::MAX), Object::Int(1)),
        (Object::Float(0.5), Object::Int(2)),
        (s("ab"), s("cd")),
        (Object::Int(3), Object::Int(4)),
    ];
    inputs
        .into_iter()
        .map(|(a, b)| rt.call(&combine, vec![a, b]).unwrap())
        .collect()
}

fn expected() -> Vec<Object> {
    vec![
        Object::Int(3),
        Object::BigInt(BigInt::from(i64::MAX) + 1),
        Object::Float(2.5),
        s("abcd"),
        Object::Int(7),
    ]
}

#[test]
fn overflow_falls_back_to_big_integers() {
    let mut rt = runtime();
    assert_eq!(rt.despecialized_sites(), 0);
    assert_eq!(exercise(&mut rt), expected());
    // The overflow and the string operands hit the same site.
    assert_eq!(rt.despecialized_sites(), 1);
}

#[test]
fn generic_path_gives_the_same_answers() {
    let mut rt = with_options(false);
    assert_eq!(exercise(&mut rt), expected());
    assert_eq!(rt.despecialized_sites(), 0);
    assert!(!rt.options().specialize);
}

/// Each failing site is counted once, however often it misses.
#[test]
fn sites_are_counted_individually() {
    let code = module(|b| {
        for _ in 0..3 {
            b.emit_load_int(i64::MAX);
            b.emit_load_int(2);
            b.emit(Opcode::BinaryMul);
            b.emit(Opcode::Pop);
        }
        b.emit_load_int(1);
        b.emit_load_int(1);
        b.emit(Opcode::BinarySub);
        b.emit(Opcode::ReturnValue);
    });
    let mut rt = runtime();
    assert_eq!(rt.run(&code).unwrap(), Object::Int(0));
    assert_eq!(rt.despecialized_sites(), 3);
    rt.run(&code).unwrap();
    assert_eq!(rt.despecialized_sites(), 3);
}

/// Site state belongs to the runtime, not to the shared code unit.
#[test]
fn state_is_per_runtime() {
    let mut first = runtime();
    exercise(&mut first);
    assert_eq!(first.despecialized_sites(), 1);
    let mut second = runtime();
    let combine = second.run(&combine()).unwrap();
    assert_eq!(
        second.call(&combine, vec![Object::Int(2), Object::Int(2)]).unwrap(),
        Object::Int(4)
    );
    assert_eq!(second.despecialized_sites(), 0);
}

/// `1 == "1"` and `1 < 2.5` take different paths to the same semantics.
#[test]
fn comparisons_specialize_too() {
    let code = module(|b| {
        b.emit_load_int(1);
        b.emit_load_const(Constant::Str("1".to_owned()));
        b.emit(Opcode::CompareEq);
        b.emit_load_int(1);
        b.emit_load_const(Constant::Float(2.5));
        b.emit(Opcode::CompareLt);
        b.emit_u16(Opcode::BuildTuple, 2);
        b.emit(Opcode::ReturnValue);
    });
    let mut fast = runtime();
    let mut slow = with_options(false);
    let expected = Object::Tuple(vec![Object::Bool(false), Object::Bool(true)]);
    assert_eq!(fast.run(&code).unwrap(), expected);
    assert_eq!(slow.run(&code).unwrap(), expected);
    assert_eq!(fast.despecialized_sites(), 1);
}

/// Errors raised on the generic path are unchanged by a fast-path miss.
#[test]
fn type_errors_survive_the_fallback() {
    let mut rt = runtime();
    let combine = rt.run(&combine()).unwrap();
    let err = rt.call(&combine, vec![Object::Int(1), s("x")]).unwrap_err();
    assert_eq!(err.message(), Some("unsupported operand type(s) for +: 'int' and 'str'"));
}
