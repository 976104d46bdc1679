//! Sequence unpacking into multiple targets.

mod common;

use common::{call_global, define, function_with_flags, module, runtime};
use pretty_assertions::assert_eq;
use tarn::{CodeBuilder, CodeFlags, Constant, ExcType, Exception, Object, Opcode};

fn ints(values: &[i64]) -> Constant {
    Constant::Tuple(values.iter().copied().map(Constant::Int).collect())
}

/// Stores the unpacked values into `targets` in order, then returns them as a tuple.
fn store_and_collect(b: &mut CodeBuilder, targets: &[&str]) {
    for target in targets {
        b.emit_store_global(target);
    }
    for target in targets {
        b.emit_load_global(target);
    }
    b.emit_u16(Opcode::BuildTuple, u16::try_from(targets.len()).unwrap());
    b.emit(Opcode::ReturnValue);
}

/// `a, b, c = source`
fn unpack_three(source: impl FnOnce(&mut CodeBuilder)) -> Result<Object, Exception> {
    let code = module(|b| {
        source(b);
        b.emit_u8(Opcode::UnpackSequence, 3);
        store_and_collect(b, &["a", "b", "c"]);
    });
    runtime().run(&code)
}

#[test]
fn tuple_unpacks_in_order() {
    let result = unpack_three(|b| b.emit_load_const(ints(&[1, 2, 3]))).unwrap();
    assert_eq!(
        result,
        Object::Tuple(vec![Object::Int(1), Object::Int(2), Object::Int(3)])
    );
}

#[test]
fn strings_unpack_by_character() {
    let result = unpack_three(|b| b.emit_load_const(Constant::Str("xyz".to_owned()))).unwrap();
    let chars = ["x", "y", "z"].map(|c| Object::String(c.to_owned()));
    assert_eq!(result, Object::Tuple(chars.to_vec()));
}

#[test]
fn too_many_values() {
    let err = unpack_three(|b| b.emit_load_const(ints(&[1, 2, 3, 4]))).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.message(), Some("too many values to unpack (expected 3)"));
}

#[test]
fn not_enough_values() {
    let err = unpack_three(|b| {
        b.emit_load_int(1);
        b.emit_u16(Opcode::BuildList, 1);
    })
    .unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.message(), Some("not enough values to unpack (expected 3, got 1)"));
}

#[test]
fn non_iterables_cannot_unpack() {
    let err = unpack_three(|b| b.emit_load_int(5)).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(err.message(), Some("cannot unpack non-iterable int object"));
}

/// Generators are consumed one item past the targets to detect leftovers.
#[test]
fn generators_unpack_lazily() {
    let numbers = function_with_flags("numbers", &[], CodeFlags::IS_GENERATOR, |b| {
        for n in 1..=4 {
            b.emit_load_int(n);
            b.emit(Opcode::YieldValue);
            b.emit(Opcode::Pop);
        }
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::ReturnValue);
    });
    let err = unpack_three(|b| {
        define(b, "numbers", numbers);
        call_global(b, "numbers", &[]);
    })
    .unwrap_err();
    assert_eq!(err.message(), Some("too many values to unpack (expected 3)"));
}

/// `first, *middle, last = source`
fn unpack_starred(source: Constant) -> Result<Object, Exception> {
    let code = module(|b| {
        b.emit_load_const(source);
        b.emit_unpack_ex(1, 1);
        store_and_collect(b, &["first", "middle", "last"]);
    });
    runtime().run(&code)
}

#[test]
fn starred_target_collects_the_middle() {
    let result = unpack_starred(ints(&[1, 2, 3, 4])).unwrap();
    assert_eq!(
        result,
        Object::Tuple(vec![
            Object::Int(1),
            Object::List(vec![Object::Int(2), Object::Int(3)]),
            Object::Int(4),
        ])
    );
}

#[test]
fn starred_target_may_be_empty() {
    let result = unpack_starred(ints(&[1, 2])).unwrap();
    assert_eq!(
        result,
        Object::Tuple(vec![Object::Int(1), Object::List(Vec::new()), Object::Int(2)])
    );
}

#[test]
fn starred_target_needs_the_fixed_ones() {
    let err = unpack_starred(ints(&[1])).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(
        err.message(),
        Some("not enough values to unpack (expected at least 2, got 1)")
    );
}
