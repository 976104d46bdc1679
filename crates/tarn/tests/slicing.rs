//! Slice objects and slicing of built-in sequences.

mod common;

use common::{module, runtime};
use pretty_assertions::assert_eq;
use tarn::{CodeBuilder, Constant, ExcType, Object, Opcode};

/// A slice bound: `None` or an int.
fn emit_bound(b: &mut CodeBuilder, bound: Option<i64>) {
    match bound {
        Some(n) => b.emit_load_int(n),
        None => b.emit(Opcode::LoadNone),
    }
}

/// `container[start:stop:step]` for the constant `container`.
fn slice_of(container: Constant, start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Object {
    let code = module(|b| {
        b.emit_load_const(container);
        emit_bound(b, start);
        emit_bound(b, stop);
        emit_bound(b, step);
        b.emit_u8(Opcode::BuildSlice, 3);
        b.emit(Opcode::BinarySubscr);
        b.emit(Opcode::ReturnValue);
    });
    runtime().run(&code).unwrap()
}

fn ints(values: &[i64]) -> Vec<Object> {
    values.iter().copied().map(Object::Int).collect()
}

fn int_tuple(values: &[i64]) -> Constant {
    Constant::Tuple(values.iter().copied().map(Constant::Int).collect())
}

#[test]
fn tuples_and_strings_slice_into_their_own_type() {
    let digits = int_tuple(&[0, 1, 2, 3, 4, 5]);
    assert_eq!(
        slice_of(digits.clone(), Some(1), Some(4), None),
        Object::Tuple(ints(&[1, 2, 3]))
    );
    assert_eq!(
        slice_of(digits.clone(), None, None, Some(-2)),
        Object::Tuple(ints(&[5, 3, 1]))
    );
    assert_eq!(slice_of(digits, Some(-2), Some(99), None), Object::Tuple(ints(&[4, 5])));
    assert_eq!(
        slice_of(Constant::Str("tarnish".to_owned()), None, Some(4), None),
        Object::String("tarn".to_owned())
    );
    assert_eq!(
        slice_of(Constant::Str("abc".to_owned()), None, None, Some(-1)),
        Object::String("cba".to_owned())
    );
}

/// `list(range(10)[2:8:3])`
#[test]
fn ranges_slice_into_ranges() {
    let code = module(|b| {
        b.emit_load_global("list");
        b.emit_load_global("range");
        b.emit_load_int(10);
        b.emit_u8(Opcode::CallFunction, 1);
        b.emit_load_int(2);
        b.emit_load_int(8);
        b.emit_load_int(3);
        b.emit_u8(Opcode::BuildSlice, 3);
        b.emit(Opcode::BinarySubscr);
        b.emit_u8(Opcode::CallFunction, 1);
        b.emit(Opcode::ReturnValue);
    });
    assert_eq!(runtime().run(&code).unwrap(), Object::List(ints(&[2, 5])));
}

#[test]
fn slice_objects_have_a_repr() {
    let code = module(|b| {
        b.emit_load_global("repr");
        b.emit_load_int(1);
        b.emit(Opcode::LoadNone);
        b.emit_u8(Opcode::BuildSlice, 2);
        b.emit_u8(Opcode::CallFunction, 1);
        b.emit(Opcode::ReturnValue);
    });
    assert_eq!(
        runtime().run(&code).unwrap(),
        Object::String("slice(1, None, None)".to_owned())
    );
}

#[test]
fn zero_step_is_a_value_error() {
    let code = module(|b| {
        b.emit_load_const(int_tuple(&[1, 2]));
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::LoadNone);
        b.emit_load_int(0);
        b.emit_u8(Opcode::BuildSlice, 3);
        b.emit(Opcode::BinarySubscr);
        b.emit(Opcode::ReturnValue);
    });
    let err = runtime().run(&code).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(err.message(), Some("slice step cannot be zero"));
}

/// `items = [0, 1, 2, 3, 4]`, then `body`, then `return items`.
fn with_items(body: impl FnOnce(&mut CodeBuilder)) -> Result<Object, tarn::Exception> {
    let code = module(|b| {
        for n in 0..5 {
            b.emit_load_int(n);
        }
        b.emit_u16(Opcode::BuildList, 5);
        b.emit_store_global("items");
        body(b);
        b.emit_load_global("items");
        b.emit(Opcode::ReturnValue);
    });
    runtime().run(&code)
}

/// `items[start:stop:step] = value`
fn assign_slice(b: &mut CodeBuilder, start: Option<i64>, stop: Option<i64>, step: Option<i64>, value: Constant) {
    b.emit_load_const(value);
    b.emit_load_global("items");
    emit_bound(b, start);
    emit_bound(b, stop);
    emit_bound(b, step);
    b.emit_u8(Opcode::BuildSlice, 3);
    b.emit(Opcode::StoreSubscr);
}

#[test]
fn simple_slice_assignment_can_resize() {
    let items = with_items(|b| assign_slice(b, Some(1), Some(4), None, int_tuple(&[9])));
    assert_eq!(items.unwrap(), Object::List(ints(&[0, 9, 4])));

    let items = with_items(|b| assign_slice(b, Some(2), Some(2), None, int_tuple(&[7, 8])));
    assert_eq!(items.unwrap(), Object::List(ints(&[0, 1, 7, 8, 2, 3, 4])));
}

#[test]
fn extended_slice_assignment_needs_a_matching_length() {
    let items = with_items(|b| assign_slice(b, None, None, Some(2), int_tuple(&[7, 8, 9])));
    assert_eq!(items.unwrap(), Object::List(ints(&[7, 1, 8, 3, 9])));

    let err = with_items(|b| assign_slice(b, None, None, Some(2), int_tuple(&[7]))).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::ValueError);
    assert_eq!(
        err.message(),
        Some("attempt to assign sequence of size 1 to extended slice of size 3")
    );
}

#[test]
fn slice_assignment_needs_an_iterable() {
    let err = with_items(|b| assign_slice(b, Some(0), Some(1), None, Constant::Int(5))).unwrap_err();
    assert_eq!(err.exc_type(), ExcType::TypeError);
    assert_eq!(err.message(), Some("can only assign an iterable"));
}

/// `del items[::-2]`
#[test]
fn slice_deletion_removes_every_selected_item() {
    let items = with_items(|b| {
        b.emit_load_global("items");
        b.emit(Opcode::LoadNone);
        b.emit(Opcode::LoadNone);
        b.emit_load_int(-2);
        b.emit_u8(Opcode::BuildSlice, 3);
        b.emit(Opcode::DeleteSubscr);
    });
    assert_eq!(items.unwrap(), Object::List(ints(&[1, 3])));
}
