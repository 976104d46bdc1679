//! Comparisons, equality and membership.

use std::{cmp::Ordering, rc::Rc};

use num_bigint::BigInt;
use num_traits::FromPrimitive;

use super::Vm;
use crate::{
    bytecode::op::Opcode,
    exception::{ExcType, RunError, RunResult},
    heap::HeapData,
    io::PrintWriter,
    protocol::CompareOp,
    resource::ResourceTracker,
    types::DictKey,
    value::Value,
};

const EXACT_FLOAT_INT: i64 = 1 << 53;

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Executes a comparison instruction at offset `site`.
    pub(super) fn compare_instr(&mut self, op: Opcode, site: usize) -> RunResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let op = match op {
            Opcode::CompareIs => return self.push_bool(lhs.is_identical(rhs)),
            Opcode::CompareIsNot => return self.push_bool(!lhs.is_identical(rhs)),
            Opcode::CompareIn => {
                let found = self.contains(rhs, lhs)?;
                return self.push_bool(found);
            }
            Opcode::CompareNotIn => {
                let found = self.contains(rhs, lhs)?;
                return self.push_bool(!found);
            }
            Opcode::CompareEq => CompareOp::Eq,
            Opcode::CompareNe => CompareOp::Ne,
            Opcode::CompareLt => CompareOp::Lt,
            Opcode::CompareLe => CompareOp::Le,
            Opcode::CompareGt => CompareOp::Gt,
            Opcode::CompareGe => CompareOp::Ge,
            other => return Err(RunError::internal(format!("{other} is not a comparison"))),
        };
        if self.site_is_specialized(site) {
            if let Some(result) = fast_compare(op, lhs, rhs) {
                return self.push_bool(result);
            }
            self.note_despecialized(site, "compare");
        }
        let result = self.compare_generic(op, lhs, rhs)?;
        self.push(result);
        Ok(())
    }

    fn push_bool(&mut self, value: bool) -> RunResult<()> {
        self.push(Value::Bool(value));
        Ok(())
    }

    pub(crate) fn compare_generic(&mut self, op: CompareOp, lhs: Value, rhs: Value) -> RunResult<Value> {
        if let Some(ordering) = self.builtin_ordering(op, lhs, rhs)? {
            return Ok(Value::Bool(ordering));
        }
        for (host_side, other, op) in [(lhs, rhs, op), (rhs, lhs, op.reflected())] {
            let Value::Ref(id) = host_side else { continue };
            let HeapData::Host(host) = self.heap.get(id) else { continue };
            let host = Rc::clone(host);
            let other = self.to_object(other);
            match host.compare(op, &other) {
                Ok(Some(result)) => return self.from_object(result),
                Ok(None) => {}
                Err(exc) => return Err(self.host_error(exc)),
            }
        }
        match op {
            CompareOp::Eq => Ok(Value::Bool(lhs.is_identical(rhs))),
            CompareOp::Ne => Ok(Value::Bool(!lhs.is_identical(rhs))),
            _ => Err(ExcType::type_error(format!(
                "'{op}' not supported between instances of '{}' and '{}'",
                lhs.type_name(self.heap),
                rhs.type_name(self.heap)
            ))),
        }
    }

    /// Compares built-in values. `Ok(None)` means the pair has no built-in comparison.
    fn builtin_ordering(&mut self, op: CompareOp, lhs: Value, rhs: Value) -> RunResult<Option<bool>> {
        if let Some(ordering) = self.numeric_ordering(lhs, rhs) {
            return Ok(Some(match ordering {
                Some(ordering) => op.test(ordering),
                None => op == CompareOp::Ne,
            }));
        }
        let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) else {
            return Ok(None);
        };
        match (self.heap.get(a), self.heap.get(b)) {
            (HeapData::Str(x), HeapData::Str(y)) => Ok(Some(op.test(x.as_str().cmp(y.as_str())))),
            (HeapData::List(x), HeapData::List(y)) | (HeapData::Tuple(x), HeapData::Tuple(y)) => {
                let (x, y) = (x.clone(), y.clone());
                self.sequence_compare(op, &x, &y).map(Some)
            }
            (HeapData::Dict(_), HeapData::Dict(_)) if matches!(op, CompareOp::Eq | CompareOp::Ne) => {
                let equal = self.dicts_equal(lhs, rhs)?;
                Ok(Some(equal == (op == CompareOp::Eq)))
            }
            _ => Ok(None),
        }
    }

    /// `Some(None)` for numbers that are unordered (a NaN is involved).
    fn numeric_ordering(&self, lhs: Value, rhs: Value) -> Option<Option<Ordering>> {
        match (lhs, rhs) {
            (Value::Float(a), Value::Float(b)) => Some(a.partial_cmp(&b)),
            (Value::Float(f), other) => {
                let i = other.as_bigint(self.heap)?;
                Some(int_float_ordering(&i, f).map(Ordering::reverse))
            }
            (other, Value::Float(f)) => {
                let i = other.as_bigint(self.heap)?;
                Some(int_float_ordering(&i, f))
            }
            (a, b) => {
                let a = a.as_bigint(self.heap)?;
                let b = b.as_bigint(self.heap)?;
                Some(Some(a.cmp(&b)))
            }
        }
    }

    /// Lexicographic comparison: the first unequal pair decides, then length.
    fn sequence_compare(&mut self, op: CompareOp, x: &[Value], y: &[Value]) -> RunResult<bool> {
        for (a, b) in x.iter().zip(y) {
            if !self.values_equal(*a, *b)? {
                return match op {
                    CompareOp::Eq => Ok(false),
                    CompareOp::Ne => Ok(true),
                    _ => {
                        let result = self.compare_generic(op, *a, *b)?;
                        Ok(result.is_truthy(self.heap))
                    }
                };
            }
        }
        Ok(op.test(x.len().cmp(&y.len())))
    }

    fn dicts_equal(&mut self, lhs: Value, rhs: Value) -> RunResult<bool> {
        let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) else {
            return Ok(false);
        };
        let (HeapData::Dict(x), HeapData::Dict(y)) = (self.heap.get(a), self.heap.get(b)) else {
            return Ok(false);
        };
        if x.len() != y.len() {
            return Ok(false);
        }
        let pairs: Vec<(Value, Option<Value>)> = x
            .entries()
            .map(|(key, value)| (value, y.get(key)))
            .collect();
        for (value, other) in pairs {
            match other {
                Some(other) if self.values_equal(value, other)? => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// `a == b`, with the identity shortcut containers use.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> RunResult<bool> {
        if a.is_identical(b) {
            return Ok(true);
        }
        let result = self.compare_generic(CompareOp::Eq, a, b)?;
        Ok(result.is_truthy(self.heap))
    }

    /// `item in container`.
    pub(crate) fn contains(&mut self, container: Value, item: Value) -> RunResult<bool> {
        if let Value::Ref(id) = container {
            match self.heap.get(id) {
                HeapData::List(items) | HeapData::Tuple(items) => {
                    let items = items.clone();
                    for candidate in items {
                        if self.values_equal(candidate, item)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                HeapData::Dict(dict) => {
                    let key = DictKey::from_value(item, self.heap)?;
                    return Ok(dict.contains(&key));
                }
                HeapData::Str(haystack) => {
                    return match self.heap.as_str(item) {
                        Some(needle) => Ok(haystack.contains(needle)),
                        None => Err(ExcType::type_error(format!(
                            "'in <string>' requires string as left operand, not {}",
                            item.type_name(self.heap)
                        ))),
                    };
                }
                HeapData::Range(range) => {
                    return Ok(match item.as_bigint(self.heap) {
                        Some(i) => i64::try_from(i).is_ok_and(|i| range.contains(i)),
                        None => false,
                    });
                }
                HeapData::Host(host) if host.has_method("__contains__") => {
                    let host = Rc::clone(host);
                    let arg = self.to_object(item);
                    return match host.call_method("__contains__", vec![arg]) {
                        Ok(result) => {
                            let result = self.from_object(result)?;
                            Ok(result.is_truthy(self.heap))
                        }
                        Err(exc) => Err(self.host_error(exc)),
                    };
                }
                HeapData::Iter(_) | HeapData::Generator(_) | HeapData::Host(_) => {
                    while let Some(candidate) = self.iter_next(container)? {
                        if self.values_equal(candidate, item)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                _ => {}
            }
        }
        Err(ExcType::type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name(self.heap)
        )))
    }
}

/// The `int`/`float` comparison fast path.
fn fast_compare(op: CompareOp, lhs: Value, rhs: Value) -> Option<bool> {
    let ordering = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(&b)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(&b),
        (Value::Int(a), Value::Float(b)) => exact_float(a)?.partial_cmp(&b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&exact_float(b)?),
        _ => return None,
    };
    Some(match ordering {
        Some(ordering) => op.test(ordering),
        None => op == CompareOp::Ne,
    })
}

#[expect(clippy::cast_precision_loss, reason = "magnitude is checked to be exactly representable")]
fn exact_float(i: i64) -> Option<f64> {
    (-EXACT_FLOAT_INT..=EXACT_FLOAT_INT).contains(&i).then_some(i as f64)
}

/// Exact ordering of an integer against a float; `None` if the float is NaN.
fn int_float_ordering(i: &BigInt, f: f64) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if f.is_infinite() {
        return Some(if f > 0.0 { Ordering::Less } else { Ordering::Greater });
    }
    let floor = f.floor();
    let whole = BigInt::from_f64(floor)?;
    Some(match i.cmp(&whole) {
        Ordering::Equal if f > floor => Ordering::Less,
        ordering => ordering,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_only_unequal() {
        assert_eq!(fast_compare(CompareOp::Eq, Value::Float(f64::NAN), Value::Float(f64::NAN)), Some(false));
        assert_eq!(fast_compare(CompareOp::Ne, Value::Float(f64::NAN), Value::Float(1.0)), Some(true));
        assert_eq!(fast_compare(CompareOp::Lt, Value::Int(1), Value::Float(f64::NAN)), Some(false));
    }

    #[test]
    fn big_ints_compare_exactly_with_floats() {
        let big = BigInt::from(i64::MAX) + 1;
        assert_eq!(int_float_ordering(&big, 9.223_372_036_854_776e18), Some(Ordering::Equal));
        assert_eq!(int_float_ordering(&BigInt::from(3), 3.5), Some(Ordering::Less));
        assert_eq!(int_float_ordering(&BigInt::from(-4), -3.5), Some(Ordering::Less));
        assert_eq!(int_float_ordering(&BigInt::from(1), f64::INFINITY), Some(Ordering::Less));
    }
}
