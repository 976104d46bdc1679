//! Arithmetic: `int`/`float` fast paths, the generic numeric fallback and
//! sequence arithmetic.

use std::rc::Rc;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};

use super::Vm;
use crate::{
    bytecode::op::Opcode,
    exception::{ExcType, RunError, RunResult, SimpleException},
    heap::HeapData,
    io::PrintWriter,
    protocol::BinaryOp,
    resource::ResourceTracker,
    value::Value,
};

/// Largest magnitude at which every `i64` converts to `f64` exactly.
const EXACT_FLOAT_INT: i64 = 1 << 53;

/// A number widened for the generic path.
#[derive(Debug, Clone)]
enum Num {
    Int(BigInt),
    Float(f64),
}

fn binary_op_for(op: Opcode) -> RunResult<BinaryOp> {
    Ok(match op {
        Opcode::BinaryAdd => BinaryOp::Add,
        Opcode::BinarySub => BinaryOp::Sub,
        Opcode::BinaryMul => BinaryOp::Mul,
        Opcode::BinaryTrueDiv => BinaryOp::TrueDiv,
        Opcode::BinaryFloorDiv => BinaryOp::FloorDiv,
        Opcode::BinaryMod => BinaryOp::Mod,
        Opcode::BinaryPow => BinaryOp::Pow,
        Opcode::BinaryLShift => BinaryOp::LShift,
        Opcode::BinaryRShift => BinaryOp::RShift,
        Opcode::BinaryAnd => BinaryOp::And,
        Opcode::BinaryOr => BinaryOp::Or,
        Opcode::BinaryXor => BinaryOp::Xor,
        other => return Err(RunError::internal(format!("{other} is not a binary operator"))),
    })
}

impl<T: ResourceTracker, P: PrintWriter> Vm<'_, T, P> {
    /// Executes a binary arithmetic instruction at offset `site`.
    ///
    /// A specialized site tries the `int`/`float` fast path first; the first
    /// miss marks the site generic for the rest of the runtime's life.
    pub(super) fn binary_instr(&mut self, op: Opcode, site: usize) -> RunResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let op = binary_op_for(op)?;
        if self.site_is_specialized(site) {
            if let Some(value) = fast_binary(op, lhs, rhs) {
                self.push(value);
                return Ok(());
            }
            self.note_despecialized(site, "binary");
        }
        let value = self.binary_generic(op, lhs, rhs)?;
        self.push(value);
        Ok(())
    }

    pub(crate) fn binary_generic(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Value> {
        if let (Value::Bool(a), Value::Bool(b)) = (lhs, rhs) {
            match op {
                BinaryOp::And => return Ok(Value::Bool(a & b)),
                BinaryOp::Or => return Ok(Value::Bool(a | b)),
                BinaryOp::Xor => return Ok(Value::Bool(a ^ b)),
                _ => {}
            }
        }
        if let (Some(a), Some(b)) = (self.numeric(lhs), self.numeric(rhs)) {
            return self.numeric_binary(op, a, b, lhs, rhs);
        }
        if let Some(value) = self.sequence_binary(op, lhs, rhs)? {
            return Ok(value);
        }
        if let Some(value) = self.host_binary(op, lhs, rhs)? {
            return Ok(value);
        }
        if op == BinaryOp::Add
            && let Value::Ref(id) = lhs
        {
            let kind = self.heap.get(id).type_name();
            if matches!(&*kind, "str" | "list" | "tuple") {
                return Err(ExcType::type_error(format!(
                    "can only concatenate {kind} (not \"{}\") to {kind}",
                    rhs.type_name(self.heap)
                )));
            }
        }
        Err(ExcType::unsupported_operands(
            op.into(),
            lhs.type_name(self.heap),
            rhs.type_name(self.heap),
        ))
    }

    fn numeric(&self, value: Value) -> Option<Num> {
        match value {
            Value::Float(f) => Some(Num::Float(f)),
            other => other.as_bigint(self.heap).map(Num::Int),
        }
    }

    fn numeric_binary(&mut self, op: BinaryOp, a: Num, b: Num, lhs: Value, rhs: Value) -> RunResult<Value> {
        let (a, b) = match (a, b) {
            (Num::Int(a), Num::Int(b)) => return self.int_binary(op, &a, &b),
            (a, b) => (to_float(a)?, to_float(b)?),
        };
        let result = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::TrueDiv => {
                if b == 0.0 {
                    return Err(ExcType::zero_division("float division by zero"));
                }
                a / b
            }
            BinaryOp::FloorDiv => {
                if b == 0.0 {
                    return Err(ExcType::zero_division("float floor division by zero"));
                }
                float_floordiv(a, b)
            }
            BinaryOp::Mod => {
                if b == 0.0 {
                    return Err(ExcType::zero_division("float modulo"));
                }
                float_mod(a, b)
            }
            BinaryOp::Pow => {
                if a == 0.0 && b < 0.0 {
                    return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
                }
                a.powf(b)
            }
            BinaryOp::LShift | BinaryOp::RShift | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                return Err(ExcType::unsupported_operands(
                    op.into(),
                    lhs.type_name(self.heap),
                    rhs.type_name(self.heap),
                ));
            }
        };
        Ok(Value::Float(result))
    }

    fn int_binary(&mut self, op: BinaryOp, a: &BigInt, b: &BigInt) -> RunResult<Value> {
        let result = match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::TrueDiv => {
                if b.is_zero() {
                    return Err(ExcType::zero_division("division by zero"));
                }
                return Ok(Value::Float(to_float(Num::Int(a.clone()))? / to_float(Num::Int(b.clone()))?));
            }
            BinaryOp::FloorDiv => {
                if b.is_zero() {
                    return Err(ExcType::zero_division("integer division or modulo by zero"));
                }
                a.div_floor(b)
            }
            BinaryOp::Mod => {
                if b.is_zero() {
                    return Err(ExcType::zero_division("integer modulo by zero"));
                }
                a.mod_floor(b)
            }
            BinaryOp::Pow => {
                if b.is_negative() {
                    if a.is_zero() {
                        return Err(ExcType::zero_division("0.0 cannot be raised to a negative power"));
                    }
                    let base = to_float(Num::Int(a.clone()))?;
                    let exponent = to_float(Num::Int(b.clone()))?;
                    return Ok(Value::Float(base.powf(exponent)));
                }
                let exponent = b.to_u32().ok_or_else(|| overflow("exponent too large"))?;
                a.pow(exponent)
            }
            BinaryOp::LShift => {
                let shift = shift_count(b)?;
                if a.is_zero() {
                    BigInt::zero()
                } else {
                    a << shift
                }
            }
            BinaryOp::RShift => {
                let shift = shift_count(b)?;
                a >> shift
            }
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
        };
        Ok(Value::from_bigint(result, self.heap)?)
    }

    /// `+` and `*` on strings, lists and tuples.
    fn sequence_binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Option<Value>> {
        match op {
            BinaryOp::Add => {
                let (Value::Ref(a), Value::Ref(b)) = (lhs, rhs) else {
                    return Ok(None);
                };
                let data = match (self.heap.get(a), self.heap.get(b)) {
                    (HeapData::Str(x), HeapData::Str(y)) => HeapData::Str(format!("{x}{y}")),
                    (HeapData::List(x), HeapData::List(y)) => HeapData::List(x.iter().chain(y).copied().collect()),
                    (HeapData::Tuple(x), HeapData::Tuple(y)) => HeapData::Tuple(x.iter().chain(y).copied().collect()),
                    _ => return Ok(None),
                };
                Ok(Some(Value::Ref(self.heap.allocate(data)?)))
            }
            BinaryOp::Mul => {
                let (sequence, count) = match (lhs, rhs) {
                    (Value::Ref(id), count) | (count, Value::Ref(id)) if count.as_index().is_some() => {
                        (id, count.as_index().unwrap_or(0))
                    }
                    _ => return Ok(None),
                };
                let count = usize::try_from(count).unwrap_or(0);
                let data = match self.heap.get(sequence) {
                    HeapData::Str(s) => {
                        checked_len(s.len(), count)?;
                        HeapData::Str(s.repeat(count))
                    }
                    HeapData::List(items) => {
                        checked_len(items.len(), count)?;
                        HeapData::List(items.repeat(count))
                    }
                    HeapData::Tuple(items) => {
                        checked_len(items.len(), count)?;
                        HeapData::Tuple(items.repeat(count))
                    }
                    _ => return Ok(None),
                };
                Ok(Some(Value::Ref(self.heap.allocate(data)?)))
            }
            _ => Ok(None),
        }
    }

    /// Offers the operation to a host operand, left first, then reflected.
    fn host_binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> RunResult<Option<Value>> {
        for (host_side, other, reflected) in [(lhs, rhs, false), (rhs, lhs, true)] {
            let Value::Ref(id) = host_side else { continue };
            let HeapData::Host(host) = self.heap.get(id) else { continue };
            let host = Rc::clone(host);
            let other = self.to_object(other);
            match host.binary_op(op, &other, reflected) {
                Ok(Some(result)) => return self.from_object(result).map(Some),
                Ok(None) => {}
                Err(exc) => return Err(self.host_error(exc)),
            }
        }
        Ok(None)
    }

    pub(super) fn unary(&mut self, op: Opcode, operand: Value) -> RunResult<Value> {
        if op == Opcode::UnaryNot {
            return Ok(Value::Bool(!operand.is_truthy(self.heap)));
        }
        let symbol = match op {
            Opcode::UnaryNeg => "-",
            Opcode::UnaryPos => "+",
            _ => "~",
        };
        let value = match (op, operand) {
            (Opcode::UnaryNeg, Value::Int(i)) if i != i64::MIN => Value::Int(-i),
            (Opcode::UnaryNeg, Value::Float(f)) => Value::Float(-f),
            (Opcode::UnaryPos, Value::Int(_) | Value::Float(_)) => operand,
            (Opcode::UnaryInvert, Value::Int(i)) => Value::Int(!i),
            (_, Value::Float(_)) => {
                return Err(ExcType::type_error(format!("bad operand type for unary {symbol}: 'float'")));
            }
            _ => {
                let Some(i) = operand.as_bigint(self.heap) else {
                    return Err(ExcType::type_error(format!(
                        "bad operand type for unary {symbol}: '{}'",
                        operand.type_name(self.heap)
                    )));
                };
                let result = match op {
                    Opcode::UnaryNeg => -i,
                    Opcode::UnaryPos => i,
                    _ => -(i + BigInt::from(1)),
                };
                Value::from_bigint(result, self.heap)?
            }
        };
        Ok(value)
    }
}

/// The `int`/`float` fast path. `None` means the operands need the generic path.
fn fast_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Option<Value> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => fast_int(op, a, b),
        (Value::Float(a), Value::Float(b)) => fast_float(op, a, b),
        (Value::Int(a), Value::Float(b)) => fast_float(op, exact_float(a)?, b),
        (Value::Float(a), Value::Int(b)) => fast_float(op, a, exact_float(b)?),
        _ => None,
    }
}

fn fast_int(op: BinaryOp, a: i64, b: i64) -> Option<Value> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b)?,
        BinaryOp::Sub => a.checked_sub(b)?,
        BinaryOp::Mul => a.checked_mul(b)?,
        BinaryOp::TrueDiv => {
            if b == 0 {
                return None;
            }
            return Some(Value::Float(exact_float(a)? / exact_float(b)?));
        }
        BinaryOp::FloorDiv => {
            if b == 0 || (a == i64::MIN && b == -1) {
                return None;
            }
            a.div_floor(&b)
        }
        BinaryOp::Mod => {
            if b == 0 || (a == i64::MIN && b == -1) {
                return None;
            }
            a.mod_floor(&b)
        }
        BinaryOp::Pow => a.checked_pow(u32::try_from(b).ok()?)?,
        BinaryOp::LShift => {
            if !(0..63).contains(&b) {
                return None;
            }
            let shifted = a << b;
            if shifted >> b != a {
                return None;
            }
            shifted
        }
        BinaryOp::RShift => {
            if b < 0 {
                return None;
            }
            a >> b.min(63)
        }
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
    };
    Some(Value::Int(result))
}

fn fast_float(op: BinaryOp, a: f64, b: f64) -> Option<Value> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::TrueDiv if b != 0.0 => a / b,
        BinaryOp::FloorDiv if b != 0.0 => float_floordiv(a, b),
        BinaryOp::Mod if b != 0.0 => float_mod(a, b),
        _ => return None,
    };
    Some(Value::Float(result))
}

#[expect(clippy::cast_precision_loss, reason = "magnitude is checked to be exactly representable")]
fn exact_float(i: i64) -> Option<f64> {
    (-EXACT_FLOAT_INT..=EXACT_FLOAT_INT).contains(&i).then_some(i as f64)
}

fn to_float(n: Num) -> RunResult<f64> {
    match n {
        Num::Float(f) => Ok(f),
        Num::Int(i) => i
            .to_f64()
            .filter(|f| f.is_finite())
            .ok_or_else(|| overflow("int too large to convert to float")),
    }
}

fn overflow(msg: &str) -> RunError {
    SimpleException::new_msg(ExcType::OverflowError, msg).into()
}

fn shift_count(b: &BigInt) -> RunResult<usize> {
    if b.is_negative() {
        return Err(ExcType::value_error("negative shift count"));
    }
    b.to_usize().ok_or_else(|| overflow("too many digits in integer"))
}

fn checked_len(len: usize, count: usize) -> RunResult<usize> {
    len.checked_mul(count)
        .ok_or_else(|| SimpleException::new_none(ExcType::MemoryError).into())
}

/// Python's float `%`: the result takes the sign of the divisor.
pub(crate) fn float_mod(a: f64, b: f64) -> f64 {
    let m = a % b;
    if m == 0.0 {
        0.0_f64.copysign(b)
    } else if (b < 0.0) != (m < 0.0) {
        m + b
    } else {
        m
    }
}

/// Python's float `//`, consistent with [`float_mod`].
pub(crate) fn float_floordiv(a: f64, b: f64) -> f64 {
    let m = a % b;
    let mut div = (a - m) / b;
    if m != 0.0 && (b < 0.0) != (m < 0.0) {
        div -= 1.0;
    }
    if div == 0.0 {
        return 0.0_f64.copysign(a / b);
    }
    let floor = div.floor();
    if div - floor > 0.5 { floor + 1.0 } else { floor }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_mod_follows_divisor_sign() {
        assert_eq!(float_mod(7.0, 3.0), 1.0);
        assert_eq!(float_mod(-7.0, 3.0), 2.0);
        assert_eq!(float_mod(7.0, -3.0), -2.0);
        assert!(float_mod(6.0, -3.0).is_sign_negative());
    }

    #[test]
    fn float_floordiv_rounds_down() {
        assert_eq!(float_floordiv(7.0, 2.0), 3.0);
        assert_eq!(float_floordiv(-7.0, 2.0), -4.0);
        assert_eq!(float_floordiv(7.5, -2.0), -4.0);
    }

    #[test]
    fn fast_int_declines_overflow() {
        assert_eq!(fast_int(BinaryOp::Add, i64::MAX, 1), None);
        assert_eq!(fast_int(BinaryOp::FloorDiv, i64::MIN, -1), None);
        assert_eq!(fast_int(BinaryOp::LShift, 1, 62), Some(Value::Int(1 << 62)));
        assert_eq!(fast_int(BinaryOp::LShift, 3, 62), None);
        assert_eq!(fast_int(BinaryOp::Mod, -7, 3), Some(Value::Int(2)));
    }
}
