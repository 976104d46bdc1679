//! The immediate value representation used on the operand stack and in local slots.

use std::{borrow::Cow, fmt::Write as _};

use num_bigint::BigInt;
use num_traits::{ToPrimitive, Zero};

use crate::{
    builtins::Builtins,
    heap::{Heap, HeapData, HeapId},
    resource::{ResourceError, ResourceTracker},
    types::Range,
};

/// A value: either an immediate or a handle to a heap object.
///
/// Values are `Copy`; the heap owns the objects they point at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Value {
    /// A cleared local slot. Never visible to running code.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Builtin(Builtins),
    Ref(HeapId),
}

impl Value {
    /// Normalizes a big integer, allocating only when it does not fit an `i64`.
    pub fn from_bigint(b: BigInt, heap: &mut Heap<impl ResourceTracker>) -> Result<Self, ResourceError> {
        match b.to_i64() {
            Some(i) => Ok(Self::Int(i)),
            None => heap.allocate(HeapData::LongInt(b)).map(Self::Ref),
        }
    }

    /// The integer value, for `bool`, `int` and long ints.
    pub fn as_bigint(self, heap: &Heap<impl ResourceTracker>) -> Option<BigInt> {
        match self {
            Self::Bool(b) => Some(BigInt::from(i64::from(b))),
            Self::Int(i) => Some(BigInt::from(i)),
            Self::Ref(id) => match heap.get(id) {
                HeapData::LongInt(b) => Some(b.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// The value as an index, for `bool` and `int` values that fit an `i64`.
    pub fn as_index(self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(b)),
            Self::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn ref_id(self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// The language-level type name, as used in error messages.
    pub fn type_name(self, heap: &Heap<impl ResourceTracker>) -> Cow<'static, str> {
        match self {
            Self::Undefined => "undefined".into(),
            Self::None => "NoneType".into(),
            Self::Bool(_) => "bool".into(),
            Self::Int(_) => "int".into(),
            Self::Float(_) => "float".into(),
            Self::Builtin(Builtins::Function(_)) => "builtin_function_or_method".into(),
            Self::Builtin(Builtins::ExcType(_)) => "type".into(),
            Self::Ref(id) => heap.get(id).type_name(),
        }
    }

    /// Truthiness: `bool(value)`.
    pub fn is_truthy(self, heap: &Heap<impl ResourceTracker>) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
            Self::Float(f) => f != 0.0,
            Self::Builtin(_) => true,
            Self::Ref(id) => match heap.get(id) {
                HeapData::Str(s) => !s.is_empty(),
                HeapData::LongInt(b) => !b.is_zero(),
                HeapData::Tuple(items) | HeapData::List(items) => !items.is_empty(),
                HeapData::Dict(dict) => !dict.is_empty(),
                HeapData::Range(range) => range.len() > 0,
                _ => true,
            },
        }
    }

    /// Identity comparison (`is`). Immediates compare by value.
    pub fn is_identical(self, other: Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    /// `repr(value)`.
    pub fn repr(self, heap: &Heap<impl ResourceTracker>) -> String {
        let mut out = String::new();
        write_repr(self, heap, &mut out, &mut Vec::new());
        out
    }

    /// `str(value)`: strings render raw, exceptions render their message.
    pub fn str_value(self, heap: &Heap<impl ResourceTracker>) -> String {
        if let Self::Ref(id) = self {
            match heap.get(id) {
                HeapData::Str(s) => return s.clone(),
                HeapData::Exception(exc) => return exc.message(heap).unwrap_or_default(),
                _ => {}
            }
        }
        self.repr(heap)
    }
}

/// Renders `items` as a comma-separated sequence; one-element tuples get a trailing comma.
pub(crate) fn repr_sequence(items: &[Value], open: &str, close: &str, heap: &Heap<impl ResourceTracker>) -> String {
    let mut out = String::new();
    write_sequence(items, open, close, heap, &mut out, &mut Vec::new());
    out
}

fn write_sequence(
    items: &[Value],
    open: &str,
    close: &str,
    heap: &Heap<impl ResourceTracker>,
    out: &mut String,
    seen: &mut Vec<HeapId>,
) {
    out.push_str(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(*item, heap, out, seen);
    }
    if open == "(" && items.len() == 1 {
        out.push(',');
    }
    out.push_str(close);
}

fn write_repr(value: Value, heap: &Heap<impl ResourceTracker>, out: &mut String, seen: &mut Vec<HeapId>) {
    match value {
        Value::Undefined => out.push_str("<undefined>"),
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Float(f) => out.push_str(&float_repr(f)),
        Value::Builtin(Builtins::Function(f)) => {
            let _ = write!(out, "<built-in function {f}>");
        }
        Value::Builtin(Builtins::ExcType(t)) => {
            let _ = write!(out, "<class '{t}'>");
        }
        Value::Ref(id) => {
            if seen.contains(&id) {
                out.push_str(match heap.get(id) {
                    HeapData::Dict(_) => "{...}",
                    HeapData::List(_) => "[...]",
                    _ => "(...)",
                });
                return;
            }
            seen.push(id);
            write_heap_repr(id, heap, out, seen);
            seen.pop();
        }
    }
}

fn write_heap_repr(id: HeapId, heap: &Heap<impl ResourceTracker>, out: &mut String, seen: &mut Vec<HeapId>) {
    match heap.get(id) {
        HeapData::Str(s) => out.push_str(&str_repr(s)),
        HeapData::LongInt(b) => {
            let _ = write!(out, "{b}");
        }
        HeapData::Tuple(items) => write_sequence(items, "(", ")", heap, out, seen),
        HeapData::List(items) => write_sequence(items, "[", "]", heap, out, seen),
        HeapData::Dict(dict) => {
            out.push('{');
            for (i, (k, v)) in dict.items().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(k, heap, out, seen);
                out.push_str(": ");
                write_repr(v, heap, out, seen);
            }
            out.push('}');
        }
        HeapData::Range(Range { start, stop, step }) => {
            if *step == 1 {
                let _ = write!(out, "range({start}, {stop})");
            } else {
                let _ = write!(out, "range({start}, {stop}, {step})");
            }
        }
        HeapData::Slice(slice) => {
            out.push_str("slice(");
            write_repr(slice.start, heap, out, seen);
            out.push_str(", ");
            write_repr(slice.stop, heap, out, seen);
            out.push_str(", ");
            write_repr(slice.step, heap, out, seen);
            out.push(')');
        }
        HeapData::Iter(it) => {
            let _ = write!(out, "<{} object>", it.type_name());
        }
        HeapData::Cell(cell) => match cell.get() {
            Some(v) => {
                let _ = write!(out, "<cell: {} object>", v.type_name(heap));
            }
            None => out.push_str("<cell: empty>"),
        },
        HeapData::Code(code) => {
            let _ = write!(out, "<code object {}>", code.name());
        }
        HeapData::Function(f) => {
            let _ = write!(out, "<function {}>", f.qualname);
        }
        HeapData::BoundMethod(m) => {
            let _ = write!(out, "<built-in method {} of {} object>", m.name, m.receiver.type_name(heap));
        }
        HeapData::Exception(exc) => {
            let _ = write!(out, "{}", exc.exc_type);
            match &exc.group {
                Some(group) => {
                    out.push('(');
                    out.push_str(&str_repr(&group.message));
                    out.push_str(", [");
                    for (i, leaf) in group.exceptions.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        write_repr(Value::Ref(*leaf), heap, out, seen);
                    }
                    out.push_str("])");
                }
                None => {
                    out.push('(');
                    for (i, arg) in exc.args.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        write_repr(*arg, heap, out, seen);
                    }
                    out.push(')');
                }
            }
        }
        HeapData::Generator(g) => {
            let _ = write!(out, "<{} object {}>", g.kind.type_name(), g.qualname);
        }
        HeapData::AsyncGenWrapped(inner) => write_repr(*inner, heap, out, seen),
        HeapData::AsyncGenAwaitable(a) => {
            let _ = write!(out, "<{} object>", a.type_name());
        }
        HeapData::Host(host) => out.push_str(&host.repr()),
    }
}

/// Python-style string repr, preferring single quotes.
pub(crate) fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Python-style float repr: shortest round-trip digits, `1.0` for integral values,
/// exponent notation outside `1e-4..1e16`.
pub(crate) fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let formatted = format!("{f:e}");
        let (mantissa, exponent) = formatted.split_once('e').unwrap_or((&formatted, "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(d) => ('-', d),
            None => ('+', exponent),
        };
        return format!("{mantissa}e{sign}{digits:0>2}");
    }
    let formatted = format!("{f}");
    if formatted.contains('.') {
        formatted
    } else {
        format!("{formatted}.0")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn floats_render_like_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(-0.5), "-0.5");
        assert_eq!(float_repr(1e22), "1e+22");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn strings_pick_quotes() {
        assert_eq!(str_repr("abc"), "'abc'");
        assert_eq!(str_repr("it's"), "\"it's\"");
        assert_eq!(str_repr("a\nb"), "'a\\nb'");
    }
}
