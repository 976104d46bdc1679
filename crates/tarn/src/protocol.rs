//! The seam to an external object model.
//!
//! Objects supplied by the host implement [`HostObject`]. Instructions that meet
//! a host object call into it for attribute, item, call, iteration, comparison
//! and arithmetic protocols, and treat whatever exception it returns as raised
//! at the instruction.

use std::fmt;

use strum::{Display, IntoStaticStr};

use crate::{
    exception::{ExcType, Exception},
    object::Object,
};

/// Binary arithmetic operators. Displays as the operator symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum BinaryOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    TrueDiv,
    #[strum(serialize = "//")]
    FloorDiv,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "** or pow()")]
    Pow,
    #[strum(serialize = "<<")]
    LShift,
    #[strum(serialize = ">>")]
    RShift,
    #[strum(serialize = "&")]
    And,
    #[strum(serialize = "|")]
    Or,
    #[strum(serialize = "^")]
    Xor,
}

/// Rich comparison operators. Displays as the operator symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum CompareOp {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
}

impl CompareOp {
    /// The operator with operands swapped (`a < b` is `b > a`).
    #[must_use]
    pub fn reflected(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }

    /// Applies the operator to an ordering.
    #[must_use]
    pub fn test(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            Self::Eq => ordering == Equal,
            Self::Ne => ordering != Equal,
            Self::Lt => ordering == Less,
            Self::Le => ordering != Greater,
            Self::Gt => ordering == Greater,
            Self::Ge => ordering != Less,
        }
    }
}

/// An object whose behavior is defined by the embedding application.
///
/// Every protocol method has a default that raises the error the language
/// raises for an object lacking that protocol. Methods take `&self`; objects
/// with mutable state use interior mutability.
///
/// To act as a `yield from` delegate, implement `iter_next`, and
/// `call_method("send" | "throw" | "close")` together with [`has_method`]. A
/// delegate finishes by returning a `StopIteration` whose first argument is
/// the result.
///
/// [`has_method`]: HostObject::has_method
pub trait HostObject: fmt::Debug {
    fn type_name(&self) -> &str {
        "object"
    }

    fn repr(&self) -> String {
        format!("<{} object>", self.type_name())
    }

    /// True if the object provides method `name` through [`HostObject::call_method`].
    fn has_method(&self, name: &str) -> bool {
        let _ = name;
        false
    }

    fn get_attr(&self, name: &str) -> Result<Object, Exception> {
        Err(no_attribute(self.type_name(), name))
    }

    fn set_attr(&self, name: &str, value: Object) -> Result<(), Exception> {
        let _ = value;
        Err(no_attribute(self.type_name(), name))
    }

    /// `del object.name`.
    fn del_attr(&self, name: &str) -> Result<(), Exception> {
        Err(no_attribute(self.type_name(), name))
    }

    fn get_item(&self, key: &Object) -> Result<Object, Exception> {
        let _ = key;
        Err(type_error(format!("'{}' object is not subscriptable", self.type_name())))
    }

    fn set_item(&self, key: Object, value: Object) -> Result<(), Exception> {
        let _ = (key, value);
        Err(type_error(format!(
            "'{}' object does not support item assignment",
            self.type_name()
        )))
    }

    fn call(&self, args: Vec<Object>, kwargs: Vec<(String, Object)>) -> Result<Object, Exception> {
        let _ = (args, kwargs);
        Err(type_error(format!("'{}' object is not callable", self.type_name())))
    }

    fn call_method(&self, name: &str, args: Vec<Object>) -> Result<Object, Exception> {
        let _ = args;
        Err(no_attribute(self.type_name(), name))
    }

    /// Advances the object as an iterator. `Ok(None)` means exhausted.
    fn iter_next(&self) -> Result<Option<Object>, Exception> {
        Err(type_error(format!("'{}' object is not an iterator", self.type_name())))
    }

    /// Rich comparison. `Ok(None)` means the comparison is not implemented.
    fn compare(&self, op: CompareOp, other: &Object) -> Result<Option<Object>, Exception> {
        let _ = (op, other);
        Ok(None)
    }

    /// Arithmetic. `reflected` is set when the host object is the right operand.
    /// `Ok(None)` means the operation is not implemented.
    fn binary_op(&self, op: BinaryOp, other: &Object, reflected: bool) -> Result<Option<Object>, Exception> {
        let _ = (op, other, reflected);
        Ok(None)
    }
}

fn no_attribute(type_name: &str, name: &str) -> Exception {
    Exception::new(
        ExcType::AttributeError,
        Some(format!("'{type_name}' object has no attribute '{name}'")),
    )
}

fn type_error(msg: String) -> Exception {
    Exception::new(ExcType::TypeError, Some(msg))
}
