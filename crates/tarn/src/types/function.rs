use std::sync::Arc;

use crate::{code::CodeUnit, heap::HeapId, value::Value};

/// A user-defined function: a code unit plus the state captured by `MakeFunction`.
#[derive(Debug, Clone)]
pub(crate) struct Function {
    pub code: Arc<CodeUnit>,
    pub name: String,
    pub qualname: String,
    /// Defaults for the trailing positional parameters.
    pub defaults: Vec<Value>,
    /// Defaults for keyword-only parameters, by name.
    pub kwdefaults: Vec<(String, Value)>,
    /// Cells for the code unit's free variables, in `freevars` order.
    pub closure: Vec<HeapId>,
}

impl Function {
    pub fn new(code: Arc<CodeUnit>) -> Self {
        Self {
            name: code.name().to_owned(),
            qualname: code.qualname().to_owned(),
            code,
            defaults: Vec::new(),
            kwdefaults: Vec::new(),
            closure: Vec::new(),
        }
    }

    pub fn kwdefault(&self, name: &str) -> Option<Value> {
        self.kwdefaults.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }
}
