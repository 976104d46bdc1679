use crate::value::Value;

/// A closure cell: one variable shared between an enclosing and a nested scope.
///
/// `None` is the unbound state.
#[derive(Debug, Clone, Default)]
pub(crate) struct Cell {
    value: Option<Value>,
}

impl Cell {
    pub fn new(value: Option<Value>) -> Self {
        Self { value }
    }

    pub fn get(&self) -> Option<Value> {
        self.value
    }

    pub fn set(&mut self, value: Value) {
        self.value = Some(value);
    }

    /// Unbinds the cell; later reads observe the unbound state.
    pub fn clear(&mut self) {
        self.value = None;
    }
}
