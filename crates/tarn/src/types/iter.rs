use crate::{heap::HeapId, types::Range};

/// What a built-in sequence iterator walks over.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IterSource {
    List(HeapId),
    Tuple(HeapId),
    /// Iterates characters; the position is a byte offset.
    Str(HeapId),
    /// Iterates keys in insertion order.
    Dict(HeapId),
    Range(Range),
}

/// Iterator over a built-in sequence. Lists are re-checked on every step, so
/// appending while iterating extends the iteration.
#[derive(Debug, Clone)]
pub(crate) struct SeqIter {
    pub source: IterSource,
    pub position: usize,
    pub exhausted: bool,
}

impl SeqIter {
    pub fn new(source: IterSource) -> Self {
        Self {
            source,
            position: 0,
            exhausted: false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.source {
            IterSource::List(_) => "list_iterator",
            IterSource::Tuple(_) => "tuple_iterator",
            IterSource::Str(_) => "str_iterator",
            IterSource::Dict(_) => "dict_keyiterator",
            IterSource::Range(_) => "range_iterator",
        }
    }
}
