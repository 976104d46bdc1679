use num_traits::Signed;

use crate::{
    exception::{ExcType, RunResult},
    heap::{Heap, HeapData},
    resource::ResourceTracker,
    value::Value,
};

/// A `slice` object. Each bound is `None` or an integer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// Bounds of a slice resolved against a sequence length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SliceIndices {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Slice {
    /// Clamps the bounds against a sequence of `len` items, as `slice.indices(len)` does.
    pub fn indices(&self, len: usize, heap: &Heap<impl ResourceTracker>) -> RunResult<SliceIndices> {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let step = match bound(self.step, heap)? {
            None => 1,
            Some(0) => return Err(ExcType::value_error("slice step cannot be zero")),
            Some(step) => step,
        };
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clamp = |index: i64| {
            if index < 0 {
                (index + len).max(lower)
            } else {
                index.min(upper)
            }
        };
        let start = bound(self.start, heap)?.map_or(if step < 0 { upper } else { lower }, clamp);
        let stop = bound(self.stop, heap)?.map_or(if step < 0 { lower } else { upper }, clamp);
        Ok(SliceIndices { start, stop, step })
    }
}

impl SliceIndices {
    /// Number of positions the slice selects.
    pub fn len(&self) -> usize {
        if (self.step > 0 && self.start >= self.stop) || (self.step < 0 && self.start <= self.stop) {
            return 0;
        }
        let span = if self.step > 0 {
            (i128::from(self.stop) - i128::from(self.start) - 1) / i128::from(self.step) + 1
        } else {
            (i128::from(self.start) - i128::from(self.stop) - 1) / -i128::from(self.step) + 1
        };
        usize::try_from(span).unwrap_or(0)
    }

    /// Selected positions, in slice order.
    pub fn positions(self) -> impl Iterator<Item = usize> {
        (0..self.len()).filter_map(move |i| {
            let at = i128::from(self.start) + i128::try_from(i).ok()? * i128::from(self.step);
            usize::try_from(at).ok()
        })
    }
}

/// A slice bound: `None` or an index. Integers too large for `i64` saturate.
fn bound(value: Value, heap: &Heap<impl ResourceTracker>) -> RunResult<Option<i64>> {
    match value {
        Value::None => Ok(None),
        Value::Ref(id) => match heap.get(id) {
            HeapData::LongInt(big) => Ok(Some(if big.is_negative() { i64::MIN } else { i64::MAX })),
            _ => Err(not_an_index()),
        },
        other => other.as_index().map(Some).ok_or_else(not_an_index),
    }
}

fn not_an_index() -> crate::exception::RunError {
    ExcType::type_error("slice indices must be integers or None or have an __index__ method")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn resolve(start: Value, stop: Value, step: Value, len: usize) -> Vec<usize> {
        let heap = Heap::new(NoLimitTracker);
        Slice { start, stop, step }.indices(len, &heap).unwrap().positions().collect()
    }

    #[test]
    fn forward_bounds_clamp() {
        assert_eq!(resolve(Value::Int(1), Value::Int(3), Value::None, 5), vec![1, 2]);
        assert_eq!(resolve(Value::Int(-2), Value::None, Value::None, 5), vec![3, 4]);
        assert_eq!(resolve(Value::None, Value::Int(99), Value::Int(2), 5), vec![0, 2, 4]);
        assert_eq!(resolve(Value::Int(4), Value::Int(1), Value::None, 5), Vec::<usize>::new());
    }

    #[test]
    fn negative_steps_walk_backwards() {
        assert_eq!(resolve(Value::None, Value::None, Value::Int(-1), 4), vec![3, 2, 1, 0]);
        assert_eq!(resolve(Value::Int(-1), Value::Int(0), Value::Int(-2), 5), vec![4, 2]);
        assert_eq!(resolve(Value::Int(10), Value::None, Value::Int(-3), 5), vec![4, 1]);
    }

    #[test]
    fn zero_step_is_rejected() {
        let heap = Heap::new(NoLimitTracker);
        let slice = Slice {
            start: Value::None,
            stop: Value::None,
            step: Value::Int(0),
        };
        assert!(slice.indices(3, &heap).is_err());
    }
}
