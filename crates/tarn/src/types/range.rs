/// A `range` object over `i64` bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    /// Callers must reject a zero step.
    pub fn new(start: i64, stop: i64, step: i64) -> Self {
        debug_assert!(step != 0, "range step must be non-zero");
        Self { start, stop, step }
    }

    pub fn len(&self) -> usize {
        let (lo, hi, step) = if self.step > 0 {
            (i128::from(self.start), i128::from(self.stop), i128::from(self.step))
        } else {
            (i128::from(self.stop), i128::from(self.start), -i128::from(self.step))
        };
        if lo >= hi {
            return 0;
        }
        usize::try_from((hi - lo - 1) / step + 1).unwrap_or(usize::MAX)
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let value = i128::from(self.start) + i128::try_from(index).ok()? * i128::from(self.step);
        i64::try_from(value).ok()
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            self.start <= value && value < self.stop
        } else {
            self.stop < value && value <= self.start
        };
        in_bounds && (i128::from(value) - i128::from(self.start)) % i128::from(self.step) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths() {
        assert_eq!(Range::new(0, 3, 1).len(), 3);
        assert_eq!(Range::new(0, 10, 3).len(), 4);
        assert_eq!(Range::new(5, 0, -2).len(), 3);
        assert_eq!(Range::new(3, 3, 1).len(), 0);
        assert_eq!(Range::new(3, 0, 1).len(), 0);
    }

    #[test]
    fn membership() {
        let r = Range::new(5, 0, -2);
        assert!(r.contains(5));
        assert!(r.contains(1));
        assert!(!r.contains(0));
        assert!(!r.contains(2));
        assert_eq!(r.get(2), Some(1));
        assert_eq!(r.get(3), None);
    }
}
