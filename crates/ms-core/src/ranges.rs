//! Ordered sets of disjoint half-open time ranges.

use std::fmt;

/// A sorted list of non-overlapping `[start, end)` ranges.
///
/// Adding a range that overlaps or touches existing ranges coalesces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranges<T> {
    ranges: Vec<(T, T)>,
}

impl<T> Default for Ranges<T> {
    fn default() -> Self {
        Self { ranges: Vec::new() }
    }
}

impl<T: Copy + Ord> Ranges<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[start, end)`, merging with any ranges it overlaps or touches.
    /// Empty ranges are ignored.
    pub fn add(&mut self, start: T, end: T) {
        if start >= end {
            return;
        }
        let mut new_start = start;
        let mut new_end = end;
        let mut i = 0;
        while i < self.ranges.len() && self.ranges[i].1 < new_start {
            i += 1;
        }
        let first = i;
        while i < self.ranges.len() && self.ranges[i].0 <= new_end {
            new_start = new_start.min(self.ranges[i].0);
            new_end = new_end.max(self.ranges[i].1);
            i += 1;
        }
        self.ranges.splice(first..i, std::iter::once((new_start, new_end)));
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn start(&self, i: usize) -> T {
        self.ranges[i].0
    }

    pub fn end(&self, i: usize) -> T {
        self.ranges[i].1
    }

    pub fn first(&self) -> Option<(T, T)> {
        self.ranges.first().copied()
    }

    pub fn last(&self) -> Option<(T, T)> {
        self.ranges.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (T, T)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Whether `t` lies in one of the ranges.
    pub fn contains(&self, t: T) -> bool {
        self.ranges.iter().any(|&(s, e)| s <= t && t < e)
    }

    /// The set of times contained in both `self` and `other`.
    pub fn intersection_with(&self, other: &Ranges<T>) -> Ranges<T> {
        let mut result = Ranges::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a_start, a_end) = self.ranges[i];
            let (b_start, b_end) = other.ranges[j];
            let start = a_start.max(b_start);
            let end = a_end.min(b_end);
            if start < end {
                result.ranges.push((start, end));
            }
            if a_end < b_end {
                i += 1;
            } else {
                j += 1;
            }
        }
        result
    }
}

impl<T: Copy + Ord> FromIterator<(T, T)> for Ranges<T> {
    fn from_iter<I: IntoIterator<Item = (T, T)>>(iter: I) -> Self {
        let mut ranges = Ranges::new();
        for (start, end) in iter {
            ranges.add(start, end);
        }
        ranges
    }
}

impl<T: fmt::Display> fmt::Display for Ranges<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (s, e)) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "[{s}, {e})")?;
        }
        f.write_str("}")
    }
}
