// space.rs — Half-open integer ranges and their Cartesian products
//
// `Range` is a half-open interval [begin, end); `Space` is an ordered vector
// of ranges describing a multi-dimensional sub-array region. These are the
// index primitives underneath the dataflow resolver, the space divisions and
// the buffer passes.
//
// The union of two ranges (or spaces) is the *bounding* union: if the
// operands do not touch, the gap between them is covered as well. Subtraction
// on spaces is defined only when the complement factors along a single
// dimension; any other shape leaves the minuend unchanged.

use std::fmt;

// ── Range ───────────────────────────────────────────────────────────────────

/// A continuous range of integers, stored as half-open [begin, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    begin: i64,
    end: i64,
}

impl Range {
    /// Range covering `first..=last`. Can never be empty.
    pub fn first_last(first: i64, last: i64) -> Range {
        assert!(first <= last);
        Range {
            begin: first,
            end: last + 1,
        }
    }

    /// Range covering `begin..end`.
    pub fn begin_end(begin: i64, end: i64) -> Range {
        assert!(begin <= end);
        Range { begin, end }
    }

    /// Range of `count` elements starting at `begin`.
    pub fn begin_count(begin: i64, count: i64) -> Range {
        assert!(count >= 0);
        Range {
            begin,
            end: begin + count,
        }
    }

    /// The empty range at origin 0.
    pub fn empty() -> Range {
        Range { begin: 0, end: 0 }
    }

    pub fn begin(&self) -> i64 {
        self.begin
    }

    pub fn first(&self) -> i64 {
        self.begin
    }

    /// One past the last element.
    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn last(&self) -> i64 {
        self.end - 1
    }

    pub fn size(&self) -> i64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// True if this range and `r` share at least one integer.
    pub fn overlaps(&self, r: &Range) -> bool {
        self.begin < r.end && self.end > r.begin
    }

    /// True if every integer of `r` lies in this range.
    pub fn contains(&self, r: &Range) -> bool {
        self.begin <= r.begin && self.end >= r.end
    }

    /// Bounding union: extends this range to the smallest interval covering
    /// both. An empty operand is the identity.
    pub fn union_assign(&mut self, r: &Range) {
        if self.is_empty() {
            *self = *r;
        } else if !r.is_empty() {
            self.begin = self.begin.min(r.begin);
            self.end = self.end.max(r.end);
        }
    }

    /// Intersection; the result may be empty (begin clamped so that
    /// begin <= end still holds).
    pub fn intersect_assign(&mut self, r: &Range) {
        self.begin = self.begin.max(r.begin);
        self.end = self.begin.max(self.end.min(r.end));
    }

    pub fn intersection(mut self, r: &Range) -> Range {
        self.intersect_assign(r);
        self
    }

    /// Removes the intersection with `r`, but only where it touches a border:
    /// an `r` strictly inside this range leaves it unchanged (the result must
    /// remain a single interval).
    pub fn remove(&mut self, r: &Range) {
        if r.begin <= self.begin {
            self.begin = self.begin.max(self.end.min(r.end));
        } else if r.end >= self.end {
            self.end = self.end.min(self.begin.max(r.begin));
        }
    }

    /// Shifts begin and end by `offset`.
    pub fn displace(&mut self, offset: i64) {
        self.begin += offset;
        self.end += offset;
    }

    pub fn displaced(mut self, offset: i64) -> Range {
        self.displace(offset);
        self
    }
}

impl Default for Range {
    fn default() -> Self {
        Range::empty()
    }
}

/// Removes all elements of `sub` from `from`; the resulting set needs 0, 1 or
/// 2 intervals, written to `out`. Returns how many were written.
pub fn range_subtract(from: &Range, sub: &Range, out: &mut [Range; 2]) -> usize {
    if from.begin < sub.begin {
        if from.end > sub.end {
            out[0] = Range::begin_end(from.begin, sub.begin);
            out[1] = Range::begin_end(sub.end, from.end);
            return 2;
        }
        if from.end <= sub.begin {
            out[0] = *from;
        } else {
            out[0] = Range::begin_end(from.begin, sub.begin);
        }
        1
    } else {
        if from.end <= sub.end {
            return 0;
        }
        if from.begin >= sub.end {
            out[0] = *from;
        } else {
            out[0] = Range::begin_end(sub.end, from.end);
        }
        1
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size() {
            0 => write!(f, "--"),
            1 => write!(f, "{}", self.first()),
            _ => write!(f, "{}..{}", self.first(), self.last()),
        }
    }
}

// ── Space ───────────────────────────────────────────────────────────────────

/// A vector of ranges for multiple dimensions, e.g. the extent of a
/// multi-dimensional sub-array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Space {
    ranges: Vec<Range>,
}

impl Space {
    pub fn new() -> Space {
        Space { ranges: Vec::new() }
    }

    /// Given dimensions d, constructs the space { [0, d0), [0, d1), ... }.
    pub fn from_dimensions(dimensions: &[i64]) -> Space {
        Space {
            ranges: dimensions
                .iter()
                .map(|&d| Range::begin_count(0, d))
                .collect(),
        }
    }

    pub fn from_ranges(ranges: Vec<Range>) -> Space {
        Space { ranges }
    }

    pub fn push(&mut self, r: Range) {
        self.ranges.push(r);
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn ranges_mut(&mut self) -> &mut Vec<Range> {
        &mut self.ranges
    }

    pub fn dimensionality(&self) -> usize {
        self.ranges.len()
    }

    /// True if `other` overlaps this space on every dimension.
    pub fn overlaps(&self, other: &Space) -> bool {
        debug_assert_eq!(self.ranges.len(), other.ranges.len());
        self.ranges
            .iter()
            .zip(&other.ranges)
            .all(|(a, b)| a.overlaps(b))
    }

    /// True if `other` is contained in this space on every dimension.
    pub fn contains(&self, other: &Space) -> bool {
        debug_assert_eq!(self.ranges.len(), other.ranges.len());
        self.ranges
            .iter()
            .zip(&other.ranges)
            .all(|(a, b)| a.contains(b))
    }

    /// True if the space contains no point (any dimension empty).
    pub fn is_empty(&self) -> bool {
        self.ranges.iter().any(|r| r.is_empty())
    }

    /// Product of the sizes of all dimensions.
    pub fn volume(&self) -> i64 {
        self.ranges.iter().fold(1, |v, r| v * r.size())
    }

    /// Shrinks every dimension to zero size while keeping its origin.
    pub fn clear(&mut self) {
        for r in &mut self.ranges {
            *r = Range::begin_count(r.begin(), 0);
        }
    }

    /// Element-wise intersection; if any dimension becomes empty the whole
    /// space is cleared (it then reports empty while keeping its origin).
    pub fn intersect_assign(&mut self, s: &Space) {
        debug_assert_eq!(self.ranges.len(), s.ranges.len());
        let mut any_empty = false;
        for (a, b) in self.ranges.iter_mut().zip(&s.ranges) {
            a.intersect_assign(b);
            any_empty |= a.is_empty();
        }
        if any_empty {
            self.clear();
        }
    }

    pub fn intersection(&self, s: &Space) -> Space {
        let mut ret = self.clone();
        ret.intersect_assign(s);
        ret
    }

    /// Element-wise bounding union.
    pub fn union_assign(&mut self, s: &Space) {
        debug_assert_eq!(self.ranges.len(), s.ranges.len());
        for (a, b) in self.ranges.iter_mut().zip(&s.ranges) {
            a.union_assign(b);
        }
    }

    /// Removes the intersection with `s` — but only if the complement factors
    /// along a single dimension (i.e. `s` contains this space on every
    /// dimension but at most one). Any other shape leaves the space
    /// unchanged; this is the exact contract the consumers rely on.
    pub fn subtract(&mut self, s: &Space) {
        debug_assert_eq!(self.ranges.len(), s.ranges.len());
        let mut odd = None;
        for (i, (a, b)) in self.ranges.iter().zip(&s.ranges).enumerate() {
            if !b.contains(a) {
                if odd.is_some() {
                    return; // complement does not factor into one dimension
                }
                odd = Some(i);
            }
        }
        if let Some(i) = odd {
            let sub = s.ranges[i];
            self.ranges[i].remove(&sub);
        }
    }

    /// Shifts the space by the displacement vector.
    pub fn displace(&mut self, displacement: &[i64]) {
        debug_assert_eq!(self.ranges.len(), displacement.len());
        for (r, &d) in self.ranges.iter_mut().zip(displacement) {
            r.displace(d);
        }
    }

    /// Shifts the space against the displacement vector.
    pub fn displace_neg(&mut self, displacement: &[i64]) {
        debug_assert_eq!(self.ranges.len(), displacement.len());
        for (r, &d) in self.ranges.iter_mut().zip(displacement) {
            r.displace(-d);
        }
    }

    /// Per-dimension begins.
    pub fn origin(&self) -> Vec<i64> {
        self.ranges.iter().map(|r| r.begin()).collect()
    }

    /// Per-dimension sizes.
    pub fn dimensions(&self) -> Vec<i64> {
        self.ranges.iter().map(|r| r.size()).collect()
    }

    /// Per-dimension sizes with size-1 dimensions collapsed away. Used for
    /// broadcast-style shape compatibility checks.
    pub fn effective_dimensions(&self) -> Vec<i64> {
        self.ranges
            .iter()
            .map(|r| r.size())
            .filter(|&s| s > 1)
            .collect()
    }
}

impl std::ops::Index<usize> for Space {
    type Output = Range;
    fn index(&self, i: usize) -> &Range {
        &self.ranges[i]
    }
}

impl std::ops::IndexMut<usize> for Space {
    fn index_mut(&mut self, i: usize) -> &mut Range {
        &mut self.ranges[i]
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "( )");
        }
        write!(f, "( {}", self.ranges[0])?;
        for r in &self.ranges[1..] {
            write!(f, ", {}", r)?;
        }
        write!(f, " )")
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rg(begin: i64, end: i64) -> Range {
        Range::begin_end(begin, end)
    }

    #[test]
    fn range_constructors_agree() {
        assert_eq!(Range::first_last(2, 5), rg(2, 6));
        assert_eq!(Range::begin_count(2, 4), rg(2, 6));
        assert!(Range::empty().is_empty());
        assert_eq!(Range::begin_count(3, 0).size(), 0);
    }

    #[test]
    fn range_overlap_and_containment() {
        assert!(rg(0, 4).overlaps(&rg(3, 8)));
        assert!(!rg(0, 4).overlaps(&rg(4, 8)));
        assert!(rg(0, 8).contains(&rg(3, 5)));
        assert!(!rg(0, 8).contains(&rg(3, 9)));
        let r = rg(1, 5);
        assert!(r.contains(&r));
    }

    #[test]
    fn range_union_is_bounding() {
        let mut r = rg(0, 2);
        r.union_assign(&rg(5, 7));
        assert_eq!(r, rg(0, 7), "disjoint union covers the gap");

        let mut r = Range::empty();
        r.union_assign(&rg(3, 5));
        assert_eq!(r, rg(3, 5), "empty is the identity");
    }

    #[test]
    fn range_intersection_clamps() {
        let mut r = rg(0, 4);
        r.intersect_assign(&rg(6, 9));
        assert!(r.is_empty());
        let mut r = rg(0, 8);
        r.intersect_assign(&rg(3, 5));
        assert_eq!(r, rg(3, 5));
    }

    #[test]
    fn range_remove_trims_borders_only() {
        let mut r = rg(0, 8);
        r.remove(&rg(0, 3));
        assert_eq!(r, rg(3, 8));
        let mut r = rg(0, 8);
        r.remove(&rg(5, 10));
        assert_eq!(r, rg(0, 5));
        let mut r = rg(0, 8);
        r.remove(&rg(3, 5)); // hole in the middle: no change
        assert_eq!(r, rg(0, 8));
    }

    #[test]
    fn subtract_yields_0_1_or_2_fragments() {
        let mut out = [Range::empty(); 2];

        assert_eq!(range_subtract(&rg(2, 5), &rg(0, 8), &mut out), 0);

        assert_eq!(range_subtract(&rg(0, 8), &rg(3, 5), &mut out), 2);
        assert_eq!(out[0], rg(0, 3));
        assert_eq!(out[1], rg(5, 8));

        assert_eq!(range_subtract(&rg(0, 8), &rg(4, 10), &mut out), 1);
        assert_eq!(out[0], rg(0, 4));

        assert_eq!(range_subtract(&rg(4, 8), &rg(0, 2), &mut out), 1);
        assert_eq!(out[0], rg(4, 8), "disjoint subtrahend leaves from intact");
    }

    #[test]
    fn space_from_dimensions() {
        let s = Space::from_dimensions(&[4, 1, 3]);
        assert_eq!(s.dimensionality(), 3);
        assert_eq!(s.volume(), 12);
        assert_eq!(s.origin(), vec![0, 0, 0]);
        assert_eq!(s.dimensions(), vec![4, 1, 3]);
        assert_eq!(s.effective_dimensions(), vec![4, 3]);
    }

    #[test]
    fn space_intersection_collapses_on_empty() {
        let mut s = Space::from_ranges(vec![rg(0, 4), rg(2, 6)]);
        let t = Space::from_ranges(vec![rg(1, 3), rg(8, 9)]);
        s.intersect_assign(&t);
        assert!(s.is_empty());
        // origin of the collapsed space is preserved
        assert_eq!(s[0].begin(), 1);
    }

    #[test]
    fn space_subtract_single_dimension_contract() {
        // complement factors into dimension 1: subtract applies there
        let mut s = Space::from_ranges(vec![rg(0, 4), rg(0, 8)]);
        let t = Space::from_ranges(vec![rg(0, 4), rg(4, 8)]);
        s.subtract(&t);
        assert_eq!(s, Space::from_ranges(vec![rg(0, 4), rg(0, 4)]));

        // complement spans two dimensions: no change
        let mut s = Space::from_ranges(vec![rg(0, 4), rg(0, 8)]);
        let t = Space::from_ranges(vec![rg(2, 4), rg(4, 8)]);
        let before = s.clone();
        s.subtract(&t);
        assert_eq!(s, before);
    }

    #[test]
    fn space_displace_roundtrip() {
        let mut s = Space::from_ranges(vec![rg(1, 4), rg(2, 6)]);
        let orig = s.clone();
        s.displace(&[3, -1]);
        assert_eq!(s.origin(), vec![4, 1]);
        s.displace_neg(&[3, -1]);
        assert_eq!(s, orig);
    }

    #[test]
    fn space_display() {
        let s = Space::from_ranges(vec![rg(0, 4), rg(3, 4), Range::empty()]);
        assert_eq!(format!("{s}"), "( 0..3, 3, -- )");
        assert_eq!(format!("{}", Space::new()), "( )");
    }
}
