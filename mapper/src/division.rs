// division.rs — Labeled partitions of a bounding space
//
// A `SpaceDivision` keeps track of which assignment currently owns which
// sub-region of a bounding space: the stored sub-spaces are pairwise disjoint
// and contained in the bound. Assigning a section carves the overlap out of
// every older entry, splitting it along each dimension the new section
// intersects but does not cover. Adjacent entries with equal labels are not
// merged back.
//
// `SpaceMultiDiv` is the variant whose labels are *sets* of values: a newly
// assigned section joins the label sets of everything it overlaps and fills
// the uncovered remainder with a singleton set.

use std::collections::BTreeSet;
use std::fmt;

use crate::space::{range_subtract, Range, Space};

// ── SpaceDivision ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SpaceDivision<A> {
    full_space: Space,
    sections: Vec<(A, Space)>,
}

impl<A: Clone + Eq> SpaceDivision<A> {
    pub fn new(full_space: Space) -> Self {
        SpaceDivision {
            full_space,
            sections: Vec::new(),
        }
    }

    pub fn full_space(&self) -> &Space {
        &self.full_space
    }

    /// The stored (label, sub-space) entries. Disjoint, in no particular
    /// geometric order.
    pub fn sections(&self) -> &[(A, Space)] {
        &self.sections
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn clear(&mut self) {
        self.sections.clear();
    }

    /// Indices of all entries overlapping `s`.
    pub fn find_overlaps(&self, s: &Space) -> Vec<usize> {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, (_, space))| space.overlaps(s))
            .map(|(i, _)| i)
            .collect()
    }

    /// Assigns all elements of `sec ∩ bound` the label `assign`, trimming or
    /// eliminating previous assignments in that region. `sec` may exceed the
    /// bounding space.
    pub fn assign_section(&mut self, mut sec: Space, assign: A) {
        sec.intersect_assign(&self.full_space);
        if sec.is_empty() {
            return;
        }

        for idx in self.find_overlaps(&sec).into_iter().rev() {
            self.trim_section(idx, &sec);
        }
        self.sections.push((assign, sec));
    }

    /// Removes all entries labeled `unassign`.
    pub fn unassign(&mut self, unassign: &A) {
        self.sections.retain(|(a, _)| a != unassign);
    }

    /// A new division bounded by `subspace` containing the non-empty
    /// intersections of all entries with it.
    pub fn sub_division(&self, subspace: &Space) -> SpaceDivision<A> {
        debug_assert_eq!(subspace.dimensionality(), self.full_space.dimensionality());
        let mut ret = SpaceDivision::new(subspace.clone());
        for (a, space) in &self.sections {
            let s = space.intersection(subspace);
            if !s.is_empty() {
                ret.sections.push((a.clone(), s));
            }
        }
        ret
    }

    /// Bounding union of all sub-spaces labeled `find`; a zero-size space at
    /// the bound's origin if there are none.
    pub fn envelope(&self, find: &A) -> Space {
        let mut it = self.sections.iter().filter(|(a, _)| a == find);
        match it.next() {
            None => {
                let mut ret = self.full_space.clone();
                ret.clear();
                ret
            }
            Some((_, first)) => {
                let mut ret = first.clone();
                for (_, space) in it {
                    ret.union_assign(space);
                }
                ret
            }
        }
    }

    /// Removes all elements of `remove` from the entry at `idx`, splitting it
    /// into up to two fragments per dimension. The fragments are appended; the
    /// original entry is deleted.
    fn trim_section(&mut self, idx: usize, remove: &Space) {
        let (assign, mut trim) = self.sections.remove(idx);

        let mut diff = [Range::empty(); 2];
        for i in 0..trim.dimensionality() {
            let intersec = trim[i].intersection(&remove[i]);
            let ndiff = range_subtract(&trim[i], &remove[i], &mut diff);
            for d in &diff[..ndiff] {
                trim[i] = *d;
                self.sections.push((assign.clone(), trim.clone()));
            }
            trim[i] = intersec;
        }
    }
}

impl<A: Clone + Eq + fmt::Display> fmt::Display for SpaceDivision<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Space division for space {}:", self.full_space)?;
        for (a, space) in &self.sections {
            writeln!(f, "\t{}\tto\t{}", a, space)?;
        }
        Ok(())
    }
}

// ── SpaceMultiDiv ───────────────────────────────────────────────────────────

/// Like `SpaceDivision`, but sections can be assigned to multiple labels.
#[derive(Debug, Clone)]
pub struct SpaceMultiDiv<A: Ord> {
    inner: SpaceDivision<BTreeSet<A>>,
}

impl<A: Clone + Ord> SpaceMultiDiv<A> {
    pub fn new(full_space: Space) -> Self {
        SpaceMultiDiv {
            inner: SpaceDivision::new(full_space),
        }
    }

    pub fn full_space(&self) -> &Space {
        self.inner.full_space()
    }

    pub fn sections(&self) -> &[(BTreeSet<A>, Space)] {
        self.inner.sections()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Merges `assign` into the label sets of every entry overlapping
    /// `sec ∩ bound` (splitting entries where the overlap is partial) and
    /// fills the uncovered remainder with the singleton `{assign}`.
    pub fn assign_section(&mut self, mut sec: Space, assign: A) {
        sec.intersect_assign(self.inner.full_space());
        if sec.is_empty() {
            return;
        }

        // Track which parts of sec are not yet covered by any entry.
        let mut uncovered = SpaceDivision::new(self.inner.full_space().clone());
        uncovered.assign_section(sec.clone(), true);

        for idx in self.inner.find_overlaps(&sec).into_iter().rev() {
            let (labels, space) = self.inner.sections[idx].clone();
            uncovered.assign_section(space.clone(), false);
            uncovered.unassign(&false);

            if !labels.contains(&assign) {
                self.inner.trim_section(idx, &sec);
                let mut joined = labels;
                joined.insert(assign.clone());
                self.inner.sections.push((joined, space.intersection(&sec)));
            }
        }

        for (_, space) in uncovered.sections() {
            let mut single = BTreeSet::new();
            single.insert(assign.clone());
            self.inner.sections.push((single, space.clone()));
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(ranges: &[(i64, i64)]) -> Space {
        Space::from_ranges(ranges.iter().map(|&(b, e)| Range::begin_end(b, e)).collect())
    }

    fn total_volume<A: Clone + Eq>(sd: &SpaceDivision<A>) -> i64 {
        sd.sections().iter().map(|(_, s)| s.volume()).sum()
    }

    fn pairwise_disjoint<A: Clone + Eq>(sd: &SpaceDivision<A>) -> bool {
        let secs = sd.sections();
        for i in 0..secs.len() {
            for j in i + 1..secs.len() {
                if secs[i].1.overlaps(&secs[j].1) {
                    return false;
                }
            }
        }
        true
    }

    #[test]
    fn assign_covers_and_stays_disjoint() {
        let mut sd = SpaceDivision::new(sp(&[(0, 10)]));
        sd.assign_section(sp(&[(0, 10)]), 'a');
        sd.assign_section(sp(&[(3, 7)]), 'b');

        assert!(pairwise_disjoint(&sd));
        assert_eq!(total_volume(&sd), 10);
        assert_eq!(sd.envelope(&'b'), sp(&[(3, 7)]));
        // 'a' got split into [0,3) and [7,10); envelope is the bounding union
        assert_eq!(sd.envelope(&'a'), sp(&[(0, 10)]));
    }

    #[test]
    fn assign_clips_to_bound() {
        let mut sd = SpaceDivision::new(sp(&[(0, 8)]));
        sd.assign_section(sp(&[(5, 20)]), 'x');
        assert_eq!(sd.envelope(&'x'), sp(&[(5, 8)]));

        sd.assign_section(sp(&[(20, 30)]), 'y');
        assert!(sd.envelope(&'y').is_empty());
    }

    #[test]
    fn two_dimensional_split() {
        let mut sd = SpaceDivision::new(sp(&[(0, 4), (0, 4)]));
        sd.assign_section(sp(&[(0, 4), (0, 4)]), 0);
        sd.assign_section(sp(&[(1, 3), (1, 3)]), 1);

        assert!(pairwise_disjoint(&sd));
        assert_eq!(total_volume(&sd), 16);
        // carving the middle out of a 4x4 square leaves 4 fragments of label 0
        let zeros: Vec<_> = sd.sections().iter().filter(|(a, _)| *a == 0).collect();
        assert_eq!(zeros.len(), 4);
        assert_eq!(zeros.iter().map(|(_, s)| s.volume()).sum::<i64>(), 12);
    }

    #[test]
    fn unassign_removes_all_entries() {
        let mut sd = SpaceDivision::new(sp(&[(0, 10)]));
        sd.assign_section(sp(&[(0, 3)]), 'a');
        sd.assign_section(sp(&[(5, 8)]), 'a');
        sd.assign_section(sp(&[(3, 5)]), 'b');
        sd.unassign(&'a');
        assert_eq!(sd.section_count(), 1);
        assert!(sd.envelope(&'a').is_empty());
    }

    #[test]
    fn sub_division_intersects_entries() {
        let mut sd = SpaceDivision::new(sp(&[(0, 10)]));
        sd.assign_section(sp(&[(0, 4)]), 'a');
        sd.assign_section(sp(&[(4, 10)]), 'b');

        let sub = sd.sub_division(&sp(&[(2, 6)]));
        assert_eq!(sub.full_space(), &sp(&[(2, 6)]));
        assert_eq!(sub.envelope(&'a'), sp(&[(2, 4)]));
        assert_eq!(sub.envelope(&'b'), sp(&[(4, 6)]));
        assert_eq!(total_volume(&sub), 4);
    }

    #[test]
    fn find_overlaps_reports_touching_entries() {
        let mut sd = SpaceDivision::new(sp(&[(0, 10)]));
        sd.assign_section(sp(&[(0, 3)]), 'a');
        sd.assign_section(sp(&[(3, 6)]), 'b');
        sd.assign_section(sp(&[(6, 10)]), 'c');
        let hits = sd.find_overlaps(&sp(&[(2, 4)]));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn multidiv_joins_label_sets() {
        let mut md = SpaceMultiDiv::new(sp(&[(0, 8)]));
        md.assign_section(sp(&[(0, 6)]), 'a');
        md.assign_section(sp(&[(4, 8)]), 'b');

        let mut volumes = std::collections::BTreeMap::new();
        for (labels, space) in md.sections() {
            let key: Vec<char> = labels.iter().copied().collect();
            *volumes.entry(key).or_insert(0) += space.volume();
        }
        assert_eq!(volumes.get(&vec!['a']), Some(&4)); // [0,4)
        assert_eq!(volumes.get(&vec!['a', 'b']), Some(&2)); // [4,6)
        assert_eq!(volumes.get(&vec!['b']), Some(&2)); // [6,8)
    }

    #[test]
    fn multidiv_reassign_same_label_is_stable() {
        let mut md = SpaceMultiDiv::new(sp(&[(0, 4)]));
        md.assign_section(sp(&[(0, 4)]), 'a');
        md.assign_section(sp(&[(0, 4)]), 'a');
        let volume: i64 = md.sections().iter().map(|(_, s)| s.volume()).sum();
        assert_eq!(volume, 4);
        assert!(md.sections().iter().all(|(l, _)| l.len() == 1));
    }
}
