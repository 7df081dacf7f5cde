// chart.rs — Resource occupation over time
//
// An `OccupationChart` is a step function time → occupied amount, stored as
// an ordered map from time to the level holding from that time on; the last
// stored level extends to +infinity. `occupy`/`unoccupy` either update every
// sample in the window or leave the chart untouched. The `available` queries
// drive the list scheduler.
//
// `SingleOccupationChart` is the owner-tracking variant used for processors
// and DMA controllers: capacity one, and the "amount" is the occupant itself.

use std::collections::BTreeMap;
use std::ops::Bound;

pub type Time = i64;
pub const TIME_INFINITE: Time = i64::MAX;

// ── OccupationChart ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OccupationChart {
    capacity: i64,
    entries: BTreeMap<Time, i64>,
}

impl OccupationChart {
    pub fn new(capacity: i64) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(0, 0);
        OccupationChart { capacity, entries }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.insert(0, 0);
    }

    /// Occupied amount at time `t`.
    pub fn occupied_at(&self, t: Time) -> i64 {
        assert!(t >= 0);
        *self.entries.range(..=t).next_back().expect("empty chart").1
    }

    fn level_before(&self, t: Time) -> i64 {
        *self.entries.range(..t).next_back().expect("empty chart").1
    }

    /// Raises every sample in [from, to) by `amount` if the capacity holds
    /// throughout; otherwise changes nothing and returns false.
    pub fn occupy(&mut self, from: Time, to: Time, amount: i64) -> bool {
        self.adjust(from, to, amount)
    }

    /// Lowers every sample in [from, to) by `amount` if no sample would drop
    /// below zero; otherwise changes nothing and returns false.
    pub fn unoccupy(&mut self, from: Time, to: Time, amount: i64) -> bool {
        self.adjust(from, to, -amount)
    }

    fn adjust(&mut self, from: Time, to: Time, amount: i64) -> bool {
        assert!(from >= 0 && to > from);

        let start_level = self.occupied_at(from);
        if !self.fits(start_level + amount) {
            return false;
        }
        for (_, &level) in self
            .entries
            .range((Bound::Excluded(from), Bound::Excluded(to)))
        {
            if !self.fits(level + amount) {
                return false;
            }
        }

        // split at the window borders before updating
        let end_level = self.level_before(to);
        self.entries.entry(from).or_insert(start_level);
        if to != TIME_INFINITE {
            self.entries.entry(to).or_insert(end_level);
        }

        let keys: Vec<Time> = self.entries.range(from..to).map(|(&k, _)| k).collect();
        for k in keys {
            *self.entries.get_mut(&k).unwrap() += amount;
        }

        self.coalesce(from);
        self.coalesce(to);
        true
    }

    fn fits(&self, level: i64) -> bool {
        level >= 0 && level <= self.capacity
    }

    fn coalesce(&mut self, key: Time) {
        if key == 0 {
            return; // base entry always stays
        }
        if let Some(&v) = self.entries.get(&key) {
            if let Some((_, &prev)) = self.entries.range(..key).next_back() {
                if prev == v {
                    self.entries.remove(&key);
                }
            }
        }
    }

    /// Smallest t ≥ `from` at which `amount` units are free for at least
    /// `duration` consecutive time; `TIME_INFINITE` if never. A duration of
    /// `TIME_INFINITE` asks for permanent availability.
    pub fn available(&self, from: Time, duration: Time, amount: i64) -> Time {
        let start_key = *self.entries.range(..=from).next_back().expect("empty chart").0;
        let items: Vec<(Time, i64)> = self
            .entries
            .range(start_key..)
            .map(|(&k, &v)| (k, v))
            .collect();

        let mut from = from;
        let mut i = 0;
        loop {
            while i < items.len() && items[i].1 + amount > self.capacity {
                i += 1;
            }
            if i == items.len() {
                return TIME_INFINITE;
            }
            if from < items[i].0 {
                from = items[i].0;
            }
            let to = if duration == TIME_INFINITE {
                TIME_INFINITE
            } else {
                from.saturating_add(duration)
            };

            while i < items.len() && items[i].0 < to && items[i].1 + amount <= self.capacity {
                i += 1;
            }
            if i == items.len() || items[i].0 >= to {
                return from;
            }
            // items[i] violates inside the window; restart the search there
        }
    }

    /// Earliest t such that `amount` units are free throughout [t, `at`);
    /// `at` itself if no such span exists.
    pub fn available_since(&self, at: Time, amount: i64) -> Time {
        let max_occ = self.capacity - amount;
        for (&k, &v) in self.entries.range(..at).rev() {
            if v > max_occ {
                return match self
                    .entries
                    .range((Bound::Excluded(k), Bound::Unbounded))
                    .next()
                {
                    None => at,
                    Some((&nk, _)) => {
                        if nk > at {
                            at
                        } else {
                            nk
                        }
                    }
                };
            }
        }
        let first = *self.entries.keys().next().expect("empty chart");
        if first > at {
            at
        } else {
            first
        }
    }

    /// Largest amount available throughout the entire span [from, to).
    pub fn least_avail(&self, from: Time, to: Time) -> i64 {
        let mut max_level = self.occupied_at(from);
        for (_, &v) in self
            .entries
            .range((Bound::Excluded(from), Bound::Excluded(to)))
        {
            max_level = max_level.max(v);
        }
        self.capacity - max_level
    }
}

// ── SingleOccupationChart ───────────────────────────────────────────────────

/// Occupation chart for a resource that only one occupant can hold at a time.
#[derive(Debug, Clone)]
pub struct SingleOccupationChart<T: Copy + Eq> {
    entries: BTreeMap<Time, Option<T>>,
}

impl<T: Copy + Eq> SingleOccupationChart<T> {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(0, None);
        SingleOccupationChart { entries }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.entries.insert(0, None);
    }

    pub fn occupant_at(&self, t: Time) -> Option<T> {
        assert!(t >= 0);
        *self.entries.range(..=t).next_back().expect("empty chart").1
    }

    fn free_for(slot: Option<T>, owner: T) -> bool {
        match slot {
            None => true,
            Some(o) => o == owner,
        }
    }

    /// Claims [from, to) for `owner`; fails without changes if any sample is
    /// held by a different owner.
    pub fn occupy(&mut self, from: Time, to: Time, owner: T) -> bool {
        assert!(from >= 0 && to > from);

        if !Self::free_for(self.occupant_at(from), owner) {
            return false;
        }
        for (_, &slot) in self
            .entries
            .range((Bound::Excluded(from), Bound::Excluded(to)))
        {
            if !Self::free_for(slot, owner) {
                return false;
            }
        }

        let end_slot = *self.entries.range(..to).next_back().expect("empty chart").1;
        let start_slot = self.occupant_at(from);
        self.entries.entry(from).or_insert(start_slot);
        if to != TIME_INFINITE {
            self.entries.entry(to).or_insert(end_slot);
        }
        let keys: Vec<Time> = self.entries.range(from..to).map(|(&k, _)| k).collect();
        for k in keys {
            self.entries.insert(k, Some(owner));
        }
        true
    }

    /// Releases the samples of [from, to) held by `owner`; fails without
    /// changes if any sample is held by a different owner.
    pub fn unoccupy(&mut self, from: Time, to: Time, owner: T) -> bool {
        assert!(from >= 0 && to > from);
        for (_, &slot) in self.entries.range(..to).filter(|(&k, _)| k >= from) {
            if !Self::free_for(slot, owner) {
                return false;
            }
        }
        if !Self::free_for(self.occupant_at(from), owner) {
            return false;
        }

        let end_slot = *self.entries.range(..to).next_back().expect("empty chart").1;
        let start_slot = self.occupant_at(from);
        self.entries.entry(from).or_insert(start_slot);
        if to != TIME_INFINITE {
            self.entries.entry(to).or_insert(end_slot);
        }
        let keys: Vec<Time> = self.entries.range(from..to).map(|(&k, _)| k).collect();
        for k in keys {
            self.entries.insert(k, None);
        }
        true
    }

    /// Smallest t ≥ `from` at which the resource is free for `owner` for at
    /// least `duration` consecutive time.
    pub fn available(&self, from: Time, duration: Time, owner: T) -> Time {
        let start_key = *self.entries.range(..=from).next_back().expect("empty chart").0;
        let items: Vec<(Time, Option<T>)> = self
            .entries
            .range(start_key..)
            .map(|(&k, &v)| (k, v))
            .collect();

        let mut from = from;
        let mut i = 0;
        loop {
            while i < items.len() && !Self::free_for(items[i].1, owner) {
                i += 1;
            }
            if i == items.len() {
                return TIME_INFINITE;
            }
            if from < items[i].0 {
                from = items[i].0;
            }
            let to = if duration == TIME_INFINITE {
                TIME_INFINITE
            } else {
                from.saturating_add(duration)
            };

            while i < items.len() && items[i].0 < to && Self::free_for(items[i].1, owner) {
                i += 1;
            }
            if i == items.len() || items[i].0 >= to {
                return from;
            }
        }
    }
}

impl<T: Copy + Eq> Default for SingleOccupationChart<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
