//! Hash-slot ring: ownership of the slot space `[0, size)` by slices.
//!
//! A ring is stored as an ordered list of half-open [`SlotRange`]s that
//! covers the whole slot space without gaps or overlaps. Adjacent ranges
//! owned by the same slice are always coalesced, so equal ownership has
//! exactly one representation and two rings can be compared with `==`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use sliced_core::{SliceNum, Slot};

use crate::error::{TxError, TxResult};

/// Contiguous ownership interval `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRange {
    pub slice: SliceNum,
    pub low: Slot,
    pub high: Slot,
}

impl SlotRange {
    pub fn new(slice: SliceNum, low: Slot, high: Slot) -> Self {
        Self { slice, low, high }
    }

    pub fn len(&self) -> u32 {
        self.high.saturating_sub(self.low)
    }

    pub fn is_empty(&self) -> bool {
        self.high <= self.low
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.low <= slot && slot < self.high
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} -> {}", self.slice, self.low, self.high)
    }
}

/// Complete slot ownership of one slice, as carried by a ring change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSlots {
    pub slice: SliceNum,
    pub slots: Vec<SlotRange>,
}

impl SliceSlots {
    pub fn new(slice: SliceNum, bounds: &[(Slot, Slot)]) -> Self {
        Self {
            slice,
            slots: bounds
                .iter()
                .map(|&(low, high)| SlotRange::new(slice, low, high))
                .collect(),
        }
    }

    /// Ranges sorted by `low` with adjacent ranges merged.
    fn normalized(&self) -> Vec<SlotRange> {
        let mut slots = self.slots.clone();
        slots.sort_by_key(|r| r.low);
        coalesce(slots)
    }
}

/// Result of applying a ring change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingChange {
    /// The ring already matched the target ownership.
    Unchanged,
    Changed(SlotRing),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRing {
    size: u32,
    ranges: Vec<SlotRange>,
}

impl SlotRing {
    /// A ring entirely owned by `slice`.
    pub fn single(size: u32, slice: SliceNum) -> Self {
        Self {
            size: size.max(1),
            ranges: vec![SlotRange::new(slice, 0, size.max(1))],
        }
    }

    /// Slices `0..n` with an even share each; the last slice takes the
    /// remainder.
    pub fn balanced(size: u32, n: u32) -> Self {
        let size = size.max(1);
        let n = n.clamp(1, size);
        let share = size / n;
        let ranges = (0..n)
            .map(|slice| {
                let low = slice * share;
                let high = if slice + 1 == n { size } else { low + share };
                SlotRange::new(slice, low, high)
            })
            .collect();
        Self { size, ranges }
    }

    /// Build a ring from arbitrary ranges; they must partition `[0, size)`.
    pub fn from_ranges(size: u32, ranges: impl IntoIterator<Item = SlotRange>) -> TxResult<Self> {
        let mut ranges: Vec<SlotRange> = ranges.into_iter().collect();
        for r in &ranges {
            if r.is_empty() || r.high > size {
                return Err(TxError::InvalidRange {
                    low: r.low,
                    high: r.high,
                    size,
                });
            }
        }
        ranges.sort_by_key(|r| r.low);
        let ring = Self {
            size,
            ranges: coalesce(ranges),
        };
        ring.validate()?;
        Ok(ring)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn ranges(&self) -> &[SlotRange] {
        &self.ranges
    }

    /// Owning slice of `slot`.
    pub fn lookup(&self, slot: Slot) -> Option<SliceNum> {
        if slot >= self.size {
            return None;
        }
        let idx = self.ranges.partition_point(|r| r.high <= slot);
        self.ranges.get(idx).map(|r| r.slice)
    }

    pub fn owned_by(&self, slice: SliceNum) -> Vec<SlotRange> {
        self.ranges
            .iter()
            .filter(|r| r.slice == slice)
            .copied()
            .collect()
    }

    pub fn slot_count(&self, slice: SliceNum) -> u32 {
        self.ranges
            .iter()
            .filter(|r| r.slice == slice)
            .map(SlotRange::len)
            .sum()
    }

    /// Slices that own at least one slot.
    pub fn slices(&self) -> BTreeSet<SliceNum> {
        self.ranges.iter().map(|r| r.slice).collect()
    }

    /// Replace ownership of exactly `[low, high)` with `slice`.
    pub fn assign(&mut self, low: Slot, high: Slot, slice: SliceNum) -> TxResult<()> {
        if low >= high || high > self.size {
            return Err(TxError::InvalidRange {
                low,
                high,
                size: self.size,
            });
        }
        let mut before = Vec::with_capacity(self.ranges.len() + 2);
        let mut after = Vec::new();
        for r in &self.ranges {
            if r.high <= low {
                before.push(*r);
            } else if r.low >= high {
                after.push(*r);
            } else {
                if r.low < low {
                    before.push(SlotRange::new(r.slice, r.low, low));
                }
                if r.high > high {
                    after.push(SlotRange::new(r.slice, high, r.high));
                }
            }
        }
        before.push(SlotRange::new(slice, low, high));
        before.extend(after);
        self.ranges = coalesce(before);
        Ok(())
    }

    /// Check that the ranges partition `[0, size)`.
    pub fn validate(&self) -> TxResult<()> {
        let mut next = 0;
        for r in &self.ranges {
            if r.is_empty() {
                return Err(TxError::RingCoverage(format!("empty range {r}")));
            }
            if r.low < next {
                return Err(TxError::RangeOverlap(format!("{r} starts before {next}")));
            }
            if r.low > next {
                return Err(TxError::RingCoverage(format!(
                    "slots {next}..{} are unowned",
                    r.low
                )));
            }
            next = r.high;
        }
        if next != self.size {
            return Err(TxError::RingCoverage(format!(
                "ring ends at {next}, expected {}",
                self.size
            )));
        }
        Ok(())
    }

    /// Validate the shape of a ring change without looking at live
    /// ownership. Both lists must name the same slices, be internally
    /// disjoint, and cover the same slots.
    pub fn check_change(size: u32, from: &[SliceSlots], to: &[SliceSlots]) -> TxResult<()> {
        let from_slices = listed_slices(from)?;
        let to_slices = listed_slices(to)?;
        if from_slices != to_slices {
            return Err(TxError::RangeOverlap(format!(
                "from lists slices {from_slices:?} but to lists {to_slices:?}"
            )));
        }
        let from_cover = coverage(size, from)?;
        let to_cover = coverage(size, to)?;
        if from_cover != to_cover {
            return Err(TxError::RangeOverlap(
                "from and to cover different slots".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a ring change as one atomic step.
    ///
    /// Replaying a change whose `to` ownership is already live returns
    /// [`RingChange::Unchanged`]. Any listed slice whose live ownership
    /// differs from `from` makes the change stale.
    pub fn apply_change(&self, from: &[SliceSlots], to: &[SliceSlots]) -> TxResult<RingChange> {
        Self::check_change(self.size, from, to)?;

        if to.iter().all(|s| s.normalized() == self.owned_by(s.slice)) {
            return Ok(RingChange::Unchanged);
        }
        for s in from {
            if s.normalized() != self.owned_by(s.slice) {
                return Err(TxError::StaleSnapshot(format!(
                    "slice {} no longer owns the expected slots",
                    s.slice
                )));
            }
        }

        let mut next = self.clone();
        for s in to {
            for r in &s.slots {
                next.assign(r.low, r.high, s.slice)?;
            }
        }
        next.validate()?;
        Ok(RingChange::Changed(next))
    }

    /// Walk the merged boundaries of two rings of the same size,
    /// yielding `(low, high, owner here, owner there)` for every
    /// sub-interval on which neither ring changes owner.
    pub fn overlay(&self, other: &SlotRing) -> TxResult<Vec<(Slot, Slot, SliceNum, SliceNum)>> {
        if self.size != other.size {
            return Err(TxError::InvalidCommand(format!(
                "ring sizes differ: {} vs {}",
                self.size, other.size
            )));
        }
        let (mut i, mut j, mut low) = (0, 0, 0);
        let mut out = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (self.ranges[i], other.ranges[j]);
            let high = a.high.min(b.high);
            out.push((low, high, a.slice, b.slice));
            low = high;
            if a.high == high {
                i += 1;
            }
            if b.high == high {
                j += 1;
            }
        }
        Ok(out)
    }

    /// Number of slots whose owner differs between the two rings.
    pub fn moved(&self, other: &SlotRing) -> TxResult<u32> {
        Ok(self
            .overlay(other)?
            .into_iter()
            .filter(|(_, _, a, b)| a != b)
            .map(|(low, high, _, _)| high - low)
            .sum())
    }

    /// Current ownership of the given slices, in ring-change form.
    pub fn ownership(&self, slices: impl IntoIterator<Item = SliceNum>) -> Vec<SliceSlots> {
        slices
            .into_iter()
            .map(|slice| SliceSlots {
                slice,
                slots: self.owned_by(slice),
            })
            .collect()
    }
}

impl fmt::Display for SlotRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in &self.ranges {
            writeln!(f, "{r}")?;
        }
        Ok(())
    }
}

fn coalesce(ranges: Vec<SlotRange>) -> Vec<SlotRange> {
    let mut out: Vec<SlotRange> = Vec::with_capacity(ranges.len());
    for r in ranges.into_iter().filter(|r| !r.is_empty()) {
        match out.last_mut() {
            Some(prev) if prev.slice == r.slice && prev.high == r.low => prev.high = r.high,
            _ => out.push(r),
        }
    }
    out
}

fn listed_slices(list: &[SliceSlots]) -> TxResult<BTreeSet<SliceNum>> {
    let mut seen = BTreeSet::new();
    for s in list {
        if !seen.insert(s.slice) {
            return Err(TxError::RangeOverlap(format!("slice {} listed twice", s.slice)));
        }
        if let Some(r) = s.slots.iter().find(|r| r.slice != s.slice) {
            return Err(TxError::InvalidCommand(format!(
                "range {r} listed under slice {}",
                s.slice
            )));
        }
    }
    Ok(seen)
}

/// Merged intervals covered by a list, ignoring owners.
fn coverage(size: u32, list: &[SliceSlots]) -> TxResult<Vec<(Slot, Slot)>> {
    let mut all: Vec<SlotRange> = list.iter().flat_map(|s| s.slots.iter().copied()).collect();
    for r in &all {
        if r.is_empty() || r.high > size {
            return Err(TxError::InvalidRange {
                low: r.low,
                high: r.high,
                size,
            });
        }
    }
    all.sort_by_key(|r| r.low);
    let mut out: Vec<(Slot, Slot)> = Vec::new();
    for r in all {
        match out.last_mut() {
            Some((_, high)) if r.low < *high => {
                return Err(TxError::RangeOverlap(format!("{r} overlaps slot {}", r.low)));
            }
            Some((_, high)) if r.low == *high => *high = r.high,
            _ => out.push((r.low, r.high)),
        }
    }
    Ok(out)
}
