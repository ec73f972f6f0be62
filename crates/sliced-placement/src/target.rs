//! Target ring builders.
//!
//! Each builder takes the current ring and returns the ring a rebalance
//! should converge to. The planner then diffs current against target.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use sliced_core::{SliceNum, Slot};
use sliced_state::{SlotRange, SlotRing, TxError, TxResult};

/// Contiguous even split over `slices` in ascending order, ignoring the
/// current layout. Moves many slots; prefer [`spread`] for live rings.
pub fn balanced(size: u32, slices: &BTreeSet<SliceNum>) -> TxResult<SlotRing> {
    let k = slices.len() as u32;
    if k == 0 || k > size {
        return Err(TxError::InvalidCommand(format!(
            "cannot balance {size} slots over {k} slices"
        )));
    }
    let share = size / k;
    let ranges = slices.iter().enumerate().map(|(i, &slice)| {
        let low = i as u32 * share;
        let high = if i as u32 + 1 == k { size } else { low + share };
        SlotRange::new(slice, low, high)
    });
    SlotRing::from_ranges(size, ranges)
}

/// Fair share of the ring for each of `slices`, moving only excess slots.
///
/// Slices outside `slices` give up everything. Over-quota slices give up
/// their highest slots first; under-quota slices fill up from the lowest
/// released slots.
pub fn spread(current: &SlotRing, slices: &BTreeSet<SliceNum>) -> TxResult<SlotRing> {
    let quota = quotas(current.size(), slices)?;

    let mut pool: Vec<(Slot, Slot)> = Vec::new();
    for owner in current.slices() {
        let want = quota.get(&owner).copied().unwrap_or(0);
        let mut excess = current.slot_count(owner).saturating_sub(want);
        for r in current.owned_by(owner).iter().rev() {
            if excess == 0 {
                break;
            }
            let take = excess.min(r.len());
            pool.push((r.high - take, r.high));
            excess -= take;
        }
    }
    pool.sort_unstable();
    let mut pool = VecDeque::from(pool);

    let mut next = current.clone();
    for (&slice, &want) in &quota {
        let mut need = want.saturating_sub(current.slot_count(slice));
        while need > 0 {
            let Some((low, high)) = pool.pop_front() else {
                break;
            };
            let take = need.min(high - low);
            next.assign(low, low + take, slice)?;
            if low + take < high {
                pool.push_front((low + take, high));
            }
            need -= take;
        }
    }
    debug!(slices = slices.len(), "spread target computed");
    Ok(next)
}

/// Hand `slice`'s highest slots to `into` until `into` holds half of
/// their combined share. A ring that is already split comes back as is.
pub fn split(current: &SlotRing, slice: SliceNum, into: SliceNum) -> TxResult<SlotRing> {
    if slice == into {
        return Err(TxError::InvalidCommand(format!("cannot split slice {slice} into itself")));
    }
    let (have, given) = (current.slot_count(slice), current.slot_count(into));
    if have + given < 2 {
        return Err(TxError::InvalidCommand(format!(
            "slice {slice} owns {have} slots, too few to split"
        )));
    }
    let mut remaining = ((have + given) / 2).saturating_sub(given);
    let mut next = current.clone();
    for r in current.owned_by(slice).iter().rev() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(r.len());
        next.assign(r.high - take, r.high, into)?;
        remaining -= take;
    }
    Ok(next)
}

/// Move every slot of `slice` to `into`.
pub fn merge(current: &SlotRing, slice: SliceNum, into: SliceNum) -> TxResult<SlotRing> {
    if slice == into {
        return Err(TxError::InvalidCommand(format!("cannot merge slice {slice} into itself")));
    }
    let mut next = current.clone();
    for r in current.owned_by(slice) {
        next.assign(r.low, r.high, into)?;
    }
    Ok(next)
}

/// `size / k` per slice; the first `size % k` slices get one extra.
fn quotas(size: u32, slices: &BTreeSet<SliceNum>) -> TxResult<BTreeMap<SliceNum, u32>> {
    let k = slices.len() as u32;
    if k == 0 || k > size {
        return Err(TxError::InvalidCommand(format!(
            "cannot spread {size} slots over {k} slices"
        )));
    }
    let (base, extra) = (size / k, size % k);
    Ok(slices
        .iter()
        .enumerate()
        .map(|(i, &slice)| (slice, base + u32::from((i as u32) < extra)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(slices: &[SliceNum]) -> BTreeSet<SliceNum> {
        slices.iter().copied().collect()
    }

    fn ab() -> SlotRing {
        SlotRing::balanced(100, 2)
    }

    #[test]
    fn balanced_uses_given_slice_numbers() {
        let ring = balanced(100, &set(&[3, 7])).unwrap();
        assert_eq!(
            ring.ranges(),
            &[SlotRange::new(3, 0, 50), SlotRange::new(7, 50, 100)]
        );
        assert!(balanced(100, &set(&[])).is_err());
    }

    #[test]
    fn spread_moves_only_excess() {
        let target = spread(&ab(), &set(&[0, 1, 2])).unwrap();
        target.validate().unwrap();
        assert_eq!(target.slot_count(0), 34);
        assert_eq!(target.slot_count(1), 33);
        assert_eq!(target.slot_count(2), 33);
        assert_eq!(ab().moved(&target).unwrap(), 33);
        // The new slice takes the top of each over-quota slice.
        assert_eq!(
            target.owned_by(2),
            vec![SlotRange::new(2, 34, 50), SlotRange::new(2, 83, 100)]
        );
    }

    #[test]
    fn spread_of_balanced_ring_is_identity() {
        let ring = SlotRing::balanced(16384, 4);
        assert_eq!(spread(&ring, &set(&[0, 1, 2, 3])).unwrap(), ring);
    }

    #[test]
    fn spread_drains_excluded_slices() {
        let ring = SlotRing::balanced(90, 3);
        let target = spread(&ring, &set(&[0, 1])).unwrap();
        assert_eq!(target.slot_count(2), 0);
        assert_eq!(target.slot_count(0), 45);
        assert_eq!(target.slot_count(1), 45);
    }

    #[test]
    fn split_moves_upper_half() {
        let target = split(&ab(), 0, 2).unwrap();
        assert_eq!(target.owned_by(0), vec![SlotRange::new(0, 0, 25)]);
        assert_eq!(target.owned_by(2), vec![SlotRange::new(2, 25, 50)]);
        assert!(split(&ab(), 0, 0).is_err());
        assert!(split(&SlotRing::single(1, 0), 0, 1).is_err());
    }

    #[test]
    fn split_converges() {
        let once = split(&ab(), 0, 2).unwrap();
        assert_eq!(split(&once, 0, 2).unwrap(), once);

        // A partial split only tops up the difference.
        let partial = SlotRing::from_ranges(
            100,
            [
                SlotRange::new(0, 0, 40),
                SlotRange::new(2, 40, 50),
                SlotRange::new(1, 50, 100),
            ],
        )
        .unwrap();
        let target = split(&partial, 0, 2).unwrap();
        assert_eq!(target.slot_count(0), 25);
        assert_eq!(target.owned_by(2), vec![SlotRange::new(2, 25, 50)]);
    }

    #[test]
    fn merge_hands_over_everything() {
        let target = merge(&ab(), 1, 0).unwrap();
        assert_eq!(target, SlotRing::single(100, 0));
    }
}
