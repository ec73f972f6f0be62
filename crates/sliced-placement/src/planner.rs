//! Rebalance planner: partition diff.
//!
//! Walks the merged boundaries of the current and target rings and
//! emits a [`Task`] for every maximal sub-interval whose owner differs.
//! Adjacent sub-intervals with the same `(from, to)` pair are coalesced
//! and tasks come out ordered by ascending `low`, so the plan moves
//! exactly the slots whose owner differs and nothing else.

use std::collections::BTreeSet;

use tracing::{debug, info};

use sliced_core::{DatabaseId, RebalanceId, SliceNum};
use sliced_state::{
    ClusterState, Command, Rebalance, SliceId, SliceSlots, SlotRing, Task, TxError, TxResult,
};

/// A rebalance ready to be proposed.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub database: DatabaseId,
    pub rebalance: Rebalance,
    pub command: Command,
}

/// Minimal task list moving `current` to `target`.
pub fn diff(current: &SlotRing, target: &SlotRing) -> TxResult<Vec<Task>> {
    let mut tasks: Vec<Task> = Vec::new();
    for (low, high, from, to) in current.overlay(target)? {
        if from == to {
            continue;
        }
        match tasks.last_mut() {
            Some(prev) if prev.from == from && prev.to == to && prev.high() == low => {
                prev.count += high - low;
            }
            _ => tasks.push(Task {
                from,
                to,
                low,
                count: high - low,
            }),
        }
    }
    Ok(tasks)
}

/// Ring-change lists for applying `tasks` to `current`.
///
/// Every task's range must currently belong to its `from` slice. The
/// lists name every slice touched by any task, with complete ownership.
pub fn change_lists(
    current: &SlotRing,
    tasks: &[Task],
) -> TxResult<(Vec<SliceSlots>, Vec<SliceSlots>)> {
    let mut next = current.clone();
    let mut involved = BTreeSet::new();
    for task in tasks {
        let owned = current.owned_by(task.from);
        if !owned
            .iter()
            .any(|r| r.low <= task.low && task.high() <= r.high)
        {
            return Err(TxError::StaleSnapshot(format!(
                "slice {} does not own {task}",
                task.from
            )));
        }
        next.assign(task.low, task.high(), task.to)?;
        involved.insert(task.from);
        involved.insert(task.to);
    }
    Ok((
        current.ownership(involved.iter().copied()),
        next.ownership(involved.iter().copied()),
    ))
}

/// Plan the move of `database` to `target` as one `ChangeRing` command.
///
/// Returns `None` when the ring already matches the target.
pub fn plan_rebalance(
    state: &ClusterState,
    database: DatabaseId,
    target: &SlotRing,
    timestamp: RebalanceId,
) -> TxResult<Option<RebalancePlan>> {
    let current = state.ring(database)?;
    for slice in target.slices() {
        state.slice(SliceId::new(database, slice))?;
    }
    let tasks = diff(current, target)?;
    if tasks.is_empty() {
        debug!(database, "ring already matches target");
        return Ok(None);
    }
    let (from, to) = change_lists(current, &tasks)?;
    let rebalance = Rebalance { timestamp, tasks };
    info!(
        database,
        rebalance = timestamp,
        tasks = rebalance.tasks.len(),
        moved = rebalance.moved(),
        "rebalance planned"
    );
    Ok(Some(RebalancePlan {
        database,
        command: Command::ChangeRing {
            database,
            rebalance: timestamp,
            from,
            to,
        },
        rebalance,
    }))
}

/// Slices touched by a rebalance.
pub fn involved_slices(rebalance: &Rebalance) -> BTreeSet<SliceNum> {
    rebalance
        .tasks
        .iter()
        .flat_map(|t| [t.from, t.to])
        .collect()
}
