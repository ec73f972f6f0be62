//! Databases, slices, and slot ring changes.
//!
//! A dropped database refuses new slices, topics and ring changes. Once
//! its topics are gone it can be removed, which leaves a tombstone record
//! behind so the id is never handed out again.
//!
//! A ring change carries the complete before (`from`) and after (`to`)
//! ownership of every slice it touches and commits as one log entry.
//! Each database keeps a ledger of rebalance ids: a cancel that reaches
//! the log first voids the change, a cancel after the change is refused.

use std::collections::BTreeMap;

use tracing::{debug, info};

use sliced_core::*;
use sliced_state::*;

pub fn create_database(
    state: &mut ClusterState,
    name: &str,
    description: &str,
    group_id: GroupId,
    slices: u32,
    size: u32,
    at: Timestamp,
) -> TxResult<Applied> {
    if name.is_empty() {
        return Err(TxError::InvalidCommand("database name must not be empty".into()));
    }
    if state.database_by_name(name).is_some() {
        return Err(TxError::AlreadyExists(format!("database {name}")));
    }
    if size == 0 || slices == 0 || slices > size {
        return Err(TxError::InvalidCommand(format!(
            "cannot split {size} slots into {slices} slices"
        )));
    }
    state.group(group_id)?;

    let id = state.seq.next_database();
    state.databases.insert(
        id,
        Database {
            id,
            name: name.to_string(),
            description: description.to_string(),
            created: at,
            changed: at,
            dropped: 0,
            removed: 0,
            layout: RingLayout::Spread,
            rebalances: BTreeMap::new(),
        },
    );
    state.seq.slices.insert(id, slices);
    state.rings.insert(id, SlotRing::balanced(size, slices));
    state.slices.insert(
        id,
        (0..slices)
            .map(|n| (n, empty_slice(SliceId::new(id, n), group_id)))
            .collect(),
    );
    state.sync_slice_slots(id);
    state.sync_slice_nodes(group_id);

    info!(database = id, %name, slices, size, "database created");
    let mut events = vec![Event::DatabaseCreated {
        database: id,
        name: name.to_string(),
    }];
    events.extend((0..slices).map(|n| Event::SliceAdded {
        slice: SliceId::new(id, n),
    }));
    Ok(Applied::changed(events))
}

pub fn drop_database(
    state: &mut ClusterState,
    database: DatabaseId,
    at: Timestamp,
) -> TxResult<Applied> {
    if state.database(database)?.is_dropped() {
        return Ok(Applied::unchanged());
    }
    if let Some(db) = state.databases.get_mut(&database) {
        db.dropped = at;
        db.changed = at;
    }
    info!(database, "database dropped");
    Ok(Applied::changed(vec![Event::DatabaseDropped { database }]))
}

/// Release the ring and slices of a dropped database that has no topics
/// left.
pub fn remove_database(
    state: &mut ClusterState,
    database: DatabaseId,
    at: Timestamp,
) -> TxResult<Applied> {
    let db = state.database(database)?;
    if db.is_removed() {
        return Ok(Applied::unchanged());
    }
    if !db.is_dropped() {
        return Err(TxError::InvalidCommand(format!(
            "database {database} must be dropped before it is removed"
        )));
    }
    let topics = state.topics.values().filter(|t| t.database == database).count();
    if topics > 0 {
        return Err(TxError::InvalidCommand(format!(
            "database {database} still has {topics} topics"
        )));
    }

    state.rings.remove(&database);
    state.seq.slices.remove(&database);
    let mut events: Vec<Event> = state
        .slices
        .remove(&database)
        .unwrap_or_default()
        .into_values()
        .map(|slice| Event::SliceRemoved { slice: slice.id })
        .collect();
    if let Some(db) = state.databases.get_mut(&database) {
        db.removed = at;
        db.changed = at;
        db.layout = RingLayout::Spread;
    }
    info!(database, "database removed");
    events.push(Event::DatabaseRemoved { database });
    Ok(Applied::changed(events))
}

pub fn rename_database(
    state: &mut ClusterState,
    database: DatabaseId,
    name: &str,
    at: Timestamp,
) -> TxResult<Applied> {
    if name.is_empty() {
        return Err(TxError::InvalidCommand("database name must not be empty".into()));
    }
    if state.live_database(database)?.name == name {
        return Ok(Applied::unchanged());
    }
    if state.database_by_name(name).is_some() {
        return Err(TxError::AlreadyExists(format!("database {name}")));
    }
    if let Some(db) = state.databases.get_mut(&database) {
        db.name = name.to_string();
        db.changed = at;
    }
    info!(database, %name, "database renamed");
    Ok(Applied::changed(vec![Event::DatabaseRenamed {
        database,
        name: name.to_string(),
    }]))
}

/// Point the rebalancer at a new ring shape.
pub fn set_ring_layout(
    state: &mut ClusterState,
    database: DatabaseId,
    layout: RingLayout,
) -> TxResult<Applied> {
    if state.live_database(database)?.layout == layout {
        return Ok(Applied::unchanged());
    }
    if let RingLayout::Split { slice, into } | RingLayout::Merge { slice, into } = layout {
        if slice == into {
            return Err(TxError::InvalidCommand(format!(
                "layout moves slice {slice} onto itself"
            )));
        }
        state.slice(SliceId::new(database, slice))?;
        state.slice(SliceId::new(database, into))?;
    }
    if let Some(db) = state.databases.get_mut(&database) {
        db.layout = layout;
    }
    info!(database, ?layout, "ring layout changed");
    Ok(Applied::changed(vec![Event::RingLayoutChanged { database, layout }]))
}

/// Create an empty slice; it receives slots through a later ring change.
pub fn add_slice(
    state: &mut ClusterState,
    database: DatabaseId,
    group_id: GroupId,
) -> TxResult<Applied> {
    state.live_database(database)?;
    state.group(group_id)?;
    let floor = state
        .slices
        .get(&database)
        .and_then(|s| s.keys().next_back())
        .map_or(0, |n| n + 1);
    let next = state.seq.next_slice(database, floor);
    let id = SliceId::new(database, next);
    state
        .slices
        .entry(database)
        .or_default()
        .insert(next, empty_slice(id, group_id));
    state.sync_slice_nodes(group_id);
    info!(slice = %id, group_id, "slice added");
    Ok(Applied::changed(vec![Event::SliceAdded { slice: id }]))
}

/// Remove a slice that no longer owns any slots.
pub fn remove_slice(state: &mut ClusterState, slice: SliceId) -> TxResult<Applied> {
    state.slice(slice)?;
    let owned = state.ring(slice.database)?.slot_count(slice.slice);
    if owned > 0 {
        return Err(TxError::InvalidCommand(format!(
            "slice {slice} still owns {owned} slots"
        )));
    }
    if let Some(slices) = state.slices.get_mut(&slice.database) {
        slices.remove(&slice.slice);
    }
    if let Some(db) = state.databases.get_mut(&slice.database) {
        if db.layout.references(slice.slice) {
            db.layout = RingLayout::Spread;
        }
    }
    info!(%slice, "slice removed");
    Ok(Applied::changed(vec![Event::SliceRemoved { slice }]))
}

/// Validate a ring change against the current topology without looking
/// at live ownership. Used both before proposing and during apply.
pub fn check_change_ring(
    state: &ClusterState,
    database: DatabaseId,
    from: &[SliceSlots],
    to: &[SliceSlots],
) -> TxResult<()> {
    state.live_database(database)?;
    let ring = state.ring(database)?;
    for listed in from.iter().chain(to) {
        state.slice(SliceId::new(database, listed.slice))?;
    }
    SlotRing::check_change(ring.size(), from, to)
}

pub fn change_ring(
    state: &mut ClusterState,
    database: DatabaseId,
    rebalance: RebalanceId,
    from: &[SliceSlots],
    to: &[SliceSlots],
) -> TxResult<Applied> {
    let ledger = state.database(database)?.rebalances.get(&rebalance).copied();
    match ledger {
        Some(RebalanceStatus::Cancelled) => {
            debug!(database, rebalance, "ring change voided by earlier cancel");
            return Ok(Applied::cancelled());
        }
        // A later change may have restored this change's `from`; it must
        // not be applied a second time.
        Some(RebalanceStatus::Committed) => {
            debug!(database, rebalance, "ring change already committed");
            return Ok(Applied::unchanged());
        }
        None => {}
    }
    check_change_ring(state, database, from, to)?;

    let ring = state.ring(database)?;
    let next = match ring.apply_change(from, to)? {
        RingChange::Unchanged => {
            if ledger.is_none() {
                record(state, database, rebalance, RebalanceStatus::Committed);
            }
            debug!(database, rebalance, "ring already matches target");
            return Ok(Applied::unchanged());
        }
        RingChange::Changed(next) => next,
    };
    let moved = ring.moved(&next)?;
    let drained: Vec<(SliceNum, bool)> = to
        .iter()
        .filter_map(|listed| {
            if next.slot_count(listed.slice) > 0 {
                Some((listed.slice, false))
            } else if ring.slot_count(listed.slice) > 0 {
                Some((listed.slice, true))
            } else {
                None
            }
        })
        .collect();

    state.rings.insert(database, next);
    state.sync_slice_slots(database);
    if let Some(slices) = state.slices.get_mut(&database) {
        for (num, flag) in drained {
            if let Some(slice) = slices.get_mut(&num) {
                slice.drained = flag;
            }
        }
    }
    record(state, database, rebalance, RebalanceStatus::Committed);
    info!(database, rebalance, moved, "ring changed");
    Ok(Applied::changed(vec![Event::RingChanged {
        database,
        rebalance,
        moved,
    }]))
}

pub fn change_ring_cancel(
    state: &mut ClusterState,
    database: DatabaseId,
    rebalance: RebalanceId,
) -> TxResult<Applied> {
    match state.database(database)?.rebalances.get(&rebalance) {
        Some(RebalanceStatus::Committed) => Err(TxError::RebalanceCommitted {
            database,
            rebalance,
        }),
        Some(RebalanceStatus::Cancelled) => Ok(Applied::unchanged()),
        None => {
            record(state, database, rebalance, RebalanceStatus::Cancelled);
            info!(database, rebalance, "rebalance cancelled before commit");
            Ok(Applied::changed(vec![Event::RebalanceCancelled {
                database,
                rebalance,
            }]))
        }
    }
}

fn record(
    state: &mut ClusterState,
    database: DatabaseId,
    rebalance: RebalanceId,
    status: RebalanceStatus,
) {
    if let Some(db) = state.databases.get_mut(&database) {
        db.rebalances.insert(rebalance, status);
    }
}

fn empty_slice(id: SliceId, group: GroupId) -> Slice {
    Slice {
        id,
        group,
        slots: Vec::new(),
        nodes: Vec::new(),
        drained: false,
    }
}
