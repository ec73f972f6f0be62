//! The replicated cluster state aggregate.
//!
//! Only ordered maps are used so that serializing the same state always
//! yields the same bytes on every replica.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use sliced_core::*;

use crate::error::{TxError, TxResult};
use crate::ring::SlotRing;
use crate::types::*;

/// Monotonic id sequences. Each `next_*` returns the new id; ids start at 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequences {
    pub group: GroupId,
    pub database: DatabaseId,
    pub roller: RollerId,
    pub topic: TopicId,
    pub queue: QueueId,
    pub segment: SegmentId,
    /// Next slice number per database. Slice numbers are never reused,
    /// even after the slice is removed.
    #[serde(default)]
    pub slices: BTreeMap<DatabaseId, SliceNum>,
}

impl Sequences {
    pub fn next_group(&mut self) -> GroupId {
        self.group += 1;
        self.group
    }

    pub fn next_database(&mut self) -> DatabaseId {
        self.database += 1;
        self.database
    }

    pub fn next_roller(&mut self) -> RollerId {
        self.roller += 1;
        self.roller
    }

    pub fn next_topic(&mut self) -> TopicId {
        self.topic += 1;
        self.topic
    }

    pub fn next_queue(&mut self) -> QueueId {
        self.queue += 1;
        self.queue
    }

    pub fn next_segment(&mut self) -> SegmentId {
        self.segment += 1;
        self.segment
    }

    /// Allocate a slice number in `database`, never below `floor`.
    /// Unlike the other sequences this one starts at 0.
    pub fn next_slice(&mut self, database: DatabaseId, floor: SliceNum) -> SliceNum {
        let next = self.slices.entry(database).or_insert(0);
        let slice = (*next).max(floor);
        *next = slice + 1;
        slice
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub nodes: BTreeMap<NodeId, Node>,
    pub groups: BTreeMap<GroupId, NodeGroup>,
    pub databases: BTreeMap<DatabaseId, Database>,
    pub rings: BTreeMap<DatabaseId, SlotRing>,
    pub slices: BTreeMap<DatabaseId, BTreeMap<SliceNum, Slice>>,
    pub rollers: BTreeMap<RollerId, Roller>,
    pub topics: BTreeMap<TopicId, Topic>,
    pub queues: BTreeMap<QueueId, Queue>,
    pub segments: BTreeMap<SegmentId, Segment>,
    pub seq: Sequences,
}

impl ClusterState {
    // ── Lookups ───────────────────────────────────────────────────

    pub fn node(&self, id: &str) -> TxResult<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| TxError::NotFound(format!("node {id}")))
    }

    pub fn group(&self, id: GroupId) -> TxResult<&NodeGroup> {
        self.groups
            .get(&id)
            .ok_or_else(|| TxError::NotFound(format!("group {id}")))
    }

    pub fn group_mut(&mut self, id: GroupId) -> TxResult<&mut NodeGroup> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| TxError::NotFound(format!("group {id}")))
    }

    pub fn database(&self, id: DatabaseId) -> TxResult<&Database> {
        self.databases
            .get(&id)
            .ok_or_else(|| TxError::NotFound(format!("database {id}")))
    }

    /// Database by name. Removed databases release their name.
    pub fn database_by_name(&self, name: &str) -> Option<&Database> {
        self.databases
            .values()
            .find(|d| d.name == name && !d.is_removed())
    }

    /// Like [`database`](Self::database), but refuses dropped databases.
    pub fn live_database(&self, id: DatabaseId) -> TxResult<&Database> {
        let database = self.database(id)?;
        if database.is_dropped() {
            return Err(TxError::InvalidCommand(format!("database {id} is dropped")));
        }
        Ok(database)
    }

    pub fn ring(&self, database: DatabaseId) -> TxResult<&SlotRing> {
        self.rings
            .get(&database)
            .ok_or_else(|| TxError::NotFound(format!("ring of database {database}")))
    }

    pub fn slice(&self, id: SliceId) -> TxResult<&Slice> {
        self.slices
            .get(&id.database)
            .and_then(|s| s.get(&id.slice))
            .ok_or_else(|| TxError::NotFound(format!("slice {id}")))
    }

    pub fn roller(&self, id: RollerId) -> TxResult<&Roller> {
        self.rollers
            .get(&id)
            .ok_or_else(|| TxError::NotFound(format!("roller {id}")))
    }

    pub fn topic(&self, id: TopicId) -> TxResult<&Topic> {
        self.topics
            .get(&id)
            .ok_or_else(|| TxError::NotFound(format!("topic {id}")))
    }

    pub fn topic_by_name(&self, database: DatabaseId, name: &str) -> Option<&Topic> {
        self.topics
            .values()
            .find(|t| t.database == database && t.name == name)
    }

    pub fn segment(&self, id: SegmentId) -> TxResult<&Segment> {
        self.segments
            .get(&id)
            .ok_or_else(|| TxError::NotFound(format!("segment {id}")))
    }

    /// Groups that `node_id` is a member of.
    pub fn groups_of(&self, node_id: &str) -> Vec<GroupId> {
        self.groups
            .values()
            .filter(|g| g.member(node_id).is_some())
            .map(|g| g.id)
            .collect()
    }

    /// Slice owning `slot` in `database`, via the ring.
    pub fn owning_slice(&self, database: DatabaseId, slot: Slot) -> TxResult<SliceId> {
        let ring = self.ring(database)?;
        ring.lookup(slot)
            .map(|slice| SliceId::new(database, slice))
            .ok_or_else(|| TxError::InvalidRange {
                low: slot,
                high: slot + 1,
                size: ring.size(),
            })
    }

    /// Leader of the group replicating `slice`, if one is known.
    pub fn slice_leader(&self, slice: SliceId) -> TxResult<Option<&RaftMember>> {
        let slice = self.slice(slice)?;
        Ok(self.group(slice.group)?.leader())
    }

    /// Refresh the `slots` mirror of every slice of `database` from its ring.
    pub fn sync_slice_slots(&mut self, database: DatabaseId) {
        let Some(ring) = self.rings.get(&database) else {
            return;
        };
        if let Some(slices) = self.slices.get_mut(&database) {
            for slice in slices.values_mut() {
                slice.slots = ring.owned_by(slice.id.slice);
            }
        }
    }

    /// Refresh the `nodes` view of every slice replicated by `group_id`.
    pub fn sync_slice_nodes(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        for slice in self.slices.values_mut().flat_map(|s| s.values_mut()) {
            if slice.group != group_id {
                continue;
            }
            slice.nodes = group
                .members
                .iter()
                .map(|m| SliceNode {
                    node_id: m.id.clone(),
                    slice_id: slice.id,
                    member: m.clone(),
                })
                .collect();
        }
    }

    // ── Integrity ─────────────────────────────────────────────────

    /// Check cross-record invariants of a loaded or installed state.
    pub fn validate(&self) -> TxResult<()> {
        for (id, ring) in &self.rings {
            match self.databases.get(id) {
                None => {
                    return Err(TxError::CorruptState(format!("ring for unknown database {id}")));
                }
                Some(database) if database.is_removed() => {
                    return Err(TxError::CorruptState(format!(
                        "removed database {id} still has a ring"
                    )));
                }
                Some(_) => {}
            }
            ring.validate()
                .map_err(|e| TxError::CorruptState(format!("database {id}: {e}")))?;
            let slices = self.slices.get(id);
            for owner in ring.slices() {
                if slices.is_none_or(|s| !s.contains_key(&owner)) {
                    return Err(TxError::CorruptState(format!(
                        "database {id}: ring references unknown slice {owner}"
                    )));
                }
            }
        }
        for slices in self.slices.values() {
            for slice in slices.values() {
                let ring = self.ring(slice.id.database).map_err(|e| {
                    TxError::CorruptState(format!("slice {}: {e}", slice.id))
                })?;
                if slice.slots != ring.owned_by(slice.id.slice) {
                    return Err(TxError::CorruptState(format!(
                        "slice {} slots disagree with the ring",
                        slice.id
                    )));
                }
            }
        }
        for group in self.groups.values() {
            if group.members.iter().filter(|m| m.suffrage == Suffrage::Staging).count() > 1 {
                return Err(TxError::CorruptState(format!(
                    "group {} has more than one staging member",
                    group.id
                )));
            }
        }
        for topic in self.topics.values() {
            if let Some(active) = topic.active_segment {
                let segment = self.segments.get(&active).ok_or_else(|| {
                    TxError::CorruptState(format!(
                        "topic {} active segment {active} missing",
                        topic.id
                    ))
                })?;
                if segment.sealed {
                    return Err(TxError::CorruptState(format!(
                        "topic {} active segment {active} is sealed",
                        topic.id
                    )));
                }
            }
            let unsealed = topic
                .segments
                .iter()
                .filter_map(|id| self.segments.get(id))
                .filter(|s| !s.sealed)
                .count();
            if unsealed > 1 {
                return Err(TxError::CorruptState(format!(
                    "topic {} has {unsealed} unsealed segments",
                    topic.id
                )));
            }
        }
        Ok(())
    }
}
