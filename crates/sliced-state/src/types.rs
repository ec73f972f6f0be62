//! Domain records for the sliced cluster state.
//!
//! These types represent nodes, replication groups, databases and their
//! slices, rollers, topics, queues, and segments. All types are
//! serializable to/from JSON for the Raft log, snapshots, and redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use sliced_core::*;

use crate::ring::SlotRange;

// ── Node ──────────────────────────────────────────────────────────

/// A physical or virtual host in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub version: String,
    pub region: String,
    pub zone: String,
    pub cores: u32,
    /// Memory in bytes.
    pub memory: u64,
    pub bootstrap: bool,
    pub drives: Vec<Drive>,
    pub created: Timestamp,
    pub inited: Timestamp,
    pub changed: Timestamp,
    /// Zero while the node has not been dropped.
    pub dropped: Timestamp,
    /// Zero while the node has not been removed.
    pub removed: Timestamp,
}

/// Lifecycle state derived from a node's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLifecycle {
    Active,
    Dropped,
    Removed,
}

impl Node {
    pub fn lifecycle(&self) -> NodeLifecycle {
        if self.removed > 0 {
            NodeLifecycle::Removed
        } else if self.dropped > 0 {
            NodeLifecycle::Dropped
        } else {
            NodeLifecycle::Active
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Drive {
    pub mount: String,
    pub kind: DriveKind,
    pub stats: Option<DriveStats>,
    pub working: bool,
    pub filesystem: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DriveStats {
    pub size: u64,
    pub used: u64,
    pub avail: u64,
}

// ── Raft groups ───────────────────────────────────────────────────

/// A replica's consensus role within one group, as last reported by
/// the consensus layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaftMember {
    /// Node id of the replica.
    pub id: NodeId,
    pub address: String,
    pub status: RaftStatus,
    /// Older records carried the same value under `membership`.
    #[serde(alias = "membership")]
    pub suffrage: Suffrage,
    pub term: u64,
    pub applied: u64,
}

impl RaftMember {
    pub fn new(id: &str, address: &str, suffrage: Suffrage) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            status: RaftStatus::Follower,
            suffrage,
            term: 0,
            applied: 0,
        }
    }
}

/// A replication group: the replicas of one Raft log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeGroup {
    pub id: GroupId,
    pub name: String,
    /// Sorted by node id.
    pub members: Vec<RaftMember>,
}

impl NodeGroup {
    pub fn member(&self, node_id: &str) -> Option<&RaftMember> {
        self.members.iter().find(|m| m.id == node_id)
    }

    pub fn member_mut(&mut self, node_id: &str) -> Option<&mut RaftMember> {
        self.members.iter_mut().find(|m| m.id == node_id)
    }

    /// The member currently reported as leader with the highest term.
    pub fn leader(&self) -> Option<&RaftMember> {
        self.members
            .iter()
            .filter(|m| m.status == RaftStatus::Leader)
            .max_by_key(|m| m.term)
    }

    pub fn has_voters(&self) -> bool {
        self.members.iter().any(|m| m.suffrage == Suffrage::Voter)
    }

    /// Member being promoted, if any.
    pub fn staging(&self) -> Option<&RaftMember> {
        self.members.iter().find(|m| m.suffrage == Suffrage::Staging)
    }
}

// ── Databases and slices ──────────────────────────────────────────

/// Composite key of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SliceId {
    pub database: DatabaseId,
    pub slice: SliceNum,
}

impl SliceId {
    pub fn new(database: DatabaseId, slice: SliceNum) -> Self {
        Self { database, slice }
    }

    /// Key for the slices table.
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.database, self.slice)
    }
}

impl fmt::Display for SliceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.slice)
    }
}

/// A shard of a database. `slots` mirrors the database ring; `nodes`
/// mirrors the members of the replicating group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slice {
    pub id: SliceId,
    pub group: GroupId,
    pub slots: Vec<SlotRange>,
    pub nodes: Vec<SliceNode>,
    /// Set when a ring change took the last slot away from this slice
    /// (a merge); cleared once it owns slots again. Drained slices are
    /// left out of automatic spreading.
    #[serde(default)]
    pub drained: bool,
}

impl Slice {
    pub fn leader(&self) -> Option<&SliceNode> {
        self.nodes
            .iter()
            .filter(|n| n.member.status == RaftStatus::Leader)
            .max_by_key(|n| n.member.term)
    }
}

/// One replica of a slice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SliceNode {
    pub node_id: NodeId,
    pub slice_id: SliceId,
    pub member: RaftMember,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    pub id: DatabaseId,
    pub name: String,
    pub description: String,
    pub created: Timestamp,
    pub changed: Timestamp,
    pub dropped: Timestamp,
    pub removed: Timestamp,
    /// Shape the rebalancer steers the ring towards.
    #[serde(default)]
    pub layout: RingLayout,
    /// Ledger of rebalances that reached the log.
    pub rebalances: BTreeMap<RebalanceId, RebalanceStatus>,
}

impl Database {
    /// Dropped databases keep their records but accept no new work.
    pub fn is_dropped(&self) -> bool {
        self.dropped != 0
    }

    /// Removed databases are tombstones: no ring, no slices.
    pub fn is_removed(&self) -> bool {
        self.removed != 0
    }
}

/// Target ring shape for a database.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RingLayout {
    /// Even spread over every slice that has not been drained.
    #[default]
    Spread,
    /// Hand half of `slice`'s slots to `into`.
    Split { slice: SliceNum, into: SliceNum },
    /// Hand every slot of `slice` to `into`.
    Merge { slice: SliceNum, into: SliceNum },
}

impl RingLayout {
    pub fn references(&self, slice: SliceNum) -> bool {
        match *self {
            RingLayout::Spread => false,
            RingLayout::Split { slice: a, into: b } | RingLayout::Merge { slice: a, into: b } => {
                a == slice || b == slice
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStatus {
    Committed,
    Cancelled,
}

// ── Rebalance ─────────────────────────────────────────────────────

/// A planned migration of slot ownership, committed as one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Rebalance {
    /// Also serves as the rebalance id.
    pub timestamp: RebalanceId,
    pub tasks: Vec<Task>,
}

impl Rebalance {
    /// Total number of slots that change owner.
    pub fn moved(&self) -> u32 {
        self.tasks.iter().map(|t| t.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Display for Rebalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for task in &self.tasks {
            writeln!(f, "{task}")?;
        }
        Ok(())
    }
}

/// Move `count` slots starting at `low` from slice `from` to slice `to`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub from: SliceNum,
    pub to: SliceNum,
    pub low: Slot,
    pub count: u32,
}

impl Task {
    pub fn high(&self) -> Slot {
        self.low + self.count
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {}] -> {}", self.from, self.low, self.high(), self.to)
    }
}

// ── Rollers ───────────────────────────────────────────────────────

/// Segment sealing thresholds. A zero maximum means no limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RollerLimits {
    pub min_bytes: u64,
    pub min_age_ms: u64,
    pub min_count: u64,
    pub max_bytes: u64,
    pub max_age_ms: u64,
    pub max_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Roller {
    pub id: RollerId,
    pub name: String,
    pub limits: RollerLimits,
    /// Number of rolls applied under this policy.
    pub cycle: u64,
}

// ── Topics and queues ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub database: DatabaseId,
    /// Ring lookup key; the owning slice is derived from it.
    pub slot: Slot,
    pub mode: TopicMode,
    pub roller_id: RollerId,
    pub codec: Codec,
    pub level: Level,
    pub app_id: String,
    /// Owning queue for queue-mode topics.
    pub queue_id: Option<QueueId>,
    pub drive: DriveKind,
    /// The single unsealed segment, if one is open.
    pub active_segment: Option<SegmentId>,
    /// All live segments, oldest first.
    pub segments: Vec<SegmentId>,
    /// Records held by sealed segments.
    pub sealed_records: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub id: QueueId,
    pub name: String,
    pub database: DatabaseId,
    pub request_id: TopicId,
    pub reply_id: TopicId,
    pub error_id: TopicId,
    pub level: Level,
    pub fifo: bool,
    pub max_in_flight: u32,
    pub max_visibility_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub app_id: String,
    pub tags: Vec<String>,
}

// ── Segments ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    #[default]
    Local,
    Bucket,
}

/// Location of the bytes backing a segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SegmentPath {
    pub name: String,
    pub volume_id: String,
    pub drive: String,
    pub kind: PathKind,
}

impl fmt::Display for SegmentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.kind {
            PathKind::Local => "local",
            PathKind::Bucket => "bucket",
        };
        write!(f, "{scheme}://{}/{}/{}", self.volume_id, self.drive, self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Crc32c,
    Sha256,
}

/// Integrity digest of segment contents, hex encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hash {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RecordId {
    pub epoch: u64,
    pub seq: u64,
}

/// Stable address of a record inside a segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RecordPointer {
    pub id: RecordId,
    pub log_id: u64,
    pub slot: Slot,
    pub size: u32,
    pub pos: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SegmentHeader {
    /// Open time, supplied by the proposer.
    pub timestamp: Timestamp,
    pub topic_id: TopicId,
    pub log_id: u64,
    /// Topic-wide index of the first record in this segment.
    pub start_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SegmentStats {
    pub hash: Option<Hash>,
    pub count: u64,
    /// Bytes of record headers.
    pub header: u64,
    /// Bytes of record bodies.
    pub body: u64,
    pub size: u64,
    /// Largest single body seen.
    pub max_body: u64,
    pub first: Option<RecordPointer>,
    pub last: Option<RecordPointer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Segment {
    pub id: SegmentId,
    pub topic_id: TopicId,
    pub slice: SliceId,
    pub path: SegmentPath,
    pub header: SegmentHeader,
    /// Frozen once `sealed` is set.
    pub stats: SegmentStats,
    pub sealed: bool,
}

impl Segment {
    /// Key for the segments table: `{topic}/{database}.{slice}/{segment}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{:020}", self.topic_id, self.slice.table_key(), self.id)
    }
}
