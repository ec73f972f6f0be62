//! Replicated commands and the events their application emits.
//!
//! A [`Command`] is the payload of one log entry. Every field that an
//! apply step needs (timestamps, segment paths) is supplied by the
//! proposer so that apply never reads a clock or touches the disk.

use serde::{Deserialize, Serialize};

use sliced_core::*;

use crate::error::{TxError, TxResult};
use crate::ring::SliceSlots;
use crate::types::*;

/// Parameters for opening a new segment, chosen by the proposer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSegment {
    pub path: SegmentPath,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // ── Nodes ─────────────────────────────────────────────────────
    InitNode {
        node: Node,
        at: Timestamp,
    },
    DropNode {
        node_id: NodeId,
        at: Timestamp,
    },
    RemoveNode {
        node_id: NodeId,
        at: Timestamp,
    },

    // ── Groups ────────────────────────────────────────────────────
    CreateGroup {
        name: String,
    },
    AddNodeToGroup {
        node_id: NodeId,
        group_id: GroupId,
        suffrage: Suffrage,
        #[serde(default)]
        bootstrap: bool,
        address: String,
    },
    RemoveNodeFromGroup {
        node_id: NodeId,
        group_id: GroupId,
    },
    /// Status, term and applied index as observed by the consensus layer.
    ReportMember {
        group_id: GroupId,
        node_id: NodeId,
        status: RaftStatus,
        term: u64,
        applied: u64,
    },

    // ── Databases, slices and the ring ────────────────────────────
    CreateDatabase {
        name: String,
        #[serde(default)]
        description: String,
        group_id: GroupId,
        slices: u32,
        size: u32,
        at: Timestamp,
    },
    DropDatabase {
        database: DatabaseId,
        at: Timestamp,
    },
    /// Tombstone a dropped database: its ring and slices are released.
    RemoveDatabase {
        database: DatabaseId,
        at: Timestamp,
    },
    RenameDatabase {
        database: DatabaseId,
        name: String,
        at: Timestamp,
    },
    SetRingLayout {
        database: DatabaseId,
        layout: RingLayout,
    },
    AddSlice {
        database: DatabaseId,
        group_id: GroupId,
    },
    RemoveSlice {
        slice: SliceId,
    },
    ChangeRing {
        database: DatabaseId,
        rebalance: RebalanceId,
        from: Vec<SliceSlots>,
        to: Vec<SliceSlots>,
    },
    ChangeRingCancel {
        database: DatabaseId,
        rebalance: RebalanceId,
    },

    // ── Topics, queues and segments ───────────────────────────────
    CreateRoller {
        name: String,
        limits: RollerLimits,
    },
    CreateTopic {
        database: DatabaseId,
        name: String,
        #[serde(default)]
        mode: TopicMode,
        roller_id: RollerId,
        #[serde(default)]
        codec: Codec,
        #[serde(default)]
        level: Level,
        #[serde(default)]
        app_id: String,
        #[serde(default)]
        drive: DriveKind,
    },
    CreateQueue {
        database: DatabaseId,
        name: String,
        roller_id: RollerId,
        #[serde(default)]
        level: Level,
        #[serde(default)]
        fifo: bool,
        max_in_flight: u32,
        max_visibility_ms: u64,
        max_delay_ms: u64,
        max_retries: u32,
        #[serde(default)]
        app_id: String,
        #[serde(default)]
        tags: Vec<String>,
    },
    CreateSegment {
        topic_id: TopicId,
        next: NewSegment,
    },
    /// Seal the active segment with frozen stats and open the next one.
    Roll {
        roller_id: RollerId,
        topic_id: TopicId,
        segment_id: SegmentId,
        stats: SegmentStats,
        next: NewSegment,
    },
    DeleteTopic {
        topic_id: TopicId,
    },
    /// Delete a queue together with its request, reply and error topics.
    DeleteQueue {
        queue_id: QueueId,
    },
    /// Rename and/or re-slot a topic. The active segment is sealed with
    /// `stats` and `next` opens on the new owning slice.
    SplitTopic {
        topic_id: TopicId,
        name: Option<String>,
        slot: Option<Slot>,
        stats: SegmentStats,
        next: NewSegment,
    },
}

impl Command {
    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::InitNode { .. } => "init_node",
            Command::DropNode { .. } => "drop_node",
            Command::RemoveNode { .. } => "remove_node",
            Command::CreateGroup { .. } => "create_group",
            Command::AddNodeToGroup { .. } => "add_node_to_group",
            Command::RemoveNodeFromGroup { .. } => "remove_node_from_group",
            Command::ReportMember { .. } => "report_member",
            Command::CreateDatabase { .. } => "create_database",
            Command::DropDatabase { .. } => "drop_database",
            Command::RemoveDatabase { .. } => "remove_database",
            Command::RenameDatabase { .. } => "rename_database",
            Command::SetRingLayout { .. } => "set_ring_layout",
            Command::AddSlice { .. } => "add_slice",
            Command::RemoveSlice { .. } => "remove_slice",
            Command::ChangeRing { .. } => "change_ring",
            Command::ChangeRingCancel { .. } => "change_ring_cancel",
            Command::CreateRoller { .. } => "create_roller",
            Command::CreateTopic { .. } => "create_topic",
            Command::CreateQueue { .. } => "create_queue",
            Command::CreateSegment { .. } => "create_segment",
            Command::Roll { .. } => "roll",
            Command::DeleteTopic { .. } => "delete_topic",
            Command::DeleteQueue { .. } => "delete_queue",
            Command::SplitTopic { .. } => "split_topic",
        }
    }

    /// Encode as a log entry payload.
    pub fn encode(&self) -> TxResult<String> {
        serde_json::to_string(self).map_err(|e| TxError::InvalidCommand(e.to_string()))
    }

    /// Decode a log entry payload. Anything that does not decode is a
    /// corrupt entry.
    pub fn decode(payload: &str) -> TxResult<Command> {
        serde_json::from_str(payload).map_err(|e| TxError::CorruptLogEntry(e.to_string()))
    }
}

/// Domain notifications emitted by apply, in apply order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    NodeChanged {
        node_id: NodeId,
        lifecycle: NodeLifecycle,
    },
    GroupCreated {
        group_id: GroupId,
        name: String,
    },
    MemberChanged {
        group_id: GroupId,
        node_id: NodeId,
        suffrage: Option<Suffrage>,
    },
    LeaderChanged {
        group_id: GroupId,
        leader: NodeId,
        term: u64,
    },
    DatabaseCreated {
        database: DatabaseId,
        name: String,
    },
    DatabaseDropped {
        database: DatabaseId,
    },
    DatabaseRemoved {
        database: DatabaseId,
    },
    DatabaseRenamed {
        database: DatabaseId,
        name: String,
    },
    RingLayoutChanged {
        database: DatabaseId,
        layout: RingLayout,
    },
    SliceAdded {
        slice: SliceId,
    },
    SliceRemoved {
        slice: SliceId,
    },
    RingChanged {
        database: DatabaseId,
        rebalance: RebalanceId,
        moved: u32,
    },
    RebalanceCancelled {
        database: DatabaseId,
        rebalance: RebalanceId,
    },
    RollerCreated {
        roller_id: RollerId,
        name: String,
    },
    TopicCreated {
        topic_id: TopicId,
        name: String,
        slice: SliceId,
    },
    QueueCreated {
        queue_id: QueueId,
        name: String,
    },
    QueueDeleted {
        queue_id: QueueId,
    },
    TopicSplit {
        topic_id: TopicId,
        slot: Slot,
        slice: SliceId,
    },
    TopicDeleted {
        topic_id: TopicId,
        /// Segments whose backing bytes may now be released.
        segments: Vec<Segment>,
    },
    SegmentCreated {
        segment: Segment,
    },
    SegmentSealed {
        segment_id: SegmentId,
        topic_id: TopicId,
        stats: SegmentStats,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The command mutated the state.
    Changed,
    /// Replay of something already applied; state untouched.
    Unchanged,
    /// The command was voided by an earlier cancel.
    Cancelled,
}

/// Result of applying one command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Applied {
    pub outcome: Outcome,
    pub events: Vec<Event>,
}

impl Applied {
    pub fn changed(events: Vec<Event>) -> Self {
        Self {
            outcome: Outcome::Changed,
            events,
        }
    }

    pub fn unchanged() -> Self {
        Self {
            outcome: Outcome::Unchanged,
            events: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: Outcome::Cancelled,
            events: Vec::new(),
        }
    }
}
