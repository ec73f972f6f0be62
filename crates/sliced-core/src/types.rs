//! Identifiers and small shared enums.

use serde::{Deserialize, Serialize};

/// Cluster-wide node identifier (e.g. "node-1").
pub type NodeId = String;

/// Replication group identifier.
pub type GroupId = u64;

pub type DatabaseId = u32;

/// Slice number, unique within its database.
pub type SliceNum = u32;

/// A position in the hash-slot space of a ring.
pub type Slot = u32;

pub type TopicId = u64;
pub type QueueId = u64;
pub type SegmentId = u64;
pub type RollerId = u32;

/// Rebalances are identified by the timestamp the planner stamped on them.
pub type RebalanceId = u64;

/// Unix timestamp in milliseconds, always supplied by the proposer.
pub type Timestamp = u64;

/// A replica's voting eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suffrage {
    Voter,
    NonVoter,
    Staging,
}

impl Suffrage {
    /// The single forward promotion step, if any.
    pub fn next(self) -> Option<Suffrage> {
        match self {
            Suffrage::NonVoter => Some(Suffrage::Staging),
            Suffrage::Staging => Some(Suffrage::Voter),
            Suffrage::Voter => None,
        }
    }
}

/// Consensus role as reported by the Raft layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RaftStatus {
    #[default]
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

/// Service level of a topic or queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Mission,
    #[default]
    Business,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    #[default]
    Json,
    Protobuf,
    Msgpack,
    Cbor,
}

/// How records of a topic are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopicMode {
    #[default]
    Log,
    Queue,
    Table,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriveKind {
    Hdd,
    #[default]
    Ssd,
    Nvme,
}
