//! redb table definitions for the sliced state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Composite keys follow the pattern `{database}.{slice}` or
//! `{topic}/{database}.{slice}/{segment}`.

use redb::TableDefinition;

/// Nodes keyed by `{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Replication groups keyed by `{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Databases keyed by `{database_id}`.
pub const DATABASES: TableDefinition<&str, &[u8]> = TableDefinition::new("databases");

/// Slices keyed by `{database_id}.{slice}`.
pub const SLICES: TableDefinition<&str, &[u8]> = TableDefinition::new("slices");

/// Slot rings keyed by `{database_id}`.
pub const RINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("rings");

/// Roller policies keyed by `{roller_id}`.
pub const ROLLERS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollers");

/// Topics keyed by `{topic_id}`.
pub const TOPICS: TableDefinition<&str, &[u8]> = TableDefinition::new("topics");

/// Queues keyed by `{queue_id}`.
pub const QUEUES: TableDefinition<&str, &[u8]> = TableDefinition::new("queues");

/// Segments keyed by `{topic_id}/{database_id}.{slice}/{segment_id:020}`.
pub const SEGMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("segments");

/// Id sequences and the last applied log id.
pub const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const META_SEQUENCES: &str = "sequences";
pub const META_APPLIED: &str = "applied";
