//! sliced-state: replicated cluster state for sliced.
//!
//! Holds the domain records (nodes, groups, databases, slices, topics,
//! queues, segments), the per-database [`SlotRing`], the [`Command`]
//! and [`Event`] types carried by the replicated log, and the error
//! taxonomy shared by every apply step.
//!
//! # Persistence
//!
//! [`StateStore`] is backed by [redb](https://docs.rs/redb). All records
//! are JSON-serialized into `&[u8]` value columns. A whole
//! [`ClusterState`] is written in one write transaction together with
//! the last applied log id, so the two can never diverge on crash.

pub mod cluster;
pub mod error;
pub mod ring;
pub mod store;
pub mod tables;
pub mod tx;
pub mod types;

pub use cluster::{ClusterState, Sequences};
pub use error::{ErrorClass, StateError, StateResult, TxError, TxResult};
pub use ring::{RingChange, SliceSlots, SlotRange, SlotRing};
pub use store::StateStore;
pub use tx::{Applied, Command, Event, NewSegment, Outcome};
pub use types::*;
