// openraft's StorageError is large and returned everywhere; allow it.
#![allow(clippy::result_large_err)]

//! Consensus layer for sliced: openraft + redb.
//!
//! One Raft group replicates the whole [`ClusterState`](sliced_state::ClusterState).
//! Log entries carry encoded [`Command`](sliced_state::Command)s and the
//! state machine applies them through a single deterministic dispatcher.
//!
//! # Architecture
//!
//! - **`typ`**: type configuration (`TypeConfig`, `Request`, `Response`)
//! - **`apply`**: command dispatcher shared by every replica and by replay
//! - **`log_store`**: per-group Raft log in redb
//! - **`state_machine`**: applies committed entries, persists and publishes
//! - **`network`**: in-process transport between Raft handles
//! - **`node_map`**: stable u64 Raft ids for string node ids
//! - **`consensus`**: the proposal surface (`RaftConsensus`, `DirectConsensus`)
//! - **`reporter`**: feeds local Raft metrics back as member reports
//! - **`membership`**: makes openraft membership follow group suffrage

pub mod apply;
pub mod consensus;
pub mod error;
pub mod log_store;
pub mod membership;
pub mod network;
pub mod node_map;
pub mod reporter;
pub mod state_machine;
pub mod typ;

pub use apply::{apply, check, replay};
pub use consensus::{Consensus, DirectConsensus, RaftConsensus, Receipt, precheck};
pub use error::ProposeError;
pub use log_store::LogStore;
pub use membership::{DesiredMembership, MembershipReconciler, MembershipStep, plan_membership};
pub use network::Router;
pub use node_map::NodeIdMap;
pub use reporter::{MemberReporter, Observed};
pub use state_machine::{Publisher, StateMachine};
pub use typ::{Request, Response, SlicedRaft, TypeConfig};
