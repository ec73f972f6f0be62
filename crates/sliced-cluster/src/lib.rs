//! sliced-cluster: apply steps for cluster topology.
//!
//! Every function here takes the committed [`ClusterState`] and one
//! command's arguments, validates the command against the state, and
//! only then mutates it. A returned error always leaves the state
//! untouched.
//!
//! - [`membership`]: node lifecycle and replication-group membership
//! - [`database`]: databases, slices, and slot ring changes
//!
//! [`ClusterState`]: sliced_state::ClusterState

pub mod database;
pub mod membership;

pub use membership::{GroupReport, group_report};
