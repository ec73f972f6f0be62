//! sliced rebalance planning.
//!
//! This crate decides how slot ownership should move between slices.
//! It never mutates the ring itself: it reads a committed snapshot and
//! produces a `ChangeRing` command that the replicated log applies.
//!
//! # Components
//!
//! - **`target`**: Target ring builders (balanced, spread, split, merge)
//! - **`planner`**: Partition diff into a minimal `Rebalance`
//! - **`tracker`**: Follows proposed rebalances through to commit

pub mod planner;
pub mod target;
pub mod tracker;

pub use planner::{RebalancePlan, diff, plan_rebalance};
pub use tracker::{RebalancePhase, RebalanceProgress, RebalanceTracker};
