//! sliced-segment: topics, queues, and their append segments.
//!
//! # Components
//!
//! - **`lifecycle`**: Apply steps for rollers, topics, queues, segments
//! - **`policy`**: Roller threshold evaluation (mandatory vs advisory)
//! - **`roller`**: Per-topic roller state machine that proposes `Roll`
//! - **`blob`**: Path-addressed blob store with hash verification
//! - **`provisioner`**: Post-commit segment file I/O with backoff
//!
//! Apply steps never touch the disk. Segment files are created and
//! removed after commit by the provisioner, which retries on failure
//! and never rolls back the log.

pub mod blob;
pub mod lifecycle;
pub mod policy;
pub mod provisioner;
pub mod roller;

pub use blob::{BlobError, BlobStore, LocalBlobStore};
pub use policy::{RollDecision, SealReason};
pub use provisioner::{Backoff, Provisioner};
pub use roller::{AppendedRecord, RollerSet, SegmentPlacement, TopicRoller};
