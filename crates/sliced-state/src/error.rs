//! Error types for the cluster state and its apply step.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sliced_core::*;

use crate::types::SliceId;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Result type alias for command validation and apply.
pub type TxResult<T> = Result<T, TxError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted records do not form a valid cluster state.
    #[error("corrupt state: {0}")]
    Corrupt(String),
}

/// How a caller must react to a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rejected before proposal; never enters the log.
    Validation,
    /// Lost a race against a committed command; re-read state and retry.
    Conflict,
    /// Integrity failure; the affected replica or segment halts.
    Fatal,
    /// Infrastructure failure, retried with backoff.
    Transient,
}

/// Errors raised while validating or applying a [`Command`](crate::Command).
///
/// Validation and conflict errors leave the state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TxError {
    // Validation
    #[error("slot ranges overlap: {0}")]
    RangeOverlap(String),

    #[error("invalid slot range [{low}, {high}) for a ring of {size} slots")]
    InvalidRange { low: Slot, high: Slot, size: u32 },

    #[error("ring coverage broken: {0}")]
    RingCoverage(String),

    #[error("invalid suffrage transition for {node_id}: {from:?} -> {to:?}")]
    InvalidSuffrageTransition {
        node_id: NodeId,
        from: Option<Suffrage>,
        to: Suffrage,
    },

    #[error("node {node_id} is already a member of group {group_id}")]
    AlreadyMember { node_id: NodeId, group_id: GroupId },

    #[error("group {group_id} is already promoting {staging}")]
    MembershipChangeInProgress { group_id: GroupId, staging: NodeId },

    #[error("node {node_id}: {reason}")]
    InvalidLifecycle { node_id: NodeId, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    // Conflict
    #[error("stale snapshot: {0}")]
    StaleSnapshot(String),

    #[error("stale term for {node_id} in group {group_id}: reported {reported}, known {known}")]
    StaleTerm {
        group_id: GroupId,
        node_id: NodeId,
        reported: u64,
        known: u64,
    },

    #[error("group {group_id} already has leader {leader} in term {term}")]
    DuplicateLeader {
        group_id: GroupId,
        leader: NodeId,
        term: u64,
    },

    #[error("slice {0} has no active leader")]
    NoActiveSlice(SliceId),

    #[error("rebalance {rebalance} on database {database} is already committed")]
    RebalanceCommitted {
        database: DatabaseId,
        rebalance: RebalanceId,
    },

    // Fatal
    #[error("corrupt log entry: {0}")]
    CorruptLogEntry(String),

    #[error("corrupt state: {0}")]
    CorruptState(String),
}

impl TxError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TxError::RangeOverlap(_)
            | TxError::InvalidRange { .. }
            | TxError::RingCoverage(_)
            | TxError::InvalidSuffrageTransition { .. }
            | TxError::AlreadyMember { .. }
            | TxError::MembershipChangeInProgress { .. }
            | TxError::InvalidLifecycle { .. }
            | TxError::NotFound(_)
            | TxError::AlreadyExists(_)
            | TxError::InvalidCommand(_) => ErrorClass::Validation,
            TxError::StaleSnapshot(_)
            | TxError::StaleTerm { .. }
            | TxError::DuplicateLeader { .. }
            | TxError::NoActiveSlice(_)
            | TxError::RebalanceCommitted { .. } => ErrorClass::Conflict,
            TxError::CorruptLogEntry(_) | TxError::CorruptState(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        assert_eq!(
            TxError::RangeOverlap("x".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(
            TxError::StaleSnapshot("x".into()).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            TxError::NoActiveSlice(SliceId::new(1, 0)).class(),
            ErrorClass::Conflict
        );
        assert!(TxError::CorruptLogEntry("x".into()).is_fatal());
    }

    #[test]
    fn tx_errors_cross_the_wire() {
        let err = TxError::InvalidSuffrageTransition {
            node_id: "n1".into(),
            from: Some(Suffrage::NonVoter),
            to: Suffrage::Voter,
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: TxError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(
            err.to_string(),
            "invalid suffrage transition for n1: Some(NonVoter) -> Voter"
        );
    }
}
