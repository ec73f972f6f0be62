//! Consensus-layer errors.

use openraft::error::{ClientWriteError, RaftError};
use openraft::{BasicNode, ErrorSubject, ErrorVerb, LogId, StorageError};
use thiserror::Error;

use sliced_state::{ErrorClass, TxError};

pub(crate) fn read_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

pub(crate) fn write_err(e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Store,
        ErrorVerb::Write,
        std::io::Error::other(e.to_string()),
    )
}

/// A log entry that cannot be applied; the replica must halt.
pub(crate) fn apply_err(log_id: LogId<u64>, e: impl std::fmt::Display) -> StorageError<u64> {
    StorageError::from_io_error(
        ErrorSubject::Apply(log_id),
        ErrorVerb::Read,
        std::io::Error::other(e.to_string()),
    )
}

/// Why a proposal did not produce a receipt.
#[derive(Debug, Error)]
pub enum ProposeError {
    /// Refused by validation before proposing, or by apply after commit.
    #[error(transparent)]
    Rejected(#[from] TxError),

    #[error("not the leader (leader: {leader:?})")]
    ForwardToLeader { leader: Option<u64> },

    #[error("consensus unavailable: {0}")]
    Unavailable(String),
}

impl ProposeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProposeError::Rejected(e) => e.class(),
            ProposeError::ForwardToLeader { .. } => ErrorClass::Conflict,
            ProposeError::Unavailable(_) => ErrorClass::Transient,
        }
    }
}

impl From<RaftError<u64, ClientWriteError<u64, BasicNode>>> for ProposeError {
    fn from(e: RaftError<u64, ClientWriteError<u64, BasicNode>>) -> Self {
        match e {
            RaftError::APIError(ClientWriteError::ForwardToLeader(f)) => {
                ProposeError::ForwardToLeader {
                    leader: f.leader_id,
                }
            }
            other => ProposeError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::error::ForwardToLeader;

    #[test]
    fn forward_to_leader_is_a_conflict() {
        let raft_err: RaftError<u64, ClientWriteError<u64, BasicNode>> =
            RaftError::APIError(ClientWriteError::ForwardToLeader(ForwardToLeader {
                leader_id: Some(7),
                leader_node: None,
            }));
        let err = ProposeError::from(raft_err);
        assert!(matches!(err, ProposeError::ForwardToLeader { leader: Some(7) }));
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[test]
    fn rejected_keeps_tx_class() {
        let err = ProposeError::from(TxError::StaleSnapshot("moved".into()));
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(err.to_string(), "stale snapshot: moved");
    }
}
