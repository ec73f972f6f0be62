//! Raft type configuration for sliced.
//!
//! Log entries carry the JSON encoding of a [`Command`] rather than the
//! command itself, so that a payload which no longer decodes surfaces as
//! a `CorruptLogEntry` at apply time instead of failing inside the log
//! reader.

use std::io::Cursor;

use openraft::TokioRuntime;
use serde::{Deserialize, Serialize};

use sliced_state::{Applied, Command, TxError, TxResult};

/// Client write request: one encoded command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub payload: String,
}

impl Request {
    pub fn new(command: &Command) -> TxResult<Self> {
        Ok(Self {
            payload: command.encode()?,
        })
    }

    pub fn command(&self) -> TxResult<Command> {
        Command::decode(&self.payload)
    }
}

/// Outcome of applying one entry. Validation and conflict errors are
/// part of the deterministic result, not storage failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub result: Result<Applied, TxError>,
}

impl Response {
    /// Response for entries that carry no command.
    pub fn noop() -> Self {
        Self {
            result: Ok(Applied::unchanged()),
        }
    }
}

openraft::declare_raft_types!(
    /// sliced Raft type configuration.
    pub TypeConfig:
        D = Request,
        R = Response,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type SlicedRaft = openraft::Raft<TypeConfig>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wraps_encoded_command() {
        let cmd = Command::CreateGroup {
            name: "meta".into(),
        };
        let req = Request::new(&cmd).unwrap();
        assert_eq!(req.payload, r#"{"type":"create_group","name":"meta"}"#);
        assert_eq!(req.command().unwrap(), cmd);

        let garbage = Request {
            payload: "{\"type\":".into(),
        };
        assert!(matches!(
            garbage.command(),
            Err(TxError::CorruptLogEntry(_))
        ));
    }

    #[test]
    fn response_carries_tx_errors() {
        let resp = Response {
            result: Err(TxError::StaleSnapshot("ring moved".into())),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }
}
