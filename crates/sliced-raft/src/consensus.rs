//! Proposing commands.
//!
//! Every caller that wants to change [`ClusterState`] goes through a
//! [`Consensus`]. A command is first checked against the latest local
//! snapshot; validation failures are returned without touching the log.
//! Conflicts are left for apply to decide, since the snapshot may be
//! behind the leader.
//!
//! [`RaftConsensus`] replicates through openraft. [`DirectConsensus`]
//! applies in-process against a single in-memory log and is used by the
//! standalone daemon and by tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use sliced_state::{Applied, ClusterState, Command, ErrorClass, Event};

use crate::apply::{apply, check};
use crate::error::ProposeError;
use crate::network::Router;
use crate::state_machine::Publisher;
use crate::typ::{Request, SlicedRaft};

/// Where a committed command landed and what it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub index: u64,
    pub applied: Applied,
}

#[async_trait]
pub trait Consensus: Send + Sync {
    /// Propose `command` and wait until it is applied locally.
    async fn propose(&self, command: Command) -> Result<Receipt, ProposeError>;

    fn subscribe(&self) -> broadcast::Receiver<Event>;

    fn watch(&self) -> watch::Receiver<Arc<ClusterState>>;

    /// Latest committed state.
    fn snapshot(&self) -> Arc<ClusterState> {
        self.watch().borrow().clone()
    }
}

/// Reject `command` if it cannot pass validation against `state`.
pub fn precheck(state: &ClusterState, command: &Command) -> Result<(), ProposeError> {
    match check(state, command) {
        Err(e) if e.class() == ErrorClass::Validation => {
            debug!(kind = command.kind(), error = %e, "proposal rejected");
            Err(ProposeError::Rejected(e))
        }
        _ => Ok(()),
    }
}

pub struct RaftConsensus {
    raft: SlicedRaft,
    publisher: Publisher,
    router: Option<Router>,
}

impl RaftConsensus {
    pub fn new(raft: SlicedRaft, publisher: Publisher) -> Self {
        Self {
            raft,
            publisher,
            router: None,
        }
    }

    /// Forward proposals to the leader when it is reachable through
    /// `router`.
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn raft(&self) -> &SlicedRaft {
        &self.raft
    }

    async fn write(raft: &SlicedRaft, request: Request) -> Result<Receipt, ProposeError> {
        let response = raft.client_write(request).await?;
        let index = response.log_id.index;
        match response.data.result {
            Ok(applied) => Ok(Receipt { index, applied }),
            Err(e) => Err(ProposeError::Rejected(e)),
        }
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    async fn propose(&self, command: Command) -> Result<Receipt, ProposeError> {
        precheck(&self.publisher.snapshot(), &command)?;
        let request = Request::new(&command)?;

        match Self::write(&self.raft, request.clone()).await {
            Err(ProposeError::ForwardToLeader {
                leader: Some(leader),
            }) => {
                let Some(raft) = self.router.as_ref().and_then(|r| r.get(leader)) else {
                    return Err(ProposeError::ForwardToLeader {
                        leader: Some(leader),
                    });
                };
                debug!(leader, kind = command.kind(), "forwarding proposal");
                Self::write(&raft, request).await
            }
            other => other,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.publisher.subscribe()
    }

    fn watch(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.publisher.watch()
    }
}

#[derive(Default)]
struct DirectLog {
    state: Arc<ClusterState>,
    entries: Vec<Command>,
}

/// Single-process consensus: every proposal is committed immediately.
pub struct DirectConsensus {
    log: Mutex<DirectLog>,
    publisher: Publisher,
}

impl DirectConsensus {
    pub fn new(publisher: Publisher) -> Self {
        let state = publisher.snapshot();
        Self {
            log: Mutex::new(DirectLog {
                state,
                entries: Vec::new(),
            }),
            publisher,
        }
    }

    /// Every command accepted so far, in log order.
    pub fn entries(&self) -> Vec<Command> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.entries.clone()
    }
}

impl Default for DirectConsensus {
    fn default() -> Self {
        Self::new(Publisher::new(ClusterState::default(), 1024))
    }
}

#[async_trait]
impl Consensus for DirectConsensus {
    async fn propose(&self, command: Command) -> Result<Receipt, ProposeError> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        precheck(&log.state, &command)?;

        log.entries.push(command.clone());
        let index = log.entries.len() as u64;
        match apply(Arc::make_mut(&mut log.state), &command) {
            Ok(applied) => {
                self.publisher
                    .publish(Arc::clone(&log.state), applied.events.clone());
                Ok(Receipt { index, applied })
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!(index, error = %e, "direct log hit a fatal error");
                }
                // Rejected entries still occupy their slot in the log.
                self.publisher.publish(Arc::clone(&log.state), Vec::new());
                Err(ProposeError::Rejected(e))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.publisher.subscribe()
    }

    fn watch(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.publisher.watch()
    }
}
