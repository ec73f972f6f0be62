//! Raft state machine over [`ClusterState`].
//!
//! Committed entries are applied in log order through the dispatcher.
//! The state is copied at most once per batch (copy-on-write against the
//! snapshot readers hold). After each batch the records that changed are
//! persisted to the [`StateStore`] in one write transaction together with
//! the last applied log id and the Raft membership, then published: the
//! new `Arc<ClusterState>` on a `watch` channel and the batch's events on
//! a `broadcast` channel.

use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, Snapshot, SnapshotMeta, StorageError,
    StoredMembership,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use sliced_state::{ClusterState, Event, StateStore, TxError};

use crate::apply::apply;
use crate::error::{apply_err, read_err, write_err};
use crate::typ::{Response, TypeConfig};

/// Fan-out of committed state to local readers.
#[derive(Debug, Clone)]
pub struct Publisher {
    snapshots: watch::Sender<Arc<ClusterState>>,
    events: broadcast::Sender<Event>,
}

impl Publisher {
    pub fn new(initial: ClusterState, capacity: usize) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(initial));
        let (events, _) = broadcast::channel(capacity);
        Self { snapshots, events }
    }

    pub fn snapshot(&self) -> Arc<ClusterState> {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.snapshots.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn publish(&self, state: Arc<ClusterState>, events: Vec<Event>) {
        self.snapshots.send_replace(state);
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

/// Persisted alongside the state as the store's applied marker.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AppliedMarker {
    last_applied: Option<LogId<u64>>,
    membership: StoredMembership<u64, BasicNode>,
}

pub struct StateMachine {
    store: StateStore,
    /// Always equal to what `store` holds between batches.
    state: Arc<ClusterState>,
    marker: AppliedMarker,
    publisher: Publisher,
}

/// Builds a snapshot from a frozen copy of the state.
pub struct SmSnapshotBuilder {
    state: Arc<ClusterState>,
    last_applied: Option<LogId<u64>>,
    membership: StoredMembership<u64, BasicNode>,
}

impl StateMachine {
    /// Open the state machine over `store`, resuming from whatever it
    /// last persisted.
    pub fn open(store: StateStore, publisher: Publisher) -> Result<Self, StorageError<u64>> {
        let state = Arc::new(store.load_state().map_err(read_err)?);
        let marker = match store.applied().map_err(read_err)? {
            Some(data) => serde_json::from_slice(&data).map_err(read_err)?,
            None => AppliedMarker::default(),
        };
        info!(
            applied = ?marker.last_applied,
            nodes = state.nodes.len(),
            databases = state.databases.len(),
            "state machine opened"
        );
        publisher.publish(Arc::clone(&state), Vec::new());
        Ok(Self {
            store,
            state,
            marker,
            publisher,
        })
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    /// Persist the current state over `prev`, the state last persisted.
    fn persist(&self, prev: &ClusterState) -> Result<(), StorageError<u64>> {
        let marker = serde_json::to_vec(&self.marker).map_err(write_err)?;
        self.store
            .save_changes(prev, &self.state, Some(&marker))
            .map_err(write_err)
    }

    fn builder(&self) -> SmSnapshotBuilder {
        SmSnapshotBuilder {
            state: Arc::clone(&self.state),
            last_applied: self.marker.last_applied,
            membership: self.marker.membership.clone(),
        }
    }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SmSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        Ok((self.marker.last_applied, self.marker.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();
        let mut events = Vec::new();
        let prev = Arc::clone(&self.state);

        for entry in entries {
            let log_id = entry.log_id;
            let response = match entry.payload {
                EntryPayload::Blank => Response::noop(),
                EntryPayload::Normal(req) => {
                    let command = match req.command() {
                        Ok(command) => command,
                        Err(e) => {
                            error!(index = log_id.index, error = %e, "undecodable log entry");
                            self.state = prev;
                            return Err(apply_err(log_id, e));
                        }
                    };
                    // Copies only on the first command of the batch.
                    let result = apply(Arc::make_mut(&mut self.state), &command);
                    match &result {
                        Ok(applied) => events.extend(applied.events.iter().cloned()),
                        Err(e) if e.is_fatal() => {
                            self.state = prev;
                            return Err(apply_err(log_id, e));
                        }
                        Err(_) => {}
                    }
                    Response { result }
                }
                EntryPayload::Membership(membership) => {
                    self.marker.membership = StoredMembership::new(Some(log_id), membership);
                    Response::noop()
                }
            };
            self.marker.last_applied = Some(log_id);
            responses.push(response);
        }

        self.persist(&prev)?;
        debug!(
            applied = ?self.marker.last_applied,
            entries = responses.len(),
            events = events.len(),
            "batch applied"
        );
        self.publisher.publish(Arc::clone(&self.state), events);
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.builder()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let state: ClusterState =
            serde_json::from_slice(snapshot.get_ref()).map_err(read_err)?;
        state
            .validate()
            .map_err(|e: TxError| read_err(format!("snapshot {}: {e}", meta.snapshot_id)))?;

        let prev = std::mem::replace(&mut self.state, Arc::new(state));
        self.marker = AppliedMarker {
            last_applied: meta.last_log_id,
            membership: meta.last_membership.clone(),
        };
        self.persist(&prev)?;
        self.publisher.publish(Arc::clone(&self.state), Vec::new());
        info!(snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        if self.marker.last_applied.is_none() {
            return Ok(None);
        }
        Ok(Some(self.builder().build_snapshot().await?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let data = serde_json::to_vec(self.state.as_ref()).map_err(read_err)?;
        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.membership.clone(),
            snapshot_id: format!("snap-{}", self.last_applied.map_or(0, |l| l.index)),
        };
        debug!(snapshot_id = %meta.snapshot_id, bytes = data.len(), "snapshot built");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}
