//! In-process Raft transport.
//!
//! The wire transport is outside this crate, so peers are reached
//! through a shared [`Router`] that hands each RPC straight to the
//! target's `Raft` handle. A node that is not registered (stopped,
//! partitioned in a test) is reported as unreachable.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use openraft::error::{InstallSnapshotError, RPCError, RaftError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use tracing::debug;

use crate::typ::{SlicedRaft, TypeConfig};

/// Registry of the Raft handles reachable from this process.
#[derive(Clone, Default)]
pub struct Router {
    nodes: Arc<RwLock<BTreeMap<u64, SlicedRaft>>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u64, raft: SlicedRaft) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.insert(id, raft);
        debug!(id, "raft node registered");
    }

    pub fn unregister(&self, id: u64) -> Option<SlicedRaft> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        let removed = nodes.remove(&id);
        debug!(id, found = removed.is_some(), "raft node unregistered");
        removed
    }

    pub fn get(&self, id: u64) -> Option<SlicedRaft> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes.get(&id).cloned()
    }
}

/// A connection to one peer through the router.
pub struct Connection {
    target: u64,
    router: Router,
}

impl Connection {
    fn peer<E: std::error::Error>(&self) -> Result<SlicedRaft, RPCError<u64, BasicNode, E>> {
        self.router.get(self.target).ok_or_else(|| {
            RPCError::Unreachable(Unreachable::new(&std::io::Error::other(format!(
                "raft node {} is not registered",
                self.target
            ))))
        })
    }

    fn remote<E: std::error::Error>(&self, e: RaftError<u64, E>) -> RPCError<u64, BasicNode, RaftError<u64, E>> {
        RPCError::RemoteError(RemoteError::new(self.target, e))
    }
}

impl RaftNetworkFactory<TypeConfig> for Router {
    type Network = Connection;

    async fn new_client(&mut self, target: u64, _node: &BasicNode) -> Self::Network {
        Connection {
            target,
            router: self.clone(),
        }
    }
}

impl RaftNetwork<TypeConfig> for Connection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let peer = self.peer()?;
        peer.append_entries(rpc).await.map_err(|e| self.remote(e))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        let peer = self.peer()?;
        peer.install_snapshot(rpc).await.map_err(|e| self.remote(e))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let peer = self.peer()?;
        peer.vote(rpc).await.map_err(|e| self.remote(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_peers_are_unreachable() {
        let mut router = Router::new();
        let conn = router.new_client(7, &BasicNode::new("n7")).await;
        assert_eq!(conn.target, 7);
        let err = conn.peer::<RaftError<u64>>().err().unwrap();
        assert!(matches!(err, RPCError::Unreachable(_)));
        assert!(router.unregister(7).is_none());
    }
}
