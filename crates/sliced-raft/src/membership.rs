//! Drives openraft membership from the replicated group record.
//!
//! Suffrage changes commit as state first. The leader then brings
//! openraft's own membership in line with the group: voters become Raft
//! voters, non-voters and staging members become learners, and nodes the
//! group no longer lists are removed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use openraft::{BasicNode, ChangeMembers, ServerState};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sliced_core::{GroupId, Suffrage};
use sliced_state::{ClusterState, Event, StateResult};

use crate::node_map::NodeIdMap;
use crate::typ::SlicedRaft;

/// Raft membership a group record asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredMembership {
    pub voters: BTreeSet<u64>,
    /// Every member, voters included.
    pub nodes: BTreeMap<u64, BasicNode>,
}

impl DesiredMembership {
    /// `None` while the group is unknown or has no voter yet.
    pub fn of(
        state: &ClusterState,
        group_id: GroupId,
        node_map: &NodeIdMap,
    ) -> StateResult<Option<Self>> {
        let Some(group) = state.groups.get(&group_id) else {
            return Ok(None);
        };
        let mut desired = Self::default();
        for member in &group.members {
            let raft_id = node_map.resolve(&member.id)?;
            if member.suffrage == Suffrage::Voter {
                desired.voters.insert(raft_id);
            }
            desired
                .nodes
                .insert(raft_id, BasicNode::new(&member.address));
        }
        if desired.voters.is_empty() {
            return Ok(None);
        }
        Ok(Some(desired))
    }
}

/// One openraft membership call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipStep {
    AddLearner(u64, BasicNode),
    /// Replace the voter set; dropped voters leave the cluster.
    ReplaceVoters(BTreeSet<u64>),
    RemoveNodes(BTreeSet<u64>),
}

/// Calls taking a membership of `voters` over `nodes` to `desired`, in
/// the order they must run: learners are added before they can vote.
pub fn plan_membership(
    voters: &BTreeSet<u64>,
    nodes: &BTreeSet<u64>,
    desired: &DesiredMembership,
) -> Vec<MembershipStep> {
    let mut steps: Vec<MembershipStep> = desired
        .nodes
        .iter()
        .filter(|(id, _)| !nodes.contains(id))
        .map(|(id, node)| MembershipStep::AddLearner(*id, node.clone()))
        .collect();
    if *voters != desired.voters {
        steps.push(MembershipStep::ReplaceVoters(desired.voters.clone()));
    }
    let stale: BTreeSet<u64> = nodes
        .iter()
        .filter(|id| !desired.nodes.contains_key(id) && !voters.contains(id))
        .copied()
        .collect();
    if !stale.is_empty() {
        steps.push(MembershipStep::RemoveNodes(stale));
    }
    steps
}

pub struct MembershipReconciler {
    raft: SlicedRaft,
    node_map: Arc<NodeIdMap>,
    group_id: GroupId,
}

impl MembershipReconciler {
    pub fn new(raft: SlicedRaft, node_map: Arc<NodeIdMap>, group_id: GroupId) -> Self {
        Self {
            raft,
            node_map,
            group_id,
        }
    }

    /// Current voters and nodes as this replica's Raft sees them.
    fn current(&self) -> (BTreeSet<u64>, BTreeSet<u64>) {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let membership = metrics.membership_config.membership();
        (
            membership.voter_ids().collect(),
            membership.nodes().map(|(id, _)| *id).collect(),
        )
    }

    fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == ServerState::Leader
    }

    /// Make Raft membership match `state`. Only the leader acts; a failed
    /// call stops the round and the next one starts over. Returns how many
    /// calls succeeded.
    pub async fn reconcile(&self, state: &ClusterState) -> usize {
        if !self.is_leader() {
            return 0;
        }
        let desired = match DesiredMembership::of(state, self.group_id, &self.node_map) {
            Ok(Some(desired)) => desired,
            Ok(None) => return 0,
            Err(e) => {
                warn!(group_id = self.group_id, error = %e, "cannot map group members to raft ids");
                return 0;
            }
        };
        let (voters, nodes) = self.current();
        let mut done = 0;
        for step in plan_membership(&voters, &nodes, &desired) {
            let result = match &step {
                MembershipStep::AddLearner(id, node) => self
                    .raft
                    .add_learner(*id, node.clone(), false)
                    .await
                    .map(|_| ()),
                MembershipStep::ReplaceVoters(voters) => self
                    .raft
                    .change_membership(voters.clone(), false)
                    .await
                    .map(|_| ()),
                MembershipStep::RemoveNodes(ids) => self
                    .raft
                    .change_membership(ChangeMembers::RemoveNodes(ids.clone()), false)
                    .await
                    .map(|_| ()),
            };
            match result {
                Ok(()) => {
                    info!(group_id = self.group_id, ?step, "raft membership changed");
                    done += 1;
                }
                Err(e) => {
                    warn!(group_id = self.group_id, ?step, error = %e, "raft membership change failed, will retry");
                    break;
                }
            }
        }
        done
    }

    /// Reconcile on every member change of this group and every `period`,
    /// which also covers a freshly elected leader.
    pub async fn run(
        self,
        period: Duration,
        mut events: broadcast::Receiver<Event>,
        snapshots: watch::Receiver<Arc<ClusterState>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(group_id = self.group_id, "membership reconciler started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                received = events.recv() => match received {
                    Ok(Event::MemberChanged { group_id, .. }) if group_id == self.group_id => {}
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "membership reconciler lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
            let state = snapshots.borrow().clone();
            self.reconcile(&state).await;
        }
        debug!(group_id = self.group_id, "membership reconciler stopped");
    }
}
