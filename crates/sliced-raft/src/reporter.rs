//! Feeds local Raft metrics back into the replicated state.
//!
//! Each node reports its own status, term and applied index for every
//! group it belongs to as a `ReportMember` command. Reports are
//! throttled: a new one is sent when the status or term changes, or when
//! the applied index has advanced by at least `applied_step`. Since each
//! report itself advances the applied index by one, a step of one would
//! report forever.

use std::collections::BTreeMap;
use std::sync::Arc;

use openraft::{BasicNode, RaftMetrics, ServerState};
use tokio::sync::watch;
use tracing::{debug, warn};

use sliced_core::{GroupId, NodeId, RaftStatus};
use sliced_state::{ClusterState, Command, ErrorClass};

use crate::consensus::Consensus;

/// Smallest step that does not feed back on itself.
const MIN_APPLIED_STEP: u64 = 2;

pub fn status_of(state: ServerState) -> RaftStatus {
    match state {
        ServerState::Leader => RaftStatus::Leader,
        ServerState::Candidate => RaftStatus::Candidate,
        ServerState::Follower | ServerState::Learner => RaftStatus::Follower,
        ServerState::Shutdown => RaftStatus::Shutdown,
    }
}

/// What this node last told the cluster about one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    pub status: RaftStatus,
    pub term: u64,
    pub applied: u64,
}

impl Observed {
    pub fn from_metrics(metrics: &RaftMetrics<u64, BasicNode>) -> Self {
        Self {
            status: status_of(metrics.state),
            term: metrics.current_term,
            applied: metrics.last_applied.map_or(0, |l| l.index),
        }
    }
}

pub struct MemberReporter<C: ?Sized> {
    consensus: Arc<C>,
    node_id: NodeId,
    applied_step: u64,
    last: BTreeMap<GroupId, Observed>,
}

impl<C: Consensus + ?Sized> MemberReporter<C> {
    pub fn new(consensus: Arc<C>, node_id: impl Into<NodeId>, applied_step: u64) -> Self {
        Self {
            consensus,
            node_id: node_id.into(),
            applied_step: applied_step.max(MIN_APPLIED_STEP),
            last: BTreeMap::new(),
        }
    }

    fn should_report(&self, group_id: GroupId, next: &Observed) -> bool {
        match self.last.get(&group_id) {
            None => true,
            Some(prev) => {
                prev.status != next.status
                    || prev.term != next.term
                    || next.applied >= prev.applied + self.applied_step
            }
        }
    }

    /// Reports due for `observed` against the groups `state` lists this
    /// node in.
    pub fn due(&self, state: &ClusterState, observed: &Observed) -> Vec<Command> {
        state
            .groups_of(&self.node_id)
            .into_iter()
            .filter(|&group_id| self.should_report(group_id, observed))
            .map(|group_id| Command::ReportMember {
                group_id,
                node_id: self.node_id.clone(),
                status: observed.status,
                term: observed.term,
                applied: observed.applied,
            })
            .collect()
    }

    /// Send every due report. Returns how many were accepted.
    pub async fn report(&mut self, observed: Observed) -> usize {
        let state = self.consensus.snapshot();
        let mut accepted = 0;
        for command in self.due(&state, &observed) {
            let Command::ReportMember { group_id, .. } = &command else {
                continue;
            };
            let group_id = *group_id;
            match self.consensus.propose(command).await {
                Ok(_) => {
                    accepted += 1;
                    self.last.insert(group_id, observed);
                }
                Err(e) if e.class() == ErrorClass::Transient => {
                    warn!(group_id, error = %e, "member report failed, will retry");
                }
                Err(e) => {
                    // Stale or superseded; wait for the next change.
                    debug!(group_id, error = %e, "member report not applied");
                    self.last.insert(group_id, observed);
                }
            }
        }
        accepted
    }

    pub async fn run(
        mut self,
        mut metrics: watch::Receiver<RaftMetrics<u64, BasicNode>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(node_id = %self.node_id, step = self.applied_step, "member reporter started");
        loop {
            let observed = Observed::from_metrics(&metrics.borrow_and_update());
            self.report(observed).await;

            tokio::select! {
                changed = metrics.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(node_id = %self.node_id, "member reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliced_core::Suffrage;
    use sliced_state::Node;

    use crate::consensus::DirectConsensus;

    async fn cluster() -> Arc<DirectConsensus> {
        let consensus = Arc::new(DirectConsensus::default());
        for command in [
            Command::InitNode {
                node: Node {
                    id: "n1".into(),
                    host: "n1.local".into(),
                    ..Default::default()
                },
                at: 1,
            },
            Command::CreateGroup { name: "meta".into() },
            Command::AddNodeToGroup {
                node_id: "n1".into(),
                group_id: 1,
                suffrage: Suffrage::Voter,
                bootstrap: true,
                address: "n1.local".into(),
            },
        ] {
            consensus.propose(command).await.unwrap();
        }
        consensus
    }

    fn observed(status: RaftStatus, term: u64, applied: u64) -> Observed {
        Observed {
            status,
            term,
            applied,
        }
    }

    #[test]
    fn learners_report_as_followers() {
        assert_eq!(status_of(ServerState::Learner), RaftStatus::Follower);
        assert_eq!(status_of(ServerState::Leader), RaftStatus::Leader);
    }

    #[tokio::test]
    async fn reports_are_throttled() {
        let consensus = cluster().await;
        let mut reporter = MemberReporter::new(Arc::clone(&consensus), "n1", 10);

        assert_eq!(reporter.report(observed(RaftStatus::Leader, 1, 3)).await, 1);
        let member = consensus.snapshot().groups[&1].members[0].clone();
        assert_eq!(member.status, RaftStatus::Leader);
        assert_eq!(member.applied, 3);

        // Small applied advances are absorbed.
        assert_eq!(reporter.report(observed(RaftStatus::Leader, 1, 8)).await, 0);
        assert_eq!(reporter.report(observed(RaftStatus::Leader, 1, 13)).await, 1);
        // A term change always reports.
        assert_eq!(reporter.report(observed(RaftStatus::Leader, 2, 14)).await, 1);
    }

    #[tokio::test]
    async fn nothing_is_due_outside_any_group() {
        let consensus = cluster().await;
        let reporter = MemberReporter::new(Arc::clone(&consensus), "n9", 0);
        assert_eq!(reporter.applied_step, MIN_APPLIED_STEP);
        let state = consensus.snapshot();
        assert!(reporter.due(&state, &observed(RaftStatus::Leader, 1, 1)).is_empty());
    }
}
