//! Background loops that observe committed state and propose follow-up
//! commands.
//!
//! Only the metadata leader proposes; followers keep their roller state
//! aligned with the snapshot so they can take over after an election.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use openraft::{BasicNode, RaftMetrics};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sliced_core::{DatabaseId, SliceNum, Timestamp};
use sliced_placement::{RebalanceTracker, plan_rebalance, target};
use sliced_raft::{Consensus, ProposeError, Receipt};
use sliced_segment::RollerSet;
use sliced_state::{ClusterState, Command, ErrorClass, Event, RingLayout, SlotRing, TxResult};

/// How long a proposed rebalance may stay unresolved before the database
/// is planned again.
const PENDING_TIMEOUT_MS: Timestamp = 60_000;

pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or_default()
}

/// Whether this node should be proposing.
#[derive(Clone)]
pub enum Leadership {
    Raft {
        metrics: watch::Receiver<RaftMetrics<u64, BasicNode>>,
        id: u64,
    },
    #[cfg_attr(not(test), allow(dead_code))]
    Always,
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        match self {
            Leadership::Raft { metrics, id } => metrics.borrow().current_leader == Some(*id),
            Leadership::Always => true,
        }
    }
}

async fn submit<C: Consensus + ?Sized>(
    consensus: &C,
    command: Command,
) -> Result<Receipt, ProposeError> {
    let kind = command.kind();
    match consensus.propose(command).await {
        Ok(receipt) => {
            debug!(kind, index = receipt.index, outcome = ?receipt.applied.outcome, "proposal applied");
            Ok(receipt)
        }
        Err(e) => {
            match e.class() {
                ErrorClass::Validation | ErrorClass::Conflict => {
                    debug!(kind, error = %e, "proposal not applied")
                }
                ErrorClass::Fatal | ErrorClass::Transient => {
                    warn!(kind, error = %e, "proposal failed")
                }
            }
            Err(e)
        }
    }
}

/// Seals segments and opens missing ones.
pub struct RollerTask<C: ?Sized> {
    consensus: Arc<C>,
    rollers: RollerSet,
    leadership: Leadership,
}

impl<C: Consensus + ?Sized> RollerTask<C> {
    pub fn new(consensus: Arc<C>, rollers: RollerSet, leadership: Leadership) -> Self {
        Self {
            consensus,
            rollers,
            leadership,
        }
    }

    /// One pass over the latest snapshot. Returns accepted proposals.
    pub async fn sweep(&mut self, now: Timestamp) -> usize {
        let state = self.consensus.snapshot();
        self.rollers.sync(&state);
        if !self.leadership.is_leader() {
            return 0;
        }

        let mut commands = self.rollers.missing_segments(&state, now);
        commands.extend(self.rollers.tick(now));

        let mut accepted = 0;
        for command in commands {
            let rolling = match &command {
                Command::Roll { topic_id, .. } => Some(*topic_id),
                _ => None,
            };
            match submit(self.consensus.as_ref(), command).await {
                Ok(_) => accepted += 1,
                Err(_) => {
                    if let Some(topic_id) = rolling {
                        self.rollers.unseal(topic_id);
                    }
                }
            }
        }
        accepted
    }

    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?period, "segment roller started");
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(now_ms()).await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("segment roller stopped");
    }
}

/// Steers each database's ring towards its layout.
pub struct Rebalancer<C: ?Sized> {
    consensus: Arc<C>,
    tracker: RebalanceTracker,
    leadership: Leadership,
}

impl<C: Consensus + ?Sized> Rebalancer<C> {
    pub fn new(consensus: Arc<C>, leadership: Leadership) -> Self {
        Self {
            consensus,
            tracker: RebalanceTracker::new(),
            leadership,
        }
    }

    /// Plan and propose at most one rebalance per live database whose ring
    /// is off its layout. Returns accepted proposals.
    pub async fn sweep(&mut self, now: Timestamp) -> usize {
        if !self.leadership.is_leader() {
            return 0;
        }
        self.tracker.expire(now.saturating_sub(PENDING_TIMEOUT_MS));
        let busy: BTreeSet<DatabaseId> =
            self.tracker.pending().iter().map(|p| p.database).collect();
        self.tracker.prune();
        let state = self.consensus.snapshot();

        let mut accepted = 0;
        for (&database, db) in &state.databases {
            if busy.contains(&database) || db.is_dropped() {
                continue;
            }
            let plan = match layout_target(&state, database, db.layout)
                .and_then(|t| match t {
                    Some(t) => plan_rebalance(&state, database, &t, now),
                    None => Ok(None),
                }) {
                Ok(Some(plan)) => plan,
                Ok(None) => continue,
                Err(e) => {
                    warn!(database, layout = ?db.layout, error = %e, "cannot plan rebalance");
                    continue;
                }
            };

            let rebalance = plan.rebalance.timestamp;
            self.tracker.planned(database, &plan.rebalance);
            match submit(self.consensus.as_ref(), plan.command).await {
                Ok(receipt) => {
                    self.tracker
                        .proposed(database, rebalance, receipt.index, receipt.applied.outcome);
                    accepted += 1;
                }
                Err(ProposeError::Rejected(e)) => self.tracker.rejected(database, rebalance, &e),
                // The entry may still commit; the event stream settles it.
                Err(e) => debug!(database, rebalance, error = %e, "rebalance outcome unknown"),
            }
        }
        accepted
    }

    pub async fn run(
        mut self,
        period: Duration,
        mut events: broadcast::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(?period, "rebalancer started");
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep(now_ms()).await;
                }
                event = events.recv() => {
                    if !self.observe(event) {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("rebalancer stopped");
    }

    /// Feed one item of the event stream to the tracker. Returns false
    /// once the stream is closed.
    fn observe(&mut self, event: Result<Event, RecvError>) -> bool {
        match event {
            Ok(event) => self.tracker.observe(&event),
            // Unresolved rebalances expire on their own.
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "rebalancer lagged behind the event stream");
            }
            Err(RecvError::Closed) => return false,
        }
        true
    }
}

/// Ring `database` should converge to under `layout`, or `None` when
/// there is nothing to do.
fn layout_target(
    state: &ClusterState,
    database: DatabaseId,
    layout: RingLayout,
) -> TxResult<Option<SlotRing>> {
    let ring = state.ring(database)?;
    match layout {
        RingLayout::Spread => {
            let wanted: BTreeSet<SliceNum> = state
                .slices
                .get(&database)
                .into_iter()
                .flat_map(|s| s.values())
                .filter(|s| !s.drained)
                .map(|s| s.id.slice)
                .collect();
            if wanted.is_empty() || ring.slices() == wanted {
                return Ok(None);
            }
            target::spread(ring, &wanted).map(Some)
        }
        RingLayout::Split { slice, into } => target::split(ring, slice, into).map(Some),
        RingLayout::Merge { slice, into } => {
            if ring.slot_count(slice) == 0 {
                return Ok(None);
            }
            target::merge(ring, slice, into).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliced_core::{RaftStatus, Suffrage};
    use sliced_placement::RebalancePhase;
    use sliced_raft::DirectConsensus;
    use sliced_segment::SegmentPlacement;
    use sliced_state::{Node, RollerLimits};

    async fn cluster() -> Arc<DirectConsensus> {
        let consensus = Arc::new(DirectConsensus::default());
        let commands = [
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
            Command::ReportMember {
                group_id: 1,
                node_id: "n1".into(),
                status: RaftStatus::Leader,
                term: 1,
                applied: 3,
            },
            Command::CreateDatabase {
                name: "db".into(),
                description: String::new(),
                group_id: 1,
                slices: 1,
                size: 64,
                at: 1,
            },
        ];
        for command in commands {
            consensus.propose(command).await.unwrap();
        }
        consensus
    }

    fn rollers() -> RollerSet {
        RollerSet::new(
            SegmentPlacement {
                volume_id: "n1".into(),
                drive: "d0".into(),
            },
            60_000,
        )
    }

    #[tokio::test]
    async fn rebalancer_spreads_onto_new_slices() {
        let consensus = cluster().await;
        let mut rebalancer = Rebalancer::new(Arc::clone(&consensus), Leadership::Always);
        assert_eq!(rebalancer.sweep(100).await, 0);

        consensus
            .propose(Command::AddSlice {
                database: 1,
                group_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(rebalancer.sweep(200).await, 1);
        assert_eq!(
            rebalancer.tracker.progress(1, 200).map(|p| p.phase.clone()),
            Some(RebalancePhase::Committed)
        );

        let state = consensus.snapshot();
        let ring = state.ring(1).unwrap();
        assert_eq!(ring.slot_count(0), 32);
        assert_eq!(ring.slot_count(1), 32);

        // Balanced now; nothing further to do.
        assert_eq!(rebalancer.sweep(300).await, 0);
    }

    async fn two_slices() -> (Arc<DirectConsensus>, Rebalancer<DirectConsensus>) {
        let consensus = cluster().await;
        let mut rebalancer = Rebalancer::new(Arc::clone(&consensus), Leadership::Always);
        consensus
            .propose(Command::AddSlice {
                database: 1,
                group_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(rebalancer.sweep(200).await, 1);
        (consensus, rebalancer)
    }

    #[tokio::test]
    async fn merged_slices_are_left_alone() {
        let (consensus, mut rebalancer) = two_slices().await;
        consensus
            .propose(Command::SetRingLayout {
                database: 1,
                layout: RingLayout::Merge { slice: 1, into: 0 },
            })
            .await
            .unwrap();
        assert_eq!(rebalancer.sweep(300).await, 1);
        assert_eq!(consensus.snapshot().ring(1).unwrap().slot_count(0), 64);

        // Back to spreading: the drained slice is not handed slots again.
        consensus
            .propose(Command::SetRingLayout {
                database: 1,
                layout: RingLayout::Spread,
            })
            .await
            .unwrap();
        assert_eq!(rebalancer.sweep(400).await, 0);
        let state = consensus.snapshot();
        assert_eq!(state.ring(1).unwrap().slot_count(1), 0);
        assert!(state.slice(sliced_state::SliceId::new(1, 1)).unwrap().drained);
    }

    #[tokio::test]
    async fn split_layout_settles_after_one_rebalance() {
        let (consensus, mut rebalancer) = two_slices().await;
        consensus
            .propose(Command::AddSlice {
                database: 1,
                group_id: 1,
            })
            .await
            .unwrap();
        consensus
            .propose(Command::SetRingLayout {
                database: 1,
                layout: RingLayout::Split { slice: 0, into: 2 },
            })
            .await
            .unwrap();
        assert_eq!(rebalancer.sweep(300).await, 1);
        let ring = consensus.snapshot().ring(1).unwrap().clone();
        assert_eq!(ring.slot_count(0), 16);
        assert_eq!(ring.slot_count(2), 16);
        assert_eq!(rebalancer.sweep(400).await, 0);
    }

    #[tokio::test]
    async fn dropped_databases_are_not_rebalanced() {
        let consensus = cluster().await;
        let mut rebalancer = Rebalancer::new(Arc::clone(&consensus), Leadership::Always);
        consensus
            .propose(Command::AddSlice {
                database: 1,
                group_id: 1,
            })
            .await
            .unwrap();
        consensus
            .propose(Command::DropDatabase {
                database: 1,
                at: 150,
            })
            .await
            .unwrap();
        assert_eq!(rebalancer.sweep(200).await, 0);
    }

    #[tokio::test]
    async fn events_settle_unresolved_rebalances() {
        let consensus = cluster().await;
        let mut rebalancer = Rebalancer::new(Arc::clone(&consensus), Leadership::Always);
        let plan = sliced_state::Rebalance {
            timestamp: 500,
            tasks: Vec::new(),
        };
        rebalancer.tracker.planned(1, &plan);

        assert!(rebalancer.observe(Err(RecvError::Lagged(3))));
        assert_eq!(rebalancer.tracker.pending().len(), 1);
        assert!(rebalancer.observe(Ok(Event::RingChanged {
            database: 1,
            rebalance: 500,
            moved: 0,
        })));
        assert_eq!(
            rebalancer.tracker.progress(1, 500).map(|p| p.phase.clone()),
            Some(RebalancePhase::Committed)
        );
        assert!(!rebalancer.observe(Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn unresolved_rebalances_block_until_they_expire() {
        let consensus = cluster().await;
        let mut rebalancer = Rebalancer::new(Arc::clone(&consensus), Leadership::Always);
        consensus
            .propose(Command::AddSlice {
                database: 1,
                group_id: 1,
            })
            .await
            .unwrap();
        let plan = sliced_state::Rebalance {
            timestamp: 1_000,
            tasks: Vec::new(),
        };
        rebalancer.tracker.planned(1, &plan);
        assert_eq!(rebalancer.sweep(2_000).await, 0);
        assert_eq!(rebalancer.sweep(1_000 + PENDING_TIMEOUT_MS + 1).await, 1);
    }

    #[tokio::test]
    async fn roller_opens_first_segment_then_seals_on_age() {
        let consensus = cluster().await;
        consensus
            .propose(Command::CreateRoller {
                name: "short".into(),
                limits: RollerLimits {
                    max_age_ms: 1_000,
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        consensus
            .propose(Command::CreateTopic {
                database: 1,
                name: "orders".into(),
                mode: Default::default(),
                roller_id: 1,
                codec: Default::default(),
                level: Default::default(),
                app_id: String::new(),
                drive: Default::default(),
            })
            .await
            .unwrap();

        let mut task = RollerTask::new(Arc::clone(&consensus), rollers(), Leadership::Always);
        assert_eq!(task.sweep(10_000).await, 1);
        let first = consensus.snapshot().topics[&1].active_segment;
        assert!(first.is_some());

        // Picks up the new segment, too young to seal.
        assert_eq!(task.sweep(10_500).await, 0);
        assert_eq!(task.sweep(11_000).await, 1);
        let state = consensus.snapshot();
        assert!(state.segments[&first.unwrap()].sealed);
        assert_ne!(state.topics[&1].active_segment, first);
    }
}
