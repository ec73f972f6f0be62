//! Rebalance tracker: follows planned rebalances through the log.
//!
//! The tracker is fed by whoever proposes rebalances: it records the
//! plan, the proposal receipt, and then the events (or rejections) the
//! log produces for it.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use sliced_core::{DatabaseId, RebalanceId};
use sliced_state::{ErrorClass, Event, Outcome, Rebalance, TxError};

/// Current phase of a rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalancePhase {
    /// Computed but not yet handed to consensus.
    Planned,
    /// Appended to the log at `index`, waiting for apply.
    Proposed { index: u64 },
    /// The ring now reflects every task.
    Committed,
    /// Voided by a cancel ordered before it.
    Cancelled,
    /// Lost a race; the ring moved under the plan.
    Stale { reason: String },
}

impl RebalancePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RebalancePhase::Committed | RebalancePhase::Cancelled | RebalancePhase::Stale { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceProgress {
    pub database: DatabaseId,
    pub rebalance: RebalanceId,
    pub phase: RebalancePhase,
    pub tasks: usize,
    /// Slots this rebalance moves once committed.
    pub slots: u32,
}

#[derive(Debug, Default)]
pub struct RebalanceTracker {
    tracked: BTreeMap<(DatabaseId, RebalanceId), RebalanceProgress>,
}

impl RebalanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn planned(&mut self, database: DatabaseId, rebalance: &Rebalance) {
        debug!(database, rebalance = rebalance.timestamp, "tracking rebalance");
        self.tracked.insert(
            (database, rebalance.timestamp),
            RebalanceProgress {
                database,
                rebalance: rebalance.timestamp,
                phase: RebalancePhase::Planned,
                tasks: rebalance.tasks.len(),
                slots: rebalance.moved(),
            },
        );
    }

    /// Record the log receipt of a proposal and its apply outcome.
    pub fn proposed(
        &mut self,
        database: DatabaseId,
        rebalance: RebalanceId,
        index: u64,
        outcome: Outcome,
    ) {
        let phase = match outcome {
            Outcome::Changed | Outcome::Unchanged => RebalancePhase::Committed,
            Outcome::Cancelled => RebalancePhase::Cancelled,
        };
        self.set(database, rebalance, RebalancePhase::Proposed { index });
        self.set(database, rebalance, phase);
    }

    /// Record a rejected proposal.
    pub fn rejected(&mut self, database: DatabaseId, rebalance: RebalanceId, err: &TxError) {
        if err.class() != ErrorClass::Conflict {
            warn!(database, rebalance, error = %err, "rebalance rejected");
        }
        self.set(
            database,
            rebalance,
            RebalancePhase::Stale {
                reason: err.to_string(),
            },
        );
    }

    /// Apply an event from the committed log.
    pub fn observe(&mut self, event: &Event) {
        match event {
            Event::RingChanged {
                database,
                rebalance,
                ..
            } => self.set(*database, *rebalance, RebalancePhase::Committed),
            Event::RebalanceCancelled {
                database,
                rebalance,
            } => self.set(*database, *rebalance, RebalancePhase::Cancelled),
            _ => {}
        }
    }

    pub fn progress(&self, database: DatabaseId, rebalance: RebalanceId) -> Option<&RebalanceProgress> {
        self.tracked.get(&(database, rebalance))
    }

    /// Rebalances that have not reached a terminal phase.
    pub fn pending(&self) -> Vec<&RebalanceProgress> {
        self.tracked
            .values()
            .filter(|p| !p.phase.is_terminal())
            .collect()
    }

    /// Give up on unresolved rebalances planned before `cutoff`. Rebalance
    /// ids are plan timestamps, so this is an age limit.
    pub fn expire(&mut self, cutoff: RebalanceId) -> usize {
        let stale: Vec<(DatabaseId, RebalanceId)> = self
            .tracked
            .values()
            .filter(|p| !p.phase.is_terminal() && p.rebalance < cutoff)
            .map(|p| (p.database, p.rebalance))
            .collect();
        for &(database, rebalance) in &stale {
            self.set(
                database,
                rebalance,
                RebalancePhase::Stale {
                    reason: "no outcome observed".into(),
                },
            );
        }
        stale.len()
    }

    /// Forget terminal rebalances; returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let before = self.tracked.len();
        self.tracked.retain(|_, p| !p.phase.is_terminal());
        before - self.tracked.len()
    }

    fn set(&mut self, database: DatabaseId, rebalance: RebalanceId, phase: RebalancePhase) {
        let Some(progress) = self.tracked.get_mut(&(database, rebalance)) else {
            return;
        };
        // Terminal phases stick; a late event never reopens a rebalance.
        if progress.phase.is_terminal() {
            return;
        }
        if phase.is_terminal() {
            info!(database, rebalance, ?phase, slots = progress.slots, "rebalance finished");
        }
        progress.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliced_state::Task;

    fn rebalance(id: RebalanceId) -> Rebalance {
        Rebalance {
            timestamp: id,
            tasks: vec![Task {
                from: 0,
                to: 1,
                low: 30,
                count: 20,
            }],
        }
    }

    #[test]
    fn planned_to_committed() {
        let mut tracker = RebalanceTracker::new();
        tracker.planned(1, &rebalance(7));
        assert_eq!(tracker.pending().len(), 1);
        tracker.proposed(1, 7, 12, Outcome::Changed);
        let progress = tracker.progress(1, 7).unwrap();
        assert_eq!(progress.phase, RebalancePhase::Committed);
        assert_eq!(progress.slots, 20);
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn unresolved_rebalances_expire() {
        let mut tracker = RebalanceTracker::new();
        tracker.planned(1, &rebalance(7));
        tracker.planned(2, &rebalance(50));
        assert_eq!(tracker.expire(10), 1);
        assert!(matches!(
            tracker.progress(1, 7).unwrap().phase,
            RebalancePhase::Stale { .. }
        ));
        assert_eq!(tracker.pending().len(), 1);

        // A committed event arriving later does not reopen it.
        tracker.observe(&Event::RingChanged {
            database: 1,
            rebalance: 7,
            moved: 20,
        });
        assert!(tracker.progress(1, 7).unwrap().phase.is_terminal());
        tracker.observe(&Event::RingChanged {
            database: 2,
            rebalance: 50,
            moved: 20,
        });
        assert_eq!(tracker.progress(2, 50).unwrap().phase, RebalancePhase::Committed);
    }

    #[test]
    fn cancel_event_wins_before_commit() {
        let mut tracker = RebalanceTracker::new();
        tracker.planned(1, &rebalance(7));
        tracker.observe(&Event::RebalanceCancelled {
            database: 1,
            rebalance: 7,
        });
        tracker.observe(&Event::RingChanged {
            database: 1,
            rebalance: 7,
            moved: 20,
        });
        assert_eq!(tracker.progress(1, 7).unwrap().phase, RebalancePhase::Cancelled);
    }

    #[test]
    fn conflicts_mark_stale() {
        let mut tracker = RebalanceTracker::new();
        tracker.planned(1, &rebalance(7));
        tracker.rejected(1, 7, &TxError::StaleSnapshot("moved".into()));
        assert!(matches!(
            tracker.progress(1, 7).unwrap().phase,
            RebalancePhase::Stale { .. }
        ));
        assert_eq!(tracker.prune(), 1);
        assert!(tracker.progress(1, 7).is_none());
    }

    #[test]
    fn untracked_events_are_ignored() {
        let mut tracker = RebalanceTracker::new();
        tracker.observe(&Event::RingChanged {
            database: 1,
            rebalance: 9,
            moved: 1,
        });
        assert!(tracker.progress(1, 9).is_none());
    }
}
