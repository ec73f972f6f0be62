//! Per-topic roller state machine.
//!
//! A [`TopicRoller`] observes appends to the active segment of one topic
//! (it never performs them), keeps the running stats and CRC32C of the
//! record bodies, and proposes a `Roll` command as soon as its policy
//! says the segment must be sealed. After proposing it stops deciding
//! until a snapshot shows the next segment. Appends observed while the
//! seal is in flight are held back and counted towards the next segment,
//! or folded back into the current one if the roll does not commit.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use sliced_core::*;
use sliced_state::*;

use crate::policy::{RollDecision, evaluate};

/// Where new segments are placed on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlacement {
    pub volume_id: String,
    pub drive: String,
}

impl SegmentPlacement {
    pub fn path(&self, topic_id: TopicId, at: Timestamp) -> SegmentPath {
        SegmentPath {
            name: format!("{topic_id}/{at:020}.seg"),
            volume_id: self.volume_id.clone(),
            drive: self.drive.clone(),
            kind: PathKind::Local,
        }
    }

    pub fn next_segment(&self, topic_id: TopicId, at: Timestamp) -> NewSegment {
        NewSegment {
            path: self.path(topic_id, at),
            timestamp: at,
        }
    }
}

/// An append observed on a topic's active segment.
#[derive(Debug, Clone, Copy)]
pub struct AppendedRecord<'a> {
    pub pointer: RecordPointer,
    /// Encoded record header length in bytes.
    pub header: u64,
    pub body: &'a [u8],
}

/// An append that arrived after the stats were frozen for a roll.
#[derive(Debug, Clone)]
struct Deferred {
    pointer: RecordPointer,
    header: u64,
    body: Vec<u8>,
    at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct TopicRoller {
    topic_id: TopicId,
    roller_id: RollerId,
    segment_id: SegmentId,
    limits: RollerLimits,
    opened: Timestamp,
    last_append: Timestamp,
    stats: SegmentStats,
    crc: u32,
    sealing: bool,
    deferred: Vec<Deferred>,
}

impl TopicRoller {
    pub fn new(topic: &Topic, segment: &Segment, roller: &Roller) -> Self {
        Self {
            topic_id: topic.id,
            roller_id: roller.id,
            segment_id: segment.id,
            limits: roller.limits,
            opened: segment.header.timestamp,
            last_append: segment.header.timestamp,
            stats: SegmentStats::default(),
            crc: 0,
            sealing: false,
            deferred: Vec::new(),
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn is_sealing(&self) -> bool {
        self.sealing
    }

    /// Appends held back while a seal is in flight.
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Re-arm after a roll proposal that did not commit. Held-back appends
    /// still belong to this segment.
    pub fn unseal(&mut self) {
        self.sealing = false;
        for append in std::mem::take(&mut self.deferred) {
            self.record(append.pointer, append.header, &append.body, append.at);
        }
    }

    /// Stats so far, including the running hash.
    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            hash: Some(Hash {
                algorithm: HashAlgorithm::Crc32c,
                value: hex::encode(self.crc.to_be_bytes()),
            }),
            ..self.stats.clone()
        }
    }

    /// Record an append and check the mandatory thresholds.
    pub fn observe(
        &mut self,
        record: &AppendedRecord<'_>,
        now: Timestamp,
        placement: &SegmentPlacement,
    ) -> Option<Command> {
        if self.sealing {
            // The stats in flight are frozen; this append lands in the
            // next segment.
            self.deferred.push(Deferred {
                pointer: record.pointer,
                header: record.header,
                body: record.body.to_vec(),
                at: now,
            });
            self.last_append = now;
            return None;
        }
        self.record(record.pointer, record.header, record.body, now);
        self.decide(now, false, placement)
    }

    fn record(&mut self, pointer: RecordPointer, header: u64, body: &[u8], now: Timestamp) {
        let len = body.len() as u64;
        self.stats.count += 1;
        self.stats.header += header;
        self.stats.body += len;
        self.stats.size = self.stats.header + self.stats.body;
        self.stats.max_body = self.stats.max_body.max(len);
        self.stats.first.get_or_insert(pointer);
        self.stats.last = Some(pointer);
        self.crc = crc32c::crc32c_append(self.crc, body);
        self.last_append = self.last_append.max(now);
    }

    /// Periodic check: age limits, and advisory sealing under `pressure`.
    pub fn tick(
        &mut self,
        now: Timestamp,
        pressure: bool,
        placement: &SegmentPlacement,
    ) -> Option<Command> {
        self.decide(now, pressure, placement)
    }

    /// Milliseconds since the last observed append.
    pub fn idle_for(&self, now: Timestamp) -> u64 {
        now.saturating_sub(self.last_append)
    }

    fn decide(
        &mut self,
        now: Timestamp,
        pressure: bool,
        placement: &SegmentPlacement,
    ) -> Option<Command> {
        if self.sealing {
            return None;
        }
        let age = now.saturating_sub(self.opened);
        let RollDecision::Seal(reason) = evaluate(&self.limits, &self.stats, age, pressure) else {
            return None;
        };
        self.sealing = true;
        info!(
            topic_id = self.topic_id,
            segment_id = self.segment_id,
            ?reason,
            count = self.stats.count,
            size = self.stats.size,
            age,
            "sealing segment"
        );
        Some(Command::Roll {
            roller_id: self.roller_id,
            topic_id: self.topic_id,
            segment_id: self.segment_id,
            stats: self.stats(),
            next: placement.next_segment(self.topic_id, now),
        })
    }
}

/// Rollers for every topic with an active segment.
#[derive(Debug)]
pub struct RollerSet {
    placement: SegmentPlacement,
    /// Quiet time after which minima-satisfying segments are sealed.
    idle_ms: u64,
    rollers: BTreeMap<TopicId, TopicRoller>,
}

impl RollerSet {
    pub fn new(placement: SegmentPlacement, idle_ms: u64) -> Self {
        Self {
            placement,
            idle_ms,
            rollers: BTreeMap::new(),
        }
    }

    pub fn placement(&self) -> &SegmentPlacement {
        &self.placement
    }

    pub fn get(&self, topic_id: TopicId) -> Option<&TopicRoller> {
        self.rollers.get(&topic_id)
    }

    pub fn len(&self) -> usize {
        self.rollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rollers.is_empty()
    }

    /// Align with a committed snapshot. A roller whose segment is still
    /// active is kept; a new active segment starts a fresh roller, which
    /// takes over the appends its predecessor held back.
    pub fn sync(&mut self, state: &ClusterState) {
        let mut carried: BTreeMap<TopicId, Vec<Deferred>> = BTreeMap::new();
        self.rollers.retain(|topic_id, roller| {
            let keep = state
                .topics
                .get(topic_id)
                .is_some_and(|t| t.active_segment == Some(roller.segment_id));
            if !keep && !roller.deferred.is_empty() {
                carried.insert(*topic_id, std::mem::take(&mut roller.deferred));
            }
            keep
        });
        for topic in state.topics.values() {
            let Some(active) = topic.active_segment else {
                continue;
            };
            if self.rollers.contains_key(&topic.id) {
                continue;
            }
            let (Some(segment), Some(roller)) =
                (state.segments.get(&active), state.rollers.get(&topic.roller_id))
            else {
                continue;
            };
            let mut next = TopicRoller::new(topic, segment, roller);
            let appends = carried.remove(&topic.id).unwrap_or_default();
            for append in &appends {
                next.record(append.pointer, append.header, &append.body, append.at);
            }
            debug!(
                topic_id = topic.id,
                segment_id = active,
                carried = appends.len(),
                "tracking active segment"
            );
            self.rollers.insert(topic.id, next);
        }
        for (topic_id, appends) in carried {
            warn!(topic_id, dropped = appends.len(), "held-back appends have no segment to land in");
        }
    }

    pub fn observe(
        &mut self,
        topic_id: TopicId,
        record: &AppendedRecord<'_>,
        now: Timestamp,
    ) -> Option<Command> {
        let roller = self.rollers.get_mut(&topic_id)?;
        roller.observe(record, now, &self.placement)
    }

    /// Re-arm `topic_id` after its roll proposal failed.
    pub fn unseal(&mut self, topic_id: TopicId) {
        if let Some(roller) = self.rollers.get_mut(&topic_id) {
            debug!(topic_id, segment_id = roller.segment_id, "roll not committed, re-armed");
            roller.unseal();
        }
    }

    /// Sweep all topics; quiet topics are under sealing pressure.
    pub fn tick(&mut self, now: Timestamp) -> Vec<Command> {
        let idle_ms = self.idle_ms;
        self.rollers
            .values_mut()
            .filter_map(|roller| {
                let pressure = roller.idle_for(now) >= idle_ms;
                roller.tick(now, pressure, &self.placement)
            })
            .collect()
    }

    /// `CreateSegment` commands for topics that have no active segment.
    pub fn missing_segments(&self, state: &ClusterState, now: Timestamp) -> Vec<Command> {
        state
            .topics
            .values()
            .filter(|t| t.active_segment.is_none())
            .map(|t| Command::CreateSegment {
                topic_id: t.id,
                next: self.placement.next_segment(t.id, now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement() -> SegmentPlacement {
        SegmentPlacement {
            volume_id: "v0".into(),
            drive: "d0".into(),
        }
    }

    fn topic() -> Topic {
        Topic {
            id: 4,
            name: "orders".into(),
            database: 1,
            slot: 0,
            mode: TopicMode::Log,
            roller_id: 2,
            codec: Codec::Json,
            level: Level::Business,
            app_id: String::new(),
            queue_id: None,
            drive: DriveKind::Ssd,
            active_segment: Some(9),
            segments: vec![9],
            sealed_records: 0,
        }
    }

    fn segment(id: SegmentId, opened: Timestamp, start_index: u64) -> Segment {
        Segment {
            id,
            topic_id: 4,
            slice: SliceId::new(1, 0),
            path: SegmentPath::default(),
            header: SegmentHeader {
                timestamp: opened,
                topic_id: 4,
                log_id: id,
                start_index,
            },
            stats: SegmentStats::default(),
            sealed: false,
        }
    }

    fn policy(limits: RollerLimits) -> Roller {
        Roller {
            id: 2,
            name: "standard".into(),
            limits,
            cycle: 0,
        }
    }

    fn roller(limits: RollerLimits) -> TopicRoller {
        TopicRoller::new(&topic(), &segment(9, 1_000, 0), &policy(limits))
    }

    fn record(seq: u64, body: &[u8]) -> AppendedRecord<'_> {
        AppendedRecord {
            pointer: RecordPointer {
                id: RecordId { epoch: 1, seq },
                log_id: 9,
                slot: 0,
                size: body.len() as u32,
                pos: seq * 100,
            },
            header: 8,
            body,
        }
    }

    #[test]
    fn crossing_max_count_proposes_roll() {
        let mut r = roller(RollerLimits {
            max_count: 3,
            ..Default::default()
        });
        let p = placement();
        assert!(r.observe(&record(1, b"a"), 1_001, &p).is_none());
        assert!(r.observe(&record(2, b"bb"), 1_002, &p).is_none());
        let Some(Command::Roll {
            roller_id,
            topic_id,
            segment_id,
            stats,
            next,
        }) = r.observe(&record(3, b"ccc"), 1_003, &p)
        else {
            panic!("expected a roll at max_count");
        };
        assert_eq!((roller_id, topic_id, segment_id), (2, 4, 9));
        assert_eq!(stats.count, 3);
        assert_eq!(stats.body, 6);
        assert_eq!(stats.size, 30);
        assert_eq!(stats.max_body, 3);
        assert_eq!(stats.first.unwrap().id.seq, 1);
        assert_eq!(stats.last.unwrap().id.seq, 3);
        assert_eq!(
            stats.hash.unwrap().value,
            hex::encode(crc32c::crc32c(b"abbccc").to_be_bytes())
        );
        assert_eq!(next.timestamp, 1_003);
        assert_eq!(next.path.name, "4/00000000000000001003.seg");

        // Sealing is in flight; no second proposal, and the frozen stats
        // stay frozen.
        assert!(r.is_sealing());
        assert!(r.observe(&record(4, b"d"), 1_004, &p).is_none());
        assert_eq!(r.deferred(), 1);
        assert_eq!(r.stats().count, 3);
    }

    #[test]
    fn appends_during_a_seal_move_to_the_next_segment() {
        let limits = RollerLimits {
            max_count: 3,
            ..Default::default()
        };
        let mut state = ClusterState::default();
        state.topics.insert(4, topic());
        state.segments.insert(9, segment(9, 1_000, 0));
        state.rollers.insert(2, policy(limits));
        let mut set = RollerSet::new(placement(), 60_000);
        set.sync(&state);

        for seq in 1..=2 {
            assert!(set.observe(4, &record(seq, b"x"), 1_000 + seq).is_none());
        }
        let Some(Command::Roll { stats: sealed, .. }) = set.observe(4, &record(3, b"x"), 1_003)
        else {
            panic!("expected a roll");
        };
        assert!(set.observe(4, &record(4, b"late"), 1_004).is_none());
        assert!(set.observe(4, &record(5, b"later"), 1_005).is_none());

        // The roll commits: 9 is sealed with the frozen stats, 10 opens.
        if let Some(s) = state.segments.get_mut(&9) {
            s.sealed = true;
            s.stats = sealed.clone();
        }
        state.segments.insert(10, segment(10, 1_003, sealed.count));
        if let Some(t) = state.topics.get_mut(&4) {
            t.active_segment = Some(10);
            t.segments.push(10);
            t.sealed_records = sealed.count;
        }
        set.sync(&state);

        let next = set.get(4).unwrap();
        assert_eq!(next.segment_id(), 10);
        let stats = next.stats();
        assert_eq!(sealed.count + stats.count, 5);
        assert_eq!(state.segments[&10].header.start_index, 3);
        assert_eq!(stats.first.unwrap().id.seq, 4);
        assert_eq!(stats.last.unwrap().id.seq, 5);
        assert_eq!(stats.body, 9);
        assert_eq!(
            stats.hash.unwrap().value,
            hex::encode(crc32c::crc32c(b"latelater").to_be_bytes())
        );
    }

    #[test]
    fn a_failed_roll_keeps_held_back_appends() {
        let mut r = roller(RollerLimits {
            max_count: 2,
            ..Default::default()
        });
        let p = placement();
        r.observe(&record(1, b"a"), 1_001, &p);
        assert!(r.observe(&record(2, b"b"), 1_002, &p).is_some());
        r.observe(&record(3, b"c"), 1_003, &p);

        r.unseal();
        assert_eq!(r.deferred(), 0);
        let stats = r.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.last.unwrap().id.seq, 3);
        // Still over the limit, so the next check proposes again.
        assert!(r.tick(1_004, false, &p).is_some());
    }

    #[test]
    fn max_bytes_includes_headers() {
        let mut r = roller(RollerLimits {
            max_bytes: 20,
            ..Default::default()
        });
        let p = placement();
        assert!(r.observe(&record(1, b"12"), 1_001, &p).is_none());
        assert!(r.observe(&record(2, b"12"), 1_002, &p).is_some());
    }

    #[test]
    fn age_is_checked_on_tick() {
        let mut r = roller(RollerLimits {
            max_age_ms: 5_000,
            ..Default::default()
        });
        let p = placement();
        assert!(r.tick(5_999, false, &p).is_none());
        assert!(r.tick(6_000, false, &p).is_some());
        assert!(r.tick(6_001, false, &p).is_none());

        // A roll that failed to commit is proposed again.
        r.unseal();
        assert!(r.tick(6_002, false, &p).is_some());
    }

    #[test]
    fn quiet_topics_seal_once_minima_hold() {
        let limits = RollerLimits {
            min_count: 2,
            ..Default::default()
        };
        let mut set = RollerSet::new(placement(), 10_000);
        set.rollers.insert(4, roller(limits));
        set.observe(4, &record(1, b"a"), 1_000);
        assert!(set.tick(50_000).is_empty());
        set.observe(4, &record(2, b"b"), 50_000);
        assert!(set.tick(55_000).is_empty());
        assert_eq!(set.tick(60_000).len(), 1);
    }
}
