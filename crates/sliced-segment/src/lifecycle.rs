//! Apply steps for rollers, topics, queues, and segments.
//!
//! A topic is bound to a slice only through its slot: every new segment
//! opens on whichever slice the ring assigns the topic's slot to at the
//! time of apply. Opening a segment requires that slice's group to have
//! a leader. Everything is validated before the first mutation.

use tracing::{debug, info};

use sliced_core::*;
use sliced_state::*;

use crate::policy::validate_limits;

pub fn create_roller(
    state: &mut ClusterState,
    name: &str,
    limits: &RollerLimits,
) -> TxResult<Applied> {
    if name.is_empty() {
        return Err(TxError::InvalidCommand("roller name must not be empty".into()));
    }
    if state.rollers.values().any(|r| r.name == name) {
        return Err(TxError::AlreadyExists(format!("roller {name}")));
    }
    validate_limits(limits)?;
    let id = state.seq.next_roller();
    state.rollers.insert(
        id,
        Roller {
            id,
            name: name.to_string(),
            limits: *limits,
            cycle: 0,
        },
    );
    info!(roller_id = id, %name, "roller created");
    Ok(Applied::changed(vec![Event::RollerCreated {
        roller_id: id,
        name: name.to_string(),
    }]))
}

/// Topic attributes shared by plain topics and queue topics.
#[derive(Debug, Clone)]
pub struct TopicSpec {
    pub database: DatabaseId,
    pub name: String,
    pub mode: TopicMode,
    pub roller_id: RollerId,
    pub codec: Codec,
    pub level: Level,
    pub app_id: String,
    pub drive: DriveKind,
}

pub fn create_topic(state: &mut ClusterState, spec: &TopicSpec) -> TxResult<Applied> {
    check_topic(state, spec)?;
    let slot = slot_in(spec.name.as_bytes(), state.ring(spec.database)?.size());
    let slice = state.owning_slice(spec.database, slot)?;
    let (_, event) = insert_topic(state, spec, slot, slice, None);
    Ok(Applied::changed(vec![event]))
}

#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub database: DatabaseId,
    pub name: String,
    pub roller_id: RollerId,
    pub level: Level,
    pub fifo: bool,
    pub max_in_flight: u32,
    pub max_visibility_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
    pub app_id: String,
    pub tags: Vec<String>,
}

/// Create a queue with its request, reply and error topics.
pub fn create_queue(state: &mut ClusterState, spec: &QueueSpec) -> TxResult<Applied> {
    let (database, name) = (spec.database, spec.name.as_str());
    if name.is_empty() {
        return Err(TxError::InvalidCommand("queue name must not be empty".into()));
    }
    if state
        .queues
        .values()
        .any(|q| q.database == database && q.name == name)
    {
        return Err(TxError::AlreadyExists(format!("queue {name}")));
    }
    let specs: Vec<TopicSpec> = ["request", "reply", "error"]
        .iter()
        .map(|suffix| TopicSpec {
            database,
            name: format!("{name}.{suffix}"),
            mode: TopicMode::Queue,
            roller_id: spec.roller_id,
            codec: Codec::default(),
            level: spec.level,
            app_id: spec.app_id.clone(),
            drive: DriveKind::default(),
        })
        .collect();
    for spec in &specs {
        check_topic(state, spec)?;
    }

    // All three topics share the queue's slot.
    let slot = slot_in(name.as_bytes(), state.ring(database)?.size());
    let slice = state.owning_slice(database, slot)?;
    let queue_id = state.seq.next_queue();
    let mut events = Vec::with_capacity(4);
    let mut ids = Vec::with_capacity(3);
    for spec in &specs {
        let (id, event) = insert_topic(state, spec, slot, slice, Some(queue_id));
        ids.push(id);
        events.push(event);
    }
    state.queues.insert(
        queue_id,
        Queue {
            id: queue_id,
            name: name.to_string(),
            database,
            request_id: ids[0],
            reply_id: ids[1],
            error_id: ids[2],
            level: spec.level,
            fifo: spec.fifo,
            max_in_flight: spec.max_in_flight,
            max_visibility_ms: spec.max_visibility_ms,
            max_delay_ms: spec.max_delay_ms,
            max_retries: spec.max_retries,
            app_id: spec.app_id.clone(),
            tags: spec.tags.clone(),
        },
    );
    info!(queue_id, %name, "queue created");
    events.insert(
        0,
        Event::QueueCreated {
            queue_id,
            name: name.to_string(),
        },
    );
    Ok(Applied::changed(events))
}

fn check_topic(state: &ClusterState, spec: &TopicSpec) -> TxResult<()> {
    if spec.name.is_empty() {
        return Err(TxError::InvalidCommand("topic name must not be empty".into()));
    }
    state.live_database(spec.database)?;
    state.roller(spec.roller_id)?;
    if state.topic_by_name(spec.database, &spec.name).is_some() {
        return Err(TxError::AlreadyExists(format!("topic {}", spec.name)));
    }
    Ok(())
}

fn insert_topic(
    state: &mut ClusterState,
    spec: &TopicSpec,
    slot: Slot,
    slice: SliceId,
    queue_id: Option<QueueId>,
) -> (TopicId, Event) {
    let id = state.seq.next_topic();
    state.topics.insert(
        id,
        Topic {
            id,
            name: spec.name.clone(),
            database: spec.database,
            slot,
            mode: spec.mode,
            roller_id: spec.roller_id,
            codec: spec.codec,
            level: spec.level,
            app_id: spec.app_id.clone(),
            queue_id,
            drive: spec.drive,
            active_segment: None,
            segments: Vec::new(),
            sealed_records: 0,
        },
    );
    info!(topic_id = id, name = %spec.name, slot, %slice, "topic created");
    (
        id,
        Event::TopicCreated {
            topic_id: id,
            name: spec.name.clone(),
            slice,
        },
    )
}

/// Open the first segment of a topic.
pub fn create_segment(
    state: &mut ClusterState,
    topic_id: TopicId,
    next: &NewSegment,
) -> TxResult<Applied> {
    let topic = state.topic(topic_id)?;
    if let Some(active) = topic.active_segment {
        return Err(TxError::StaleSnapshot(format!(
            "topic {topic_id} already has active segment {active}"
        )));
    }
    let slice = leading_slice(state, topic.database, topic.slot)?;
    let segment = open_segment(state, topic_id, slice, next);
    Ok(Applied::changed(vec![Event::SegmentCreated { segment }]))
}

/// Seal the active segment with frozen `stats` and open the next one.
pub fn roll(
    state: &mut ClusterState,
    roller_id: RollerId,
    topic_id: TopicId,
    segment_id: SegmentId,
    stats: &SegmentStats,
    next: &NewSegment,
) -> TxResult<Applied> {
    let topic = state.topic(topic_id)?;
    if topic.roller_id != roller_id {
        return Err(TxError::InvalidCommand(format!(
            "topic {topic_id} is governed by roller {}, not {roller_id}",
            topic.roller_id
        )));
    }
    if topic.active_segment != Some(segment_id) {
        return Err(TxError::StaleSnapshot(format!(
            "segment {segment_id} is no longer active on topic {topic_id}"
        )));
    }
    let slice = leading_slice(state, topic.database, topic.slot)?;

    let sealed = seal_active(state, topic_id, stats);
    if let Some(roller) = state.rollers.get_mut(&roller_id) {
        roller.cycle += 1;
    }
    let segment = open_segment(state, topic_id, slice, next);
    let mut events = sealed.into_iter().collect::<Vec<_>>();
    events.push(Event::SegmentCreated { segment });
    Ok(Applied::changed(events))
}

pub fn delete_topic(state: &mut ClusterState, topic_id: TopicId) -> TxResult<Applied> {
    let topic = state.topic(topic_id)?;
    if let Some(queue_id) = topic.queue_id {
        return Err(TxError::InvalidCommand(format!(
            "topic {topic_id} belongs to queue {queue_id}"
        )));
    }
    let event = remove_topic(state, topic_id);
    Ok(Applied::changed(event.into_iter().collect()))
}

/// Delete a queue and its three topics.
pub fn delete_queue(state: &mut ClusterState, queue_id: QueueId) -> TxResult<Applied> {
    let queue = state
        .queues
        .remove(&queue_id)
        .ok_or_else(|| TxError::NotFound(format!("queue {queue_id}")))?;
    let mut events = vec![Event::QueueDeleted { queue_id }];
    for topic_id in [queue.request_id, queue.reply_id, queue.error_id] {
        events.extend(remove_topic(state, topic_id));
    }
    info!(queue_id, name = %queue.name, "queue deleted");
    Ok(Applied::changed(events))
}

fn remove_topic(state: &mut ClusterState, topic_id: TopicId) -> Option<Event> {
    let topic = state.topics.remove(&topic_id)?;
    let segments: Vec<Segment> = topic
        .segments
        .iter()
        .filter_map(|id| state.segments.remove(id))
        .collect();
    info!(topic_id, segments = segments.len(), "topic deleted");
    Some(Event::TopicDeleted { topic_id, segments })
}

/// Rename and/or re-slot a topic, continuing it on the new owning slice.
pub fn split_topic(
    state: &mut ClusterState,
    topic_id: TopicId,
    name: Option<&str>,
    slot: Option<Slot>,
    stats: &SegmentStats,
    next: &NewSegment,
) -> TxResult<Applied> {
    let topic = state.topic(topic_id)?;
    if name.is_none() && slot.is_none() {
        return Err(TxError::InvalidCommand(
            "split needs a new name or a new slot".into(),
        ));
    }
    if let Some(name) = name {
        if name.is_empty() {
            return Err(TxError::InvalidCommand("topic name must not be empty".into()));
        }
        if state
            .topic_by_name(topic.database, name)
            .is_some_and(|t| t.id != topic_id)
        {
            return Err(TxError::AlreadyExists(format!("topic {name}")));
        }
    }
    let new_slot = slot.unwrap_or(topic.slot);
    let slice = leading_slice(state, topic.database, new_slot)?;

    let mut events = seal_active(state, topic_id, stats).into_iter().collect::<Vec<_>>();
    if let Some(topic) = state.topics.get_mut(&topic_id) {
        if let Some(name) = name {
            topic.name = name.to_string();
        }
        topic.slot = new_slot;
    }
    let segment = open_segment(state, topic_id, slice, next);
    info!(topic_id, slot = new_slot, %slice, "topic split");
    events.push(Event::TopicSplit {
        topic_id,
        slot: new_slot,
        slice,
    });
    events.push(Event::SegmentCreated { segment });
    Ok(Applied::changed(events))
}

/// Owning slice of `slot`, which must have a leader to host a segment.
fn leading_slice(state: &ClusterState, database: DatabaseId, slot: Slot) -> TxResult<SliceId> {
    let slice = state.owning_slice(database, slot)?;
    match state.slice_leader(slice)? {
        Some(_) => Ok(slice),
        None => Err(TxError::NoActiveSlice(slice)),
    }
}

fn seal_active(state: &mut ClusterState, topic_id: TopicId, stats: &SegmentStats) -> Option<Event> {
    let active = state.topics.get_mut(&topic_id)?.active_segment.take()?;
    let segment = state.segments.get_mut(&active)?;
    segment.stats = stats.clone();
    segment.sealed = true;
    if let Some(topic) = state.topics.get_mut(&topic_id) {
        topic.sealed_records += stats.count;
    }
    debug!(topic_id, segment_id = active, count = stats.count, size = stats.size, "segment sealed");
    Some(Event::SegmentSealed {
        segment_id: active,
        topic_id,
        stats: stats.clone(),
    })
}

/// Caller has checked the topic exists and the slice has a leader.
fn open_segment(
    state: &mut ClusterState,
    topic_id: TopicId,
    slice: SliceId,
    next: &NewSegment,
) -> Segment {
    let id = state.seq.next_segment();
    let start_index = state
        .topics
        .get(&topic_id)
        .map_or(0, |t| t.sealed_records);
    let segment = Segment {
        id,
        topic_id,
        slice,
        path: next.path.clone(),
        header: SegmentHeader {
            timestamp: next.timestamp,
            topic_id,
            log_id: id,
            start_index,
        },
        stats: SegmentStats::default(),
        sealed: false,
    };
    state.segments.insert(id, segment.clone());
    if let Some(topic) = state.topics.get_mut(&topic_id) {
        topic.active_segment = Some(id);
        topic.segments.push(id);
    }
    debug!(topic_id, segment_id = id, %slice, path = %next.path, "segment opened");
    segment
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliced_cluster::database::{change_ring, create_database};
    use sliced_cluster::membership::{add_node_to_group, create_group, init_node, report_member};

    fn next(name: &str, at: Timestamp) -> NewSegment {
        NewSegment {
            path: SegmentPath {
                name: name.to_string(),
                volume_id: "v0".into(),
                drive: "d0".into(),
                kind: PathKind::Local,
            },
            timestamp: at,
        }
    }

    fn spec(name: &str) -> TopicSpec {
        TopicSpec {
            database: 1,
            name: name.to_string(),
            mode: TopicMode::Log,
            roller_id: 1,
            codec: Codec::Json,
            level: Level::Business,
            app_id: String::new(),
            drive: DriveKind::Ssd,
        }
    }

    /// Database 1 with two slices: slice 0 on led group 1, slice 1 on
    /// leaderless group 2. One roller.
    fn cluster() -> ClusterState {
        let mut state = ClusterState::default();
        let node = Node {
            id: "n1".into(),
            ..Default::default()
        };
        init_node(&mut state, &node, 1).unwrap();
        create_group(&mut state, "g1").unwrap();
        create_group(&mut state, "g2").unwrap();
        add_node_to_group(&mut state, "n1", 1, Suffrage::Voter, true, "n1:7000").unwrap();
        report_member(&mut state, 1, "n1", RaftStatus::Leader, 1, 1).unwrap();
        create_database(&mut state, "main", "", 1, 1, 100, 1).unwrap();
        sliced_cluster::database::add_slice(&mut state, 1, 2).unwrap();
        let limits = RollerLimits {
            max_count: 100,
            ..Default::default()
        };
        create_roller(&mut state, "standard", &limits).unwrap();
        state
    }

    /// Topic id 1, with its slot forced onto slice 0.
    fn with_topic(state: &mut ClusterState) -> TopicId {
        create_topic(state, &spec("orders")).unwrap();
        let id = 1;
        if let Some(topic) = state.topics.get_mut(&id) {
            topic.slot = 10;
        }
        id
    }

    #[test]
    fn topic_slot_derives_from_name() {
        let mut state = cluster();
        create_topic(&mut state, &spec("orders")).unwrap();
        let topic = state.topic(1).unwrap();
        assert_eq!(topic.slot, slot_in(b"orders", 100));
        assert!(matches!(
            create_topic(&mut state, &spec("orders")),
            Err(TxError::AlreadyExists(_))
        ));
    }

    #[test]
    fn roller_limits_are_validated() {
        let mut state = cluster();
        let bad = RollerLimits {
            min_bytes: 10,
            max_bytes: 5,
            ..Default::default()
        };
        assert!(create_roller(&mut state, "bad", &bad).is_err());
        assert!(create_roller(&mut state, "standard", &RollerLimits::default()).is_err());
    }

    #[test]
    fn roll_seals_and_opens_next() {
        let mut state = cluster();
        let topic = with_topic(&mut state);
        create_segment(&mut state, topic, &next("a", 10)).unwrap();
        let first = state.topic(topic).unwrap().active_segment.unwrap();

        let stats = SegmentStats {
            count: 100,
            size: 4_000,
            ..Default::default()
        };
        let applied = roll(&mut state, 1, topic, first, &stats, &next("b", 20)).unwrap();
        assert_eq!(applied.events.len(), 2);

        let sealed = state.segment(first).unwrap();
        assert!(sealed.sealed);
        assert_eq!(sealed.stats.count, 100);
        let t = state.topic(topic).unwrap();
        let active = state.segment(t.active_segment.unwrap()).unwrap();
        assert_eq!(active.header.start_index, 100);
        assert_eq!(active.path.name, "b");
        assert_eq!(state.rollers[&1].cycle, 1);
        state.validate().unwrap();

        // A duplicate roll for the sealed segment lost its race.
        let before = state.clone();
        assert!(matches!(
            roll(&mut state, 1, topic, first, &stats, &next("c", 30)),
            Err(TxError::StaleSnapshot(_))
        ));
        assert_eq!(state, before);
    }

    #[test]
    fn segments_need_a_leader() {
        let mut state = cluster();
        let topic = with_topic(&mut state);
        // Hand every slot to the leaderless slice 1.
        let from = vec![SliceSlots::new(0, &[(0, 100)]), SliceSlots::new(1, &[])];
        let to = vec![SliceSlots::new(0, &[]), SliceSlots::new(1, &[(0, 100)])];
        change_ring(&mut state, 1, 1, &from, &to).unwrap();

        let err = create_segment(&mut state, topic, &next("a", 10)).unwrap_err();
        assert_eq!(err, TxError::NoActiveSlice(SliceId::new(1, 1)));
        assert!(state.topic(topic).unwrap().active_segment.is_none());
    }

    #[test]
    fn split_moves_topic_to_new_owner() {
        let mut state = cluster();
        let topic = with_topic(&mut state);
        create_segment(&mut state, topic, &next("a", 10)).unwrap();

        // Slot 90 of slice 0 moves to slice 1, which then gets a leader.
        let from = vec![SliceSlots::new(0, &[(0, 100)]), SliceSlots::new(1, &[])];
        let to = vec![SliceSlots::new(0, &[(0, 50)]), SliceSlots::new(1, &[(50, 100)])];
        change_ring(&mut state, 1, 1, &from, &to).unwrap();
        add_node_to_group(&mut state, "n1", 2, Suffrage::Voter, true, "n1:7001").unwrap();
        report_member(&mut state, 2, "n1", RaftStatus::Leader, 1, 1).unwrap();

        let stats = SegmentStats {
            count: 3,
            ..Default::default()
        };
        split_topic(&mut state, topic, Some("orders-v2"), Some(90), &stats, &next("b", 20)).unwrap();
        let t = state.topic(topic).unwrap();
        assert_eq!(t.name, "orders-v2");
        let active = state.segment(t.active_segment.unwrap()).unwrap();
        assert_eq!(active.slice, SliceId::new(1, 1));
        assert_eq!(t.segments.len(), 2);
        state.validate().unwrap();
    }

    #[test]
    fn queues_create_three_topics_on_one_slot() {
        let mut state = cluster();
        let spec = QueueSpec {
            database: 1,
            name: "jobs".into(),
            roller_id: 1,
            level: Level::Mission,
            fifo: true,
            max_in_flight: 10,
            max_visibility_ms: 30_000,
            max_delay_ms: 0,
            max_retries: 3,
            app_id: "app".into(),
            tags: vec!["batch".into()],
        };
        let applied = create_queue(&mut state, &spec).unwrap();
        assert_eq!(applied.events.len(), 4);
        let queue = state.queues[&1].clone();
        let slots: Vec<Slot> = [queue.request_id, queue.reply_id, queue.error_id]
            .iter()
            .map(|id| state.topics[id].slot)
            .collect();
        assert!(slots.iter().all(|&s| s == slots[0]));
        assert_eq!(state.topics[&queue.error_id].name, "jobs.error");
        assert!(matches!(
            delete_topic(&mut state, queue.request_id),
            Err(TxError::InvalidCommand(_))
        ));
    }

    #[test]
    fn delete_queue_releases_its_topics() {
        let mut state = cluster();
        let spec = QueueSpec {
            database: 1,
            name: "jobs".into(),
            roller_id: 1,
            level: Level::Business,
            fifo: false,
            max_in_flight: 1,
            max_visibility_ms: 1_000,
            max_delay_ms: 0,
            max_retries: 0,
            app_id: String::new(),
            tags: Vec::new(),
        };
        create_queue(&mut state, &spec).unwrap();
        let queue = state.queues[&1].clone();
        if let Some(topic) = state.topics.get_mut(&queue.request_id) {
            topic.slot = 10;
        }
        create_segment(&mut state, queue.request_id, &next("q", 10)).unwrap();

        let applied = delete_queue(&mut state, 1).unwrap();
        assert_eq!(applied.events[0], Event::QueueDeleted { queue_id: 1 });
        let released: usize = applied
            .events
            .iter()
            .filter_map(|e| match e {
                Event::TopicDeleted { segments, .. } => Some(segments.len()),
                _ => None,
            })
            .sum();
        assert_eq!(applied.events.len(), 4);
        assert_eq!(released, 1);
        assert!(state.queues.is_empty());
        assert!(state.topics.is_empty());
        assert!(state.segments.is_empty());
        assert!(matches!(delete_queue(&mut state, 1), Err(TxError::NotFound(_))));

        // The name is free again.
        create_queue(&mut state, &spec).unwrap();
    }

    #[test]
    fn dropped_databases_take_no_topics() {
        let mut state = cluster();
        sliced_cluster::database::drop_database(&mut state, 1, 5).unwrap();
        assert!(matches!(
            create_topic(&mut state, &spec("orders")),
            Err(TxError::InvalidCommand(_))
        ));
        assert!(state.topics.is_empty());
    }

    #[test]
    fn delete_topic_releases_segments() {
        let mut state = cluster();
        let topic = with_topic(&mut state);
        create_segment(&mut state, topic, &next("a", 10)).unwrap();
        let applied = delete_topic(&mut state, topic).unwrap();
        let Event::TopicDeleted { segments, .. } = &applied.events[0] else {
            panic!("expected topic_deleted");
        };
        assert_eq!(segments.len(), 1);
        assert!(state.segments.is_empty());
        assert!(state.topics.is_empty());
    }
}
