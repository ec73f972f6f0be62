//! StateStore: redb-backed persistence for the cluster state.
//!
//! State is written in a single write transaction together with an
//! opaque "applied" marker (the consensus layer's last applied log id).
//! [`StateStore::save_state`] rewrites every table; per-batch writes go
//! through [`StateStore::save_changes`], which only touches records that
//! differ from the previously persisted state. Reads go through typed
//! accessors per table. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{
    Database as RedbDatabase, ReadableDatabase, ReadableTable, TableDefinition,
    WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use sliced_core::DatabaseId;

use crate::cluster::{ClusterState, Sequences};
use crate::error::{StateError, StateResult};
use crate::ring::SlotRing;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

const ALL_TABLES: [Table; 10] = [
    NODES, GROUPS, DATABASES, SLICES, RINGS, ROLLERS, TOPICS, QUEUES, SEGMENTS, META,
];

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<RedbDatabase>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = RedbDatabase::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = RedbDatabase::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Shared handle to the underlying database, for crates that keep
    /// their own tables next to the state (the Raft log store).
    pub fn database(&self) -> Arc<RedbDatabase> {
        Arc::clone(&self.db)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Whole state ────────────────────────────────────────────────

    /// Replace the persisted state and applied marker atomically.
    pub fn save_state(&self, state: &ClusterState, applied: Option<&[u8]>) -> StateResult<()> {
        let nodes = rows(state.nodes.values().map(|n| (n.id.clone(), n)))?;
        let groups = rows(state.groups.values().map(|g| (g.id.to_string(), g)))?;
        let databases = rows(state.databases.values().map(|d| (d.id.to_string(), d)))?;
        let slices = rows(
            state
                .slices
                .values()
                .flat_map(|s| s.values())
                .map(|s| (s.id.table_key(), s)),
        )?;
        let rings = rows(state.rings.iter().map(|(db, r)| (db.to_string(), r)))?;
        let rollers = rows(state.rollers.values().map(|r| (r.id.to_string(), r)))?;
        let topics = rows(state.topics.values().map(|t| (t.id.to_string(), t)))?;
        let queues = rows(state.queues.values().map(|q| (q.id.to_string(), q)))?;
        let segments = rows(state.segments.values().map(|s| (s.table_key(), s)))?;
        let sequences = serde_json::to_vec(&state.seq).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        replace(&txn, NODES, nodes)?;
        replace(&txn, GROUPS, groups)?;
        replace(&txn, DATABASES, databases)?;
        replace(&txn, SLICES, slices)?;
        replace(&txn, RINGS, rings)?;
        replace(&txn, ROLLERS, rollers)?;
        replace(&txn, TOPICS, topics)?;
        replace(&txn, QUEUES, queues)?;
        replace(&txn, SEGMENTS, segments)?;
        write_meta(&txn, &sequences, applied)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            nodes = state.nodes.len(),
            databases = state.databases.len(),
            topics = state.topics.len(),
            segments = state.segments.len(),
            "cluster state persisted"
        );
        Ok(())
    }

    /// Persist `next` over a store that currently holds `prev`, writing
    /// only the records that changed and removing the ones that are gone.
    ///
    /// `prev` must be the state last written to this store; the result is
    /// then identical to `save_state(next, applied)`.
    pub fn save_changes(
        &self,
        prev: &ClusterState,
        next: &ClusterState,
        applied: Option<&[u8]>,
    ) -> StateResult<()> {
        let sequences = serde_json::to_vec(&next.seq).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut written = 0;
        written += write_changes(&txn, NODES, &prev.nodes, &next.nodes, |id, _| id.clone())?;
        written += write_changes(&txn, GROUPS, &prev.groups, &next.groups, |id, _| {
            id.to_string()
        })?;
        written += write_changes(&txn, DATABASES, &prev.databases, &next.databases, |id, _| {
            id.to_string()
        })?;
        written += write_changes(
            &txn,
            SLICES,
            &flat_slices(prev),
            &flat_slices(next),
            |id, _| id.table_key(),
        )?;
        written += write_changes(&txn, RINGS, &prev.rings, &next.rings, |id, _| id.to_string())?;
        written += write_changes(&txn, ROLLERS, &prev.rollers, &next.rollers, |id, _| {
            id.to_string()
        })?;
        written += write_changes(&txn, TOPICS, &prev.topics, &next.topics, |id, _| {
            id.to_string()
        })?;
        written += write_changes(&txn, QUEUES, &prev.queues, &next.queues, |id, _| {
            id.to_string()
        })?;
        written += write_changes(&txn, SEGMENTS, &prev.segments, &next.segments, |_, s| {
            s.table_key()
        })?;
        write_meta(&txn, &sequences, applied)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(records = written, "cluster state changes persisted");
        Ok(())
    }

    /// Load and validate the persisted state. An empty store yields the
    /// default state.
    pub fn load_state(&self) -> StateResult<ClusterState> {
        let mut state = ClusterState::default();
        for node in self.scan::<Node>(NODES, "")? {
            state.nodes.insert(node.id.clone(), node);
        }
        for group in self.scan::<NodeGroup>(GROUPS, "")? {
            state.groups.insert(group.id, group);
        }
        for database in self.scan::<Database>(DATABASES, "")? {
            state.databases.insert(database.id, database);
        }
        for (key, ring) in self.scan_keyed::<SlotRing>(RINGS, "")? {
            let id: DatabaseId = key
                .parse()
                .map_err(|_| StateError::Corrupt(format!("bad ring key {key}")))?;
            state.rings.insert(id, ring);
        }
        for slice in self.scan::<Slice>(SLICES, "")? {
            state
                .slices
                .entry(slice.id.database)
                .or_insert_with(BTreeMap::new)
                .insert(slice.id.slice, slice);
        }
        for roller in self.scan::<Roller>(ROLLERS, "")? {
            state.rollers.insert(roller.id, roller);
        }
        for topic in self.scan::<Topic>(TOPICS, "")? {
            state.topics.insert(topic.id, topic);
        }
        for queue in self.scan::<Queue>(QUEUES, "")? {
            state.queues.insert(queue.id, queue);
        }
        for segment in self.scan::<Segment>(SEGMENTS, "")? {
            state.segments.insert(segment.id, segment);
        }
        state.seq = self
            .get::<Sequences>(META, META_SEQUENCES)?
            .unwrap_or_default();

        state
            .validate()
            .map_err(|e| StateError::Corrupt(e.to_string()))?;
        Ok(state)
    }

    /// The applied marker written by the last `save_state`.
    pub fn applied(&self) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(table
            .get(META_APPLIED)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    // ── Records ────────────────────────────────────────────────────

    pub fn get_node(&self, node_id: &str) -> StateResult<Option<Node>> {
        self.get(NODES, node_id)
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.scan(NODES, "")
    }

    pub fn get_group(&self, group_id: u64) -> StateResult<Option<NodeGroup>> {
        self.get(GROUPS, &group_id.to_string())
    }

    pub fn get_ring(&self, database: DatabaseId) -> StateResult<Option<SlotRing>> {
        self.get(RINGS, &database.to_string())
    }

    pub fn get_slice(&self, id: SliceId) -> StateResult<Option<Slice>> {
        self.get(SLICES, &id.table_key())
    }

    /// All slices of a database.
    pub fn list_slices(&self, database: DatabaseId) -> StateResult<Vec<Slice>> {
        self.scan(SLICES, &format!("{database}."))
    }

    pub fn get_topic(&self, topic_id: u64) -> StateResult<Option<Topic>> {
        self.get(TOPICS, &topic_id.to_string())
    }

    /// Segments of a topic, ordered by slice then id.
    pub fn list_segments_for_topic(&self, topic_id: u64) -> StateResult<Vec<Segment>> {
        self.scan(SEGMENTS, &format!("{topic_id}/"))
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        Ok(self
            .scan_keyed(table, prefix)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    fn scan_keyed<T: DeserializeOwned>(
        &self,
        table: Table,
        prefix: &str,
    ) -> StateResult<Vec<(String, T)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let record: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push((key.value().to_string(), record));
            }
        }
        Ok(results)
    }
}

fn rows<'a, T: Serialize + 'a>(
    records: impl Iterator<Item = (String, &'a T)>,
) -> StateResult<Vec<(String, Vec<u8>)>> {
    records
        .map(|(key, record)| {
            serde_json::to_vec(record)
                .map(|value| (key, value))
                .map_err(map_err!(Serialize))
        })
        .collect()
}

/// Clear `table` and insert `rows` inside an open write transaction.
fn replace(txn: &WriteTransaction, table: Table, rows: Vec<(String, Vec<u8>)>) -> StateResult<()> {
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    let keys: Vec<String> = table
        .iter()
        .map_err(map_err!(Read))?
        .map(|entry| entry.map(|(key, _)| key.value().to_string()))
        .collect::<Result<_, _>>()
        .map_err(map_err!(Read))?;
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    for (key, value) in &rows {
        table
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}

fn write_meta(txn: &WriteTransaction, sequences: &[u8], applied: Option<&[u8]>) -> StateResult<()> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    meta.insert(META_SEQUENCES, sequences)
        .map_err(map_err!(Write))?;
    match applied {
        Some(applied) => {
            meta.insert(META_APPLIED, applied).map_err(map_err!(Write))?;
        }
        None => {
            meta.remove(META_APPLIED).map_err(map_err!(Write))?;
        }
    }
    Ok(())
}

fn flat_slices(state: &ClusterState) -> BTreeMap<SliceId, &Slice> {
    state
        .slices
        .values()
        .flat_map(|s| s.values())
        .map(|s| (s.id, s))
        .collect()
}

/// Upsert the records of `next` that differ from `prev` and remove those
/// only `prev` holds. Returns the number of rows touched.
fn write_changes<K: Ord, T: Serialize + PartialEq>(
    txn: &WriteTransaction,
    table: Table,
    prev: &BTreeMap<K, T>,
    next: &BTreeMap<K, T>,
    key: impl Fn(&K, &T) -> String,
) -> StateResult<usize> {
    let mut table = txn.open_table(table).map_err(map_err!(Table))?;
    let mut touched = 0;
    for (id, record) in next {
        if prev.get(id) == Some(record) {
            continue;
        }
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        table
            .insert(key(id, record).as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        touched += 1;
    }
    for (id, record) in prev {
        if !next.contains_key(id) {
            table
                .remove(key(id, record).as_str())
                .map_err(map_err!(Write))?;
            touched += 1;
        }
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliced_core::Suffrage;

    fn sample_state() -> ClusterState {
        let mut state = ClusterState::default();
        state.nodes.insert(
            "n1".into(),
            Node {
                id: "n1".into(),
                host: "10.0.0.1".into(),
                created: 100,
                ..Default::default()
            },
        );
        let gid = state.seq.next_group();
        state.groups.insert(
            gid,
            NodeGroup {
                id: gid,
                name: "meta".into(),
                members: vec![RaftMember::new("n1", "10.0.0.1:7000", Suffrage::Voter)],
            },
        );
        let db = state.seq.next_database();
        state.databases.insert(
            db,
            Database {
                id: db,
                name: "main".into(),
                description: String::new(),
                created: 100,
                changed: 100,
                dropped: 0,
                removed: 0,
                layout: RingLayout::Spread,
                rebalances: BTreeMap::new(),
            },
        );
        state.rings.insert(db, SlotRing::balanced(100, 2));
        let slices = (0..2)
            .map(|n| {
                (
                    n,
                    Slice {
                        id: SliceId::new(db, n),
                        group: gid,
                        slots: Vec::new(),
                        nodes: Vec::new(),
                        drained: false,
                    },
                )
            })
            .collect();
        state.slices.insert(db, slices);
        state.sync_slice_slots(db);
        state.sync_slice_nodes(gid);
        state
    }

    #[test]
    fn save_and_load_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let state = sample_state();
        store.save_state(&state, Some(b"log-7")).unwrap();

        assert_eq!(store.load_state().unwrap(), state);
        assert_eq!(store.applied().unwrap().as_deref(), Some(&b"log-7"[..]));
    }

    #[test]
    fn save_replaces_removed_records() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = sample_state();
        store.save_state(&state, None).unwrap();

        state.nodes.clear();
        store.save_state(&state, None).unwrap();
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.applied().unwrap().is_none());
    }

    #[test]
    fn save_changes_touches_only_what_moved() {
        let store = StateStore::open_in_memory().unwrap();
        let prev = sample_state();
        store.save_state(&prev, Some(b"1")).unwrap();

        let mut next = prev.clone();
        next.nodes.get_mut("n1").unwrap().host = "10.0.0.9".into();
        next.slices.get_mut(&1).unwrap().remove(&1);
        next.rings.insert(1, SlotRing::balanced(100, 1));
        next.sync_slice_slots(1);
        next.seq.next_topic();

        // A record this save must not rewrite: plant a marker under its key
        // and check it survives.
        {
            let txn = store.db.begin_write().unwrap();
            {
                let mut groups = txn.open_table(GROUPS).unwrap();
                let mut group = prev.groups[&1].clone();
                group.name = "planted".into();
                let bytes = serde_json::to_vec(&group).unwrap();
                groups.insert("1", bytes.as_slice()).unwrap();
            }
            txn.commit().unwrap();
        }

        store.save_changes(&prev, &next, Some(b"2")).unwrap();

        assert_eq!(store.get_node("n1").unwrap().unwrap().host, "10.0.0.9");
        assert!(store.get_slice(SliceId::new(1, 1)).unwrap().is_none());
        assert_eq!(store.list_slices(1).unwrap().len(), 1);
        assert_eq!(store.get_group(1).unwrap().unwrap().name, "planted");
        assert_eq!(store.applied().unwrap().as_deref(), Some(&b"2"[..]));

        let mut loaded = store.load_state().unwrap();
        loaded.groups = next.groups.clone();
        assert_eq!(loaded, next);
    }

    #[test]
    fn typed_accessors() {
        let store = StateStore::open_in_memory().unwrap();
        store.save_state(&sample_state(), None).unwrap();

        assert_eq!(store.get_node("n1").unwrap().unwrap().host, "10.0.0.1");
        assert!(store.get_node("nope").unwrap().is_none());
        assert_eq!(store.get_group(1).unwrap().unwrap().name, "meta");
        assert_eq!(store.get_ring(1).unwrap().unwrap().slot_count(1), 50);
        assert_eq!(store.list_slices(1).unwrap().len(), 2);
        assert_eq!(
            store.get_slice(SliceId::new(1, 1)).unwrap().unwrap().nodes.len(),
            1
        );
        assert!(store.list_segments_for_topic(1).unwrap().is_empty());
    }

    #[test]
    fn empty_store_loads_default_state() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.load_state().unwrap(), ClusterState::default());
    }

    #[test]
    fn corrupt_ring_is_rejected_on_load() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = sample_state();
        if let Some(slice) = state.slices.get_mut(&1).and_then(|s| s.get_mut(&0)) {
            slice.slots.clear();
        }
        store.save_state(&state, None).unwrap();
        assert!(matches!(store.load_state(), Err(StateError::Corrupt(_))));
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.save_state(&sample_state(), Some(b"1")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.load_state().unwrap(), sample_state());
    }
}
