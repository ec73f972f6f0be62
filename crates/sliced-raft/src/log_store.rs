//! Raft log storage backed by redb.
//!
//! Each group keeps its entries and its vote/committed/purged markers in
//! its own pair of tables (`raft_log.{group}`, `raft_meta.{group}`), so
//! several groups can share one redb file with the state store.

use std::fmt::Debug;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::storage::{LogFlushed, LogState, RaftLogReader, RaftLogStorage};
use openraft::{Entry, LogId, StorageError, Vote};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use sliced_core::GroupId;

use crate::error::{read_err, write_err};
use crate::typ::TypeConfig;

const VOTE_KEY: &str = "vote";
const COMMITTED_KEY: &str = "committed";
const LAST_PURGED_KEY: &str = "last_purged";

#[derive(Debug, Clone)]
struct Tables {
    log: String,
    meta: String,
}

impl Tables {
    fn new(group: GroupId) -> Self {
        Self {
            log: format!("raft_log.{group}"),
            meta: format!("raft_meta.{group}"),
        }
    }

    fn log(&self) -> TableDefinition<'_, u64, &'static [u8]> {
        TableDefinition::new(&self.log)
    }

    fn meta(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.meta)
    }
}

/// Raft log storage for one group.
pub struct LogStore {
    db: Arc<Database>,
    tables: Tables,
}

/// Read-only view of a group's log.
pub struct LogReader {
    db: Arc<Database>,
    tables: Tables,
}

impl LogStore {
    pub fn open(db: Arc<Database>, group: GroupId) -> Result<Self, StorageError<u64>> {
        let tables = Tables::new(group);
        let txn = db.begin_write().map_err(write_err)?;
        txn.open_table(tables.log()).map_err(write_err)?;
        txn.open_table(tables.meta()).map_err(write_err)?;
        txn.commit().map_err(write_err)?;
        debug!(group, "raft log opened");
        Ok(Self { db, tables })
    }

    fn reader(&self) -> LogReader {
        LogReader {
            db: Arc::clone(&self.db),
            tables: self.tables.clone(),
        }
    }

    fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError<u64>> {
        let data = serde_json::to_vec(value).map_err(write_err)?;
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(self.tables.meta()).map_err(write_err)?;
            table.insert(key, data.as_slice()).map_err(write_err)?;
        }
        txn.commit().map_err(write_err)?;
        Ok(())
    }

    fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(self.tables.meta()).map_err(read_err)?;
        match table.get(key).map_err(read_err)? {
            Some(val) => Ok(Some(serde_json::from_slice(val.value()).map_err(read_err)?)),
            None => Ok(None),
        }
    }

    /// Remove every entry whose index falls in `range`.
    fn remove_range(&self, range: impl RangeBounds<u64>) -> Result<usize, StorageError<u64>> {
        let txn = self.db.begin_write().map_err(write_err)?;
        let removed;
        {
            let mut table = txn.open_table(self.tables.log()).map_err(write_err)?;
            let keys: Vec<u64> = table
                .range(range)
                .map_err(write_err)?
                .map(|item| item.map(|(k, _)| k.value()))
                .collect::<Result<_, _>>()
                .map_err(write_err)?;
            for key in &keys {
                table.remove(*key).map_err(write_err)?;
            }
            removed = keys.len();
        }
        txn.commit().map_err(write_err)?;
        Ok(removed)
    }
}

impl RaftLogReader<TypeConfig> for LogReader {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let txn = self.db.begin_read().map_err(read_err)?;
        let table = txn.open_table(self.tables.log()).map_err(read_err)?;
        table
            .range(range)
            .map_err(read_err)?
            .map(|item| {
                let (_, val) = item.map_err(read_err)?;
                serde_json::from_slice(val.value()).map_err(read_err)
            })
            .collect()
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        self.reader().try_get_log_entries(range).await
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = LogReader;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let last_log_id = {
            let txn = self.db.begin_read().map_err(read_err)?;
            let table = txn.open_table(self.tables.log()).map_err(read_err)?;
            match table.last().map_err(read_err)? {
                Some((_, val)) => {
                    let entry: Entry<TypeConfig> =
                        serde_json::from_slice(val.value()).map_err(read_err)?;
                    Some(entry.log_id)
                }
                None => None,
            }
        };
        let last_purged_log_id: Option<LogId<u64>> = self.get_meta(LAST_PURGED_KEY)?;
        Ok(LogState {
            last_purged_log_id,
            // An empty log after a purge still ends at the purge point.
            last_log_id: last_log_id.or(last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.reader()
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        self.put_meta(VOTE_KEY, vote)?;
        debug!(%vote, "saved vote");
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        self.get_meta(VOTE_KEY)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let txn = self.db.begin_write().map_err(write_err)?;
        {
            let mut table = txn.open_table(self.tables.log()).map_err(write_err)?;
            for entry in entries {
                let data = serde_json::to_vec(&entry).map_err(write_err)?;
                table
                    .insert(entry.log_id.index, data.as_slice())
                    .map_err(write_err)?;
            }
        }
        txn.commit().map_err(write_err)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let removed = self.remove_range(log_id.index..)?;
        debug!(index = log_id.index, removed, "truncated log");
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        self.put_meta(LAST_PURGED_KEY, &log_id)?;
        let removed = self.remove_range(..=log_id.index)?;
        debug!(index = log_id.index, removed, "purged log");
        Ok(())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<u64>>,
    ) -> Result<(), StorageError<u64>> {
        if let Some(log_id) = committed {
            self.put_meta(COMMITTED_KEY, &log_id)?;
        }
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<u64>>, StorageError<u64>> {
        self.get_meta(COMMITTED_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::{CommittedLeaderId, EntryPayload};
    use redb::backends::InMemoryBackend;

    use crate::typ::Request;

    fn test_db() -> Arc<Database> {
        let backend = InMemoryBackend::new();
        Arc::new(Database::builder().create_with_backend(backend).unwrap())
    }

    fn entry(index: u64) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(Request {
                payload: format!(r#"{{"type":"create_group","name":"g{index}"}}"#),
            }),
        }
    }

    // LogFlushed::new is crate-private in openraft, so entries are
    // written straight into the group's table.
    fn seed(db: &Database, group: GroupId, indexes: impl IntoIterator<Item = u64>) {
        let tables = Tables::new(group);
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(tables.log()).unwrap();
            for index in indexes {
                let data = serde_json::to_vec(&entry(index)).unwrap();
                table.insert(index, data.as_slice()).unwrap();
            }
        }
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn empty_log_state() {
        let mut store = LogStore::open(test_db(), 1).unwrap();
        let state = store.get_log_state().await.unwrap();
        assert!(state.last_log_id.is_none());
        assert!(state.last_purged_log_id.is_none());
        assert!(store.read_vote().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn groups_do_not_share_entries() {
        let db = test_db();
        let mut a = LogStore::open(Arc::clone(&db), 1).unwrap();
        let mut b = LogStore::open(Arc::clone(&db), 2).unwrap();
        seed(&db, 1, 1..=3);

        assert_eq!(a.try_get_log_entries(1..=3).await.unwrap().len(), 3);
        assert!(b.try_get_log_entries(..).await.unwrap().is_empty());

        a.save_vote(&Vote::new(2, 9)).await.unwrap();
        assert!(b.read_vote().await.unwrap().is_none());
        assert_eq!(a.read_vote().await.unwrap(), Some(Vote::new(2, 9)));
    }

    #[tokio::test]
    async fn truncate_and_purge() {
        let db = test_db();
        let mut store = LogStore::open(Arc::clone(&db), 1).unwrap();
        seed(&db, 1, 1..=6);

        store
            .truncate(LogId::new(CommittedLeaderId::new(1, 1), 5))
            .await
            .unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(4));

        let purge_at = LogId::new(CommittedLeaderId::new(1, 1), 4);
        store.purge(purge_at).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(purge_at));
        assert_eq!(state.last_log_id, Some(purge_at));
        assert!(store.try_get_log_entries(..).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn committed_survives_reopen() {
        let db = test_db();
        let log_id = LogId::new(CommittedLeaderId::new(3, 1), 11);
        {
            let mut store = LogStore::open(Arc::clone(&db), 1).unwrap();
            store.save_committed(Some(log_id)).await.unwrap();
        }
        let mut store = LogStore::open(db, 1).unwrap();
        assert_eq!(store.read_committed().await.unwrap(), Some(log_id));
    }
}
