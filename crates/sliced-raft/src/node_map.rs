//! Mapping between cluster node ids (strings) and openraft's u64 ids.
//!
//! Raft ids are derived from the first eight bytes of the SHA-256 of the
//! node id and stepped upward on collision. Assignments are persisted so
//! a node keeps its Raft id across restarts even if assignment order would
//! differ.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use sha2::{Digest, Sha256};
use tracing::debug;

use sliced_state::{StateError, StateResult};

const ID_TABLE: TableDefinition<u64, &str> = TableDefinition::new("raft_node_ids");

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Debug, Default)]
struct Ids {
    by_node: BTreeMap<String, u64>,
    by_raft: BTreeMap<u64, String>,
}

impl Ids {
    fn insert(&mut self, raft_id: u64, node_id: &str) {
        self.by_node.insert(node_id.to_string(), raft_id);
        self.by_raft.insert(raft_id, node_id.to_string());
    }
}

pub struct NodeIdMap {
    db: Arc<Database>,
    ids: Mutex<Ids>,
}

impl NodeIdMap {
    /// Open the map and load every persisted assignment.
    pub fn open(db: Arc<Database>) -> StateResult<Self> {
        let mut ids = Ids::default();
        {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            txn.open_table(ID_TABLE).map_err(map_err!(Table))?;
            txn.commit().map_err(map_err!(Transaction))?;
        }
        {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(ID_TABLE).map_err(map_err!(Table))?;
            for item in table.iter().map_err(map_err!(Read))? {
                let (k, v) = item.map_err(map_err!(Read))?;
                ids.insert(k.value(), v.value());
            }
        }
        debug!(count = ids.by_node.len(), "node id map loaded");
        Ok(Self {
            db,
            ids: Mutex::new(ids),
        })
    }

    /// Raft id for `node_id`, assigning and persisting one if needed.
    pub fn resolve(&self, node_id: &str) -> StateResult<u64> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = ids.by_node.get(node_id) {
            return Ok(id);
        }
        let mut raft_id = derive(node_id);
        while ids.by_raft.contains_key(&raft_id) {
            raft_id = raft_id.wrapping_add(1).max(1);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ID_TABLE).map_err(map_err!(Table))?;
            table.insert(raft_id, node_id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        ids.insert(raft_id, node_id);
        debug!(node_id, raft_id, "assigned raft id");
        Ok(raft_id)
    }

    pub fn raft_id(&self, node_id: &str) -> Option<u64> {
        let ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.by_node.get(node_id).copied()
    }

    pub fn node_id(&self, raft_id: u64) -> Option<String> {
        let ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.by_raft.get(&raft_id).cloned()
    }

    pub fn len(&self) -> usize {
        let ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        ids.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Never zero; openraft treats 0 specially in some metrics paths.
fn derive(node_id: &str) -> u64 {
    let digest = Sha256::digest(node_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes).max(1)
}
