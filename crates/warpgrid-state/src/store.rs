//! StateStore — redb-backed persistence of check results.
//!
//! Holds the latest `QueryResult` per `(allocation, check)`. The in-memory
//! check store in `warpgrid-health` is the source of truth for reads; this
//! store exists so results can be restored after a client restart. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;
use warp_core::{CheckId, QueryResult};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CHECK_RESULTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace the latest result of a check.
    pub fn put_check_result(&self, alloc_id: &str, result: &QueryResult) -> StateResult<()> {
        let key = result_key(alloc_id, &result.id);
        let value = serde_json::to_vec(result).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CHECK_RESULTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Latest results of every check of an allocation.
    pub fn list_check_results(
        &self,
        alloc_id: &str,
    ) -> StateResult<HashMap<CheckId, QueryResult>> {
        let prefix = alloc_prefix(alloc_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECK_RESULTS).map_err(map_err!(Table))?;
        let mut results = HashMap::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            if key_alloc(key.value()) != Some(alloc_id) {
                continue;
            }
            let result: QueryResult =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.insert(result.id.clone(), result);
        }
        Ok(results)
    }

    /// Every persisted result, grouped by allocation ID.
    pub fn list_all_check_results(
        &self,
    ) -> StateResult<HashMap<String, HashMap<CheckId, QueryResult>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CHECK_RESULTS).map_err(map_err!(Table))?;
        let mut results: HashMap<String, HashMap<CheckId, QueryResult>> = HashMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let alloc_id = key_alloc(key.value())
                .ok_or_else(|| StateError::Key(key.value().to_string()))?;
            let result: QueryResult =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results
                .entry(alloc_id.to_string())
                .or_default()
                .insert(result.id.clone(), result);
        }
        Ok(results)
    }

    /// Delete an explicit subset of an allocation's results. Returns number deleted.
    pub fn delete_check_results(&self, alloc_id: &str, ids: &[CheckId]) -> StateResult<u32> {
        if ids.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut table = txn.open_table(CHECK_RESULTS).map_err(map_err!(Table))?;
            for id in ids {
                let key = result_key(alloc_id, id);
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%alloc_id, count, "check results deleted");
        Ok(count)
    }

    /// Delete all results of an allocation. Returns number deleted.
    pub fn purge_check_results(&self, alloc_id: &str) -> StateResult<u32> {
        let prefix = alloc_prefix(alloc_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = {
            let mut table = txn.open_table(CHECK_RESULTS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let key = key.value();
                if !key.starts_with(&prefix) {
                    break;
                }
                if key_alloc(key) == Some(alloc_id) {
                    keys.push(key.to_string());
                }
            }
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            keys.len() as u32
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%alloc_id, count, "check results purged");
        Ok(count)
    }
}

fn alloc_prefix(alloc_id: &str) -> String {
    format!("{alloc_id}:")
}

fn result_key(alloc_id: &str, check_id: &CheckId) -> String {
    format!("{alloc_id}:{check_id}")
}

/// Allocation part of a result key. Check IDs never contain ':'.
fn key_alloc(key: &str) -> Option<&str> {
    key.rsplit_once(':').map(|(alloc_id, _)| alloc_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warp_core::{CheckResult, Kind};

    fn test_result(id: &str, result: CheckResult) -> QueryResult {
        QueryResult {
            id: CheckId::from(id.to_string()),
            kind: Kind::Healthiness,
            result,
            output: "ok".to_string(),
            timestamp: 1000,
        }
    }

    #[test]
    fn put_and_list() {
        let store = StateStore::open_in_memory().unwrap();
        let qr = test_result("c1", CheckResult::Success);

        store.put_check_result("alloc-1", &qr).unwrap();
        let listed = store.list_check_results("alloc-1").unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[&qr.id], qr);
    }

    #[test]
    fn put_replaces_previous_result() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_check_result("alloc-1", &test_result("c1", CheckResult::Missing))
            .unwrap();
        store
            .put_check_result("alloc-1", &test_result("c1", CheckResult::Critical))
            .unwrap();

        let listed = store.list_check_results("alloc-1").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed.values().next().unwrap().result, CheckResult::Critical);
    }

    #[test]
    fn list_is_scoped_to_allocation() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_check_result("alloc-1", &test_result("c1", CheckResult::Success))
            .unwrap();
        store
            .put_check_result("alloc-10", &test_result("c2", CheckResult::Success))
            .unwrap();

        // "alloc-1:" must not match keys of "alloc-10".
        assert_eq!(store.list_check_results("alloc-1").unwrap().len(), 1);
        assert_eq!(store.list_check_results("alloc-10").unwrap().len(), 1);
        assert!(store.list_check_results("nope").unwrap().is_empty());
    }

    #[test]
    fn delete_subset() {
        let store = StateStore::open_in_memory().unwrap();
        for id in ["c1", "c2", "c3"] {
            store
                .put_check_result("alloc-1", &test_result(id, CheckResult::Success))
                .unwrap();
        }

        let ids = [CheckId::from("c1".to_string()), CheckId::from("c9".to_string())];
        assert_eq!(store.delete_check_results("alloc-1", &ids).unwrap(), 1);

        let listed = store.list_check_results("alloc-1").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(!listed.contains_key(&ids[0]));
        assert_eq!(store.delete_check_results("alloc-1", &[]).unwrap(), 0);
    }

    #[test]
    fn purge_removes_only_one_allocation() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_check_result("alloc-1", &test_result("c1", CheckResult::Success))
            .unwrap();
        store
            .put_check_result("alloc-1", &test_result("c2", CheckResult::Success))
            .unwrap();
        store
            .put_check_result("alloc-2", &test_result("c1", CheckResult::Success))
            .unwrap();

        assert_eq!(store.purge_check_results("alloc-1").unwrap(), 2);
        assert!(store.list_check_results("alloc-1").unwrap().is_empty());
        assert_eq!(store.list_check_results("alloc-2").unwrap().len(), 1);
        assert_eq!(store.purge_check_results("alloc-1").unwrap(), 0);
    }

    #[test]
    fn allocation_ids_sharing_a_prefix_stay_apart() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_check_result("alloc-1", &test_result("c1", CheckResult::Success))
            .unwrap();
        store
            .put_check_result("alloc-1:x", &test_result("c2", CheckResult::Critical))
            .unwrap();

        let listed = store.list_check_results("alloc-1").unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.contains_key(&CheckId::from("c1".to_string())));

        assert_eq!(store.purge_check_results("alloc-1").unwrap(), 1);
        assert_eq!(store.list_check_results("alloc-1:x").unwrap().len(), 1);
        assert_eq!(store.list_all_check_results().unwrap()["alloc-1:x"].len(), 1);
    }

    #[test]
    fn list_all_groups_by_allocation() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_check_result("alloc-1", &test_result("c1", CheckResult::Success))
            .unwrap();
        store
            .put_check_result("alloc-2", &test_result("c2", CheckResult::Critical))
            .unwrap();
        store
            .put_check_result("alloc-2", &test_result("c3", CheckResult::Missing))
            .unwrap();

        let all = store.list_all_check_results().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["alloc-1"].len(), 1);
        assert_eq!(all["alloc-2"].len(), 2);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("checks.redb");
        let qr = test_result("c1", CheckResult::Critical);

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_check_result("alloc-1", &qr).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let listed = store.list_check_results("alloc-1").unwrap();
        assert_eq!(listed.get(&qr.id), Some(&qr));
    }
}
