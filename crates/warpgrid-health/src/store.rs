//! Check result store — latest result per check, per allocation.
//!
//! Sits one layer above the durable [`StateDb`] so reads never touch disk:
//! the in-memory map is the source of truth and every mutation is written
//! through. A failed durable write is returned to the caller, but the
//! in-memory view is updated regardless.
//!
//! Mutations hold the write lock across the durable write, so memory and
//! disk apply concurrent `set`/`keep`/`purge` calls in the same order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use warp_core::{CheckId, QueryResult};
use warpgrid_state::{StateResult, StateStore};

/// Latest result per check of one allocation.
pub type AllocResultMap = HashMap<CheckId, QueryResult>;

/// Durable storage for check results.
pub trait StateDb: Send + Sync {
    fn put_check_result(&self, alloc_id: &str, result: &QueryResult) -> StateResult<()>;

    fn delete_check_results(&self, alloc_id: &str, ids: &[CheckId]) -> StateResult<()>;

    fn purge_check_results(&self, alloc_id: &str) -> StateResult<()>;

    fn load_check_results(&self) -> StateResult<HashMap<String, AllocResultMap>>;
}

impl StateDb for StateStore {
    fn put_check_result(&self, alloc_id: &str, result: &QueryResult) -> StateResult<()> {
        StateStore::put_check_result(self, alloc_id, result)
    }

    fn delete_check_results(&self, alloc_id: &str, ids: &[CheckId]) -> StateResult<()> {
        StateStore::delete_check_results(self, alloc_id, ids).map(|_| ())
    }

    fn purge_check_results(&self, alloc_id: &str) -> StateResult<()> {
        StateStore::purge_check_results(self, alloc_id).map(|_| ())
    }

    fn load_check_results(&self) -> StateResult<HashMap<String, AllocResultMap>> {
        self.list_all_check_results()
    }
}

/// Concurrency-safe store of the latest check results on this client.
///
/// Cheap to clone; clones share the same maps.
#[derive(Clone)]
pub struct CheckStore {
    db: Arc<dyn StateDb>,
    current: Arc<RwLock<HashMap<String, AllocResultMap>>>,
}

impl CheckStore {
    pub fn new(db: Arc<dyn StateDb>) -> Self {
        Self {
            db,
            current: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Load every persisted result into memory. Returns the number of
    /// allocations restored.
    pub fn restore(&self) -> StateResult<usize> {
        let loaded = self.db.load_check_results()?;
        let count = loaded.len();
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        for (alloc_id, results) in loaded {
            current.entry(alloc_id).or_default().extend(results);
        }
        debug!(allocs = count, "check results restored");
        Ok(count)
    }

    /// Record the latest result of a check.
    pub fn set(&self, alloc_id: &str, result: QueryResult) -> StateResult<()> {
        trace!(%alloc_id, check_id = %result.id, result = %result.result, "setting check status");
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        current
            .entry(alloc_id.to_string())
            .or_default()
            .insert(result.id.clone(), result.clone());
        self.db.put_check_result(alloc_id, &result)
    }

    /// A copy of the latest results of an allocation; empty if unknown.
    pub fn list(&self, alloc_id: &str) -> AllocResultMap {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.get(alloc_id).cloned().unwrap_or_default()
    }

    /// Drop every result of `alloc_id` whose check is not in `keep`.
    pub fn keep(&self, alloc_id: &str, keep: &[CheckId]) -> StateResult<()> {
        let keep: HashSet<&CheckId> = keep.iter().collect();
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let Some(results) = current.get_mut(alloc_id) else {
            return Ok(());
        };
        let remove: Vec<CheckId> = results
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        for id in &remove {
            results.remove(id);
        }

        if remove.is_empty() {
            return Ok(());
        }
        debug!(%alloc_id, removed = remove.len(), "reconciled check results");
        self.db.delete_check_results(alloc_id, &remove)
    }

    /// Drop every result of an allocation.
    pub fn purge(&self, alloc_id: &str) -> StateResult<()> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        current.remove(alloc_id);
        debug!(%alloc_id, "purged check results");
        self.db.purge_check_results(alloc_id)
    }
}
