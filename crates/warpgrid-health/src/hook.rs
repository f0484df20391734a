//! Checks hook — runs the native service checks of one allocation.
//!
//! The hook derives the allocation's check set from its job spec, seeds a
//! pending result per check, and runs one [`Observer`] per check. On an
//! allocation update the whole observer set is replaced and the store is
//! reconciled against the new check set; on kill everything is stopped and
//! the allocation's results are purged.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use warp_core::checks::epoch_secs;
use warp_core::{
    find_checks, Allocation, CheckDefinition, CheckId, QueryResult, ServiceProvider,
};

use crate::checker::Checker;
use crate::error::{ChecksError, ChecksResult};
use crate::observer::Observer;
use crate::store::CheckStore;

/// Name of this hook as it appears in logs.
pub const CHECKS_HOOK_NAME: &str = "checks_hook";

/// Derive the checks of an allocation that this client runs itself.
pub fn native_checks(alloc: &Allocation) -> ChecksResult<Vec<CheckDefinition>> {
    let checks = find_checks(alloc).ok_or_else(|| ChecksError::TaskGroupNotFound {
        alloc_id: alloc.id.clone(),
        group: alloc.task_group.clone(),
    })?;
    Ok(checks
        .into_iter()
        .filter(|c| c.provider == ServiceProvider::Native)
        .collect())
}

/// Running observers that share one shutdown channel.
struct ObserverSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ObserverSet {
    /// Signal every observer and wait for all of them to exit.
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct HookState {
    checks: BTreeMap<CheckId, CheckDefinition>,
    observers: Option<ObserverSet>,
}

/// Manages the native checks of one allocation.
pub struct ChecksHook {
    alloc_id: String,
    store: CheckStore,
    checker: Arc<dyn Checker>,
    state: Mutex<HookState>,
}

impl ChecksHook {
    /// Create the hook. A missing task group leaves the check set empty.
    pub fn new(alloc: &Allocation, store: CheckStore, checker: Arc<dyn Checker>) -> Self {
        Self {
            alloc_id: alloc.id.clone(),
            store,
            checker,
            state: Mutex::new(HookState {
                checks: checks_by_id(alloc),
                observers: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        CHECKS_HOOK_NAME
    }

    /// IDs of the checks currently managed.
    pub fn checks(&self) -> Vec<CheckId> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.checks.keys().cloned().collect()
    }

    /// Seed a pending result per check and start the observers.
    ///
    /// A failed durable seed is logged; the observers start regardless.
    /// Must be called within a tokio runtime.
    pub fn prerun(&self) -> ChecksResult<()> {
        let now = epoch_secs();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        for def in state.checks.values() {
            let pending = QueryResult::pending(def.id.clone(), def.kind(), now);
            if let Err(e) = self.store.set(&self.alloc_id, pending) {
                error!(alloc_id = %self.alloc_id, check_id = %def.id, error = %e, "failed to seed check result");
            }
        }

        if let Some(old) = state.observers.take() {
            // Observers exit on their own once signalled.
            let _ = old.shutdown.send(true);
        }
        let observers = self.start_observers(state.checks.values());
        state.observers = Some(observers);

        info!(
            hook = CHECKS_HOOK_NAME,
            alloc_id = %self.alloc_id,
            checks = state.checks.len(),
            "checks started"
        );
        Ok(())
    }

    /// Replace the check set after an allocation spec change.
    ///
    /// When this returns, the store holds results only for checks of the new
    /// spec, and an observer runs for each of them.
    pub async fn update(&self, alloc: &Allocation) -> ChecksResult<()> {
        let new_checks = checks_by_id(alloc);

        let (old_observers, added) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let added: Vec<CheckDefinition> = new_checks
                .values()
                .filter(|def| !state.checks.contains_key(&def.id))
                .cloned()
                .collect();
            state.checks = new_checks;
            (state.observers.take(), added)
        };

        if let Some(observers) = old_observers {
            observers.stop().await;
        }

        let keep = self.checks();
        let reconciled = self.store.keep(&self.alloc_id, &keep);

        let now = epoch_secs();
        for def in &added {
            let pending = QueryResult::pending(def.id.clone(), def.kind(), now);
            if let Err(e) = self.store.set(&self.alloc_id, pending) {
                error!(alloc_id = %self.alloc_id, check_id = %def.id, error = %e, "failed to seed check result");
            }
        }

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let observers = self.start_observers(state.checks.values());
            state.observers = Some(observers);
        }

        debug!(
            alloc_id = %self.alloc_id,
            checks = keep.len(),
            added = added.len(),
            "checks updated"
        );
        reconciled.map_err(ChecksError::from)
    }

    /// Stop every observer and purge the allocation's results.
    pub async fn prekill(&self) {
        let observers = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.observers.take()
        };
        if let Some(observers) = observers {
            observers.stop().await;
        }

        if let Err(e) = self.store.purge(&self.alloc_id) {
            error!(alloc_id = %self.alloc_id, error = %e, "failed to purge check results");
        }
        info!(hook = CHECKS_HOOK_NAME, alloc_id = %self.alloc_id, "checks stopped");
    }

    fn start_observers<'a>(
        &self,
        checks: impl Iterator<Item = &'a CheckDefinition>,
    ) -> ObserverSet {
        let (shutdown, rx) = watch::channel(false);
        let handles = checks
            .map(|def| {
                let obs = Observer::new(&self.alloc_id, def, self.checker.clone(), self.store.clone());
                tokio::spawn(obs.run(rx.clone()))
            })
            .collect();
        ObserverSet { shutdown, handles }
    }
}

fn checks_by_id(alloc: &Allocation) -> BTreeMap<CheckId, CheckDefinition> {
    match native_checks(alloc) {
        Ok(checks) => checks.into_iter().map(|c| (c.id.clone(), c)).collect(),
        Err(e) => {
            error!(alloc_id = %alloc.id, error = %e, "unable to derive checks");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use warp_core::*;
    use warpgrid_state::{StateError, StateResult, StateStore};

    use crate::checker::ProbeOutcome;
    use crate::store::{AllocResultMap, StateDb};

    #[derive(Default)]
    struct OkChecker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Checker for OkChecker {
        async fn check(&self, _: &Query) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ProbeOutcome::success("ok")
        }
    }

    fn check(name: &str) -> ServiceCheck {
        ServiceCheck {
            name: name.to_string(),
            check_type: CheckType::Tcp,
            path: None,
            method: None,
            address: Some("127.0.0.1:1".to_string()),
            interval: "5s".to_string(),
            timeout: None,
            on_update: OnUpdate::RequireHealthy,
        }
    }

    fn service(name: &str, provider: ServiceProvider, checks: &[&str]) -> Service {
        Service {
            name: name.to_string(),
            provider,
            address: None,
            checks: checks.iter().map(|c| check(c)).collect(),
        }
    }

    fn alloc(group_checks: &[&str], task_checks: &[&str]) -> Allocation {
        Allocation {
            id: "alloc-1".to_string(),
            task_group: "web".to_string(),
            job: JobSpec {
                id: "job".to_string(),
                task_groups: vec![TaskGroup {
                    name: "web".to_string(),
                    tasks: vec![Task {
                        name: "api".to_string(),
                        lifecycle: None,
                        services: vec![
                            service("api", ServiceProvider::Native, task_checks),
                            service("mesh", ServiceProvider::External, &["external"]),
                        ],
                    }],
                    services: vec![service("web", ServiceProvider::Native, group_checks)],
                    update: UpdateStrategy::default(),
                }],
            },
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            task_states: Default::default(),
        }
    }

    fn store() -> CheckStore {
        CheckStore::new(Arc::new(StateStore::open_in_memory().unwrap()))
    }

    fn id(scope: &str, name: &str) -> CheckId {
        CheckId::new("alloc-1", "web", scope, name)
    }

    #[test]
    fn native_checks_skip_external_provider() {
        let checks = native_checks(&alloc(&["g"], &["t"])).unwrap();
        let ids: Vec<_> = checks.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![id("group", "g"), id("api", "t")]);
    }

    #[test]
    fn native_checks_unknown_group_is_error() {
        let mut a = alloc(&["g"], &[]);
        a.task_group = "gone".to_string();
        assert!(matches!(
            native_checks(&a),
            Err(ChecksError::TaskGroupNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn prerun_seeds_pending_then_observes() {
        let store = store();
        let checker = Arc::new(OkChecker::default());
        let hook = ChecksHook::new(&alloc(&["g"], &["t"]), store.clone(), checker.clone());
        assert_eq!(hook.name(), "checks_hook");

        hook.prerun().unwrap();
        let seeded = store.list("alloc-1");
        assert_eq!(seeded.len(), 2);
        assert!(seeded.values().all(|r| r.result == CheckResult::Missing));

        tokio::time::sleep(Duration::from_millis(1)).await;
        let observed = store.list("alloc-1");
        assert!(observed.values().all(|r| r.result == CheckResult::Success));
        assert_eq!(checker.calls.load(Ordering::SeqCst), 2);

        hook.prekill().await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_task_group_runs_nothing() {
        let store = store();
        let mut a = alloc(&["g"], &[]);
        a.task_group = "gone".to_string();
        let hook = ChecksHook::new(&a, store.clone(), Arc::new(OkChecker::default()));

        hook.prerun().unwrap();
        assert!(hook.checks().is_empty());
        assert!(store.list("alloc-1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_reconciles_store_with_new_checks() {
        let store = store();
        let checker = Arc::new(OkChecker::default());
        let hook = ChecksHook::new(&alloc(&["g1", "g2"], &[]), store.clone(), checker);
        hook.prerun().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        hook.update(&alloc(&["g2"], &["t1"])).await.unwrap();

        let results = store.list("alloc-1");
        let mut ids: Vec<_> = results.keys().cloned().collect();
        ids.sort();
        let mut expected = vec![id("group", "g2"), id("api", "t1")];
        expected.sort();
        assert_eq!(ids, expected);
        // Retained check keeps its observed result; the new one starts pending.
        assert_eq!(results[&id("group", "g2")].result, CheckResult::Success);
        assert_eq!(results[&id("api", "t1")].result, CheckResult::Missing);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            store.list("alloc-1")[&id("api", "t1")].result,
            CheckResult::Success
        );
        hook.prekill().await;
    }

    #[tokio::test(start_paused = true)]
    async fn prekill_stops_observers_and_purges() {
        let store = store();
        let checker = Arc::new(OkChecker::default());
        store
            .set(
                "alloc-2",
                QueryResult::pending(id("group", "other"), Kind::Healthiness, 1),
            )
            .unwrap();
        let hook = ChecksHook::new(&alloc(&["g"], &[]), store.clone(), checker.clone());
        hook.prerun().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        hook.prekill().await;
        assert!(store.list("alloc-1").is_empty());
        assert_eq!(store.list("alloc-2").len(), 1);

        let calls = checker.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), calls);
        assert!(store.list("alloc-1").is_empty());
    }

    /// Durable store that rejects its first write.
    #[derive(Default)]
    struct FirstWriteFails {
        failed: AtomicBool,
    }

    impl StateDb for FirstWriteFails {
        fn put_check_result(&self, _: &str, _: &QueryResult) -> StateResult<()> {
            if self.failed.swap(true, Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StateError::Write("disk full".to_string()))
            }
        }
        fn delete_check_results(&self, _: &str, _: &[CheckId]) -> StateResult<()> {
            Ok(())
        }
        fn purge_check_results(&self, _: &str) -> StateResult<()> {
            Ok(())
        }
        fn load_check_results(&self) -> StateResult<HashMap<String, AllocResultMap>> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn seed_write_failure_still_starts_observers() {
        let store = CheckStore::new(Arc::new(FirstWriteFails::default()));
        let checker = Arc::new(OkChecker::default());
        let hook = ChecksHook::new(&alloc(&["g"], &[]), store.clone(), checker.clone());

        hook.prerun().unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(checker.calls.load(Ordering::SeqCst) > 0);
        let results = store.list("alloc-1");
        assert_eq!(results[&id("group", "g")].result, CheckResult::Success);
        hook.prekill().await;
    }
}
