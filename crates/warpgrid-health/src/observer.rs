//! Observer — background loop that runs one check on its interval.
//!
//! Each observer executes its check, stamps the outcome with the check's
//! identity, and writes it to the [`CheckStore`]. Observers of the same
//! allocation share one shutdown channel and exit only when it fires (or
//! its sender is dropped); store errors are logged and the loop continues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use warp_core::checks::epoch_secs;
use warp_core::{CheckDefinition, CheckId, Query, QueryResult};

use crate::checker::Checker;
use crate::store::CheckStore;

/// Runs a single check on its configured interval.
pub struct Observer {
    alloc_id: String,
    check_id: CheckId,
    check_name: String,
    query: Query,
    interval: Duration,
    checker: Arc<dyn Checker>,
    store: CheckStore,
}

impl Observer {
    pub fn new(
        alloc_id: &str,
        definition: &CheckDefinition,
        checker: Arc<dyn Checker>,
        store: CheckStore,
    ) -> Self {
        Self {
            alloc_id: alloc_id.to_string(),
            check_id: definition.id.clone(),
            check_name: definition.check.name.clone(),
            query: definition.query(),
            interval: definition.check.interval(),
            checker,
            store,
        }
    }

    /// Run until `shutdown` fires. The first check runs immediately.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(alloc_id = %self.alloc_id, check = %self.check_name, "observer started");

        let mut wait = Duration::ZERO;
        let mut store_failing = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }

            let outcome = tokio::select! {
                outcome = self.checker.check(&self.query) => outcome,
                _ = shutdown.changed() => break,
            };

            let result = QueryResult {
                id: self.check_id.clone(),
                kind: self.query.kind,
                result: outcome.result,
                output: outcome.output,
                timestamp: epoch_secs(),
            };
            debug!(
                alloc_id = %self.alloc_id,
                check = %self.check_name,
                result = %result.result,
                "check executed"
            );

            match self.store.set(&self.alloc_id, result) {
                Ok(()) => store_failing = false,
                Err(e) => {
                    // Only the first failure of a streak is logged.
                    if !store_failing {
                        warn!(
                            alloc_id = %self.alloc_id,
                            check_id = %self.check_id,
                            error = %e,
                            "failed to persist check result"
                        );
                    }
                    store_failing = true;
                }
            }

            wait = self.interval;
        }

        debug!(alloc_id = %self.alloc_id, check = %self.check_name, "observer exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use std::collections::HashMap;

    use async_trait::async_trait;
    use warp_core::{CheckResult, CheckScope, CheckType, OnUpdate, ServiceCheck, ServiceProvider};
    use warpgrid_state::{StateError, StateResult, StateStore};

    use crate::checker::ProbeOutcome;
    use crate::store::{AllocResultMap, StateDb};

    /// Counts calls and alternates success/critical.
    #[derive(Default)]
    struct CountingChecker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Checker for CountingChecker {
        async fn check(&self, _: &Query) -> ProbeOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                ProbeOutcome::success("ok")
            } else {
                ProbeOutcome::critical("down")
            }
        }
    }

    fn definition(interval: &str) -> CheckDefinition {
        CheckDefinition {
            id: CheckId::new("alloc-1", "web", "group", "alive"),
            scope: CheckScope::Group,
            service: "web".to_string(),
            provider: ServiceProvider::Native,
            service_address: Some("127.0.0.1:1".to_string()),
            check: ServiceCheck {
                name: "alive".to_string(),
                check_type: CheckType::Tcp,
                path: None,
                method: None,
                address: None,
                interval: interval.to_string(),
                timeout: None,
                on_update: OnUpdate::RequireHealthy,
            },
        }
    }

    fn store() -> CheckStore {
        CheckStore::new(Arc::new(StateStore::open_in_memory().unwrap()))
    }

    /// Durable store whose writes always fail.
    struct BrokenDb;

    impl StateDb for BrokenDb {
        fn put_check_result(&self, _: &str, _: &QueryResult) -> StateResult<()> {
            Err(StateError::Write("read-only filesystem".to_string()))
        }
        fn delete_check_results(&self, _: &str, _: &[CheckId]) -> StateResult<()> {
            Err(StateError::Write("read-only filesystem".to_string()))
        }
        fn purge_check_results(&self, _: &str) -> StateResult<()> {
            Err(StateError::Write("read-only filesystem".to_string()))
        }
        fn load_check_results(&self) -> StateResult<HashMap<String, AllocResultMap>> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observer_runs_immediately_then_on_interval() {
        let checker = Arc::new(CountingChecker::default());
        let store = store();
        let def = definition("10s");
        let (tx, rx) = watch::channel(false);

        let obs = Observer::new("alloc-1", &def, checker.clone(), store.clone());
        let handle = tokio::spawn(obs.run(rx));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.list("alloc-1")[&def.id].result, CheckResult::Success);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.list("alloc-1")[&def.id].result, CheckResult::Critical);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn observer_stops_when_sender_dropped() {
        let checker = Arc::new(CountingChecker::default());
        let (tx, rx) = watch::channel(false);
        let obs = Observer::new("alloc-1", &definition("1s"), checker.clone(), store());
        let handle = tokio::spawn(obs.run(rx));

        tokio::time::sleep(Duration::from_millis(1)).await;
        drop(tx);
        handle.await.unwrap();

        let calls = checker.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn observer_never_starts_if_already_cancelled() {
        let checker = Arc::new(CountingChecker::default());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let obs = Observer::new("alloc-1", &definition("1s"), checker.clone(), store());
        obs.run(rx).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn observer_keeps_running_when_store_writes_fail() {
        let checker = Arc::new(CountingChecker::default());
        let store = CheckStore::new(Arc::new(BrokenDb));
        let def = definition("5s");
        let (tx, rx) = watch::channel(false);

        let obs = Observer::new("alloc-1", &def, checker.clone(), store.clone());
        let handle = tokio::spawn(obs.run(rx));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 3);
        // Memory still tracks the latest outcome.
        assert_eq!(store.list("alloc-1")[&def.id].result, CheckResult::Success);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_falls_back_to_default() {
        let checker = Arc::new(CountingChecker::default());
        let (tx, rx) = watch::channel(false);
        let obs = Observer::new("alloc-1", &definition("0s"), checker.clone(), store());
        let handle = tokio::spawn(obs.run(rx));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(checker.calls.load(Ordering::SeqCst), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
