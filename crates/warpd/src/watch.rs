//! Watch mode — run one allocation's checks until its health verdict.
//!
//! 1. Opens the client state store and restores persisted check results
//! 2. Starts the checks hook for the allocation's native checks
//! 3. Tracks allocation health until a verdict or Ctrl-C
//! 4. Stops the checks and purges the allocation's results

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use warp_core::{Allocation, ClientConfig, parse_duration};
use warpgrid_allochealth::{Outcome, Tracker};
use warpgrid_health::{CheckStore, ChecksHook, ProbeChecker};
use warpgrid_state::StateStore;

/// What `warpd watch` prints.
#[derive(Debug, Serialize)]
pub struct WatchReport {
    pub alloc_id: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_events: Option<HashMap<String, String>>,
}

/// Watch the allocation described by `alloc_path`. Returns `None` when
/// interrupted before a verdict or when the group's health is set manually.
pub async fn watch_allocation(
    alloc_path: &Path,
    config: &ClientConfig,
) -> anyhow::Result<Option<WatchReport>> {
    let content = std::fs::read_to_string(alloc_path)
        .with_context(|| format!("reading allocation {}", alloc_path.display()))?;
    let alloc: Allocation = serde_json::from_str(&content)
        .with_context(|| format!("parsing allocation {}", alloc_path.display()))?;
    if alloc.lookup_task_group().is_some_and(|g| g.update.is_manual()) {
        info!(alloc_id = %alloc.id, "health is set manually, nothing to watch");
        return Ok(None);
    }
    info!(alloc_id = %alloc.id, group = %alloc.task_group, "watching allocation health");

    // ── State store ──────────────────────────────────────────────
    std::fs::create_dir_all(&config.state.data_dir)?;
    let db_path = config.state.db_path();
    let db = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let store = CheckStore::new(Arc::new(db));
    let restored = store.restore()?;
    debug!(allocs = restored, "check results restored");

    // ── Tracker ──────────────────────────────────────────────────
    let (updates_tx, updates) = watch::channel(Arc::new(alloc.clone()));
    let mut tracker = Tracker::new(updates)?
        .with_check_store(store.clone())
        .with_check_poll_interval(config.health.check_poll_interval());
    if let Some(group) = alloc.lookup_task_group() {
        if parse_duration(&group.update.min_healthy_time).is_none() {
            let fallback = config.health.default_min_healthy_time();
            warn!(
                value = %group.update.min_healthy_time,
                ?fallback,
                "invalid min_healthy_time, using default"
            );
            tracker = tracker.with_min_healthy_time(fallback);
        }
    }

    // ── Checks ───────────────────────────────────────────────────
    let checker = Arc::new(ProbeChecker::new(config.health.probe_timeout()));
    let hook = ChecksHook::new(&alloc, store, checker);
    hook.prerun()?;
    info!(hook = hook.name(), checks = hook.checks().len(), "hook started");

    tracker.start();

    let outcome = tokio::select! {
        outcome = tracker.outcome() => Some(outcome),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            None
        }
    };

    tracker.shutdown();
    hook.prekill().await;
    drop(updates_tx);

    Ok(outcome.map(|outcome| {
        info!(alloc_id = %alloc.id, ?outcome, "allocation health decided");
        WatchReport {
            alloc_id: alloc.id.clone(),
            outcome,
            task_events: tracker.task_events(),
        }
    }))
}
