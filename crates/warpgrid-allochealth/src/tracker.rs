//! Allocation health tracker — one per allocation being deployed.
//!
//! Up to four watchers run concurrently and report into shared flags:
//!
//! - the task watcher follows allocation snapshots and decides when every
//!   task has been running for `min_healthy_time`;
//! - one check watcher per required check source (registry, native) polls
//!   observations and decides when every check has passed for
//!   `min_healthy_time`;
//! - the deadline watcher delivers Unhealthy once `healthy_deadline`
//!   passes without a verdict.
//!
//! The first verdict wins. Delivering it cancels every watcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use warp_core::checks::epoch_millis;
use warp_core::{Allocation, CheckDefinition, TaskGroup};
use warpgrid_health::{CheckStore, native_checks};

use crate::error::{TrackerError, TrackerResult};
use crate::fusion::{
    CheckSourceKind, HealthFlags, HealthSignal, Requirements, TaskEvaluation, evaluate_tasks,
};
use crate::registry::ServiceRegistry;
use crate::signal::Once;
use crate::source::{CheckObservation, CheckSource, NativeSource, RegistrySource, checks_pass};
use crate::task_health::{EventContext, TaskHealthState};
use crate::timer::HealthyTimer;

/// How often check sources are polled unless configured otherwise.
pub const DEFAULT_CHECK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Final result of tracking an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Healthy,
    Unhealthy,
    /// The allocation was stopped before a verdict.
    Stopped,
}

/// Timing and policy of one tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub min_healthy_time: Duration,
    /// `None` disables the deadline.
    pub healthy_deadline: Option<Duration>,
    pub use_checks: bool,
    /// Health is set by an operator; the tracker spawns nothing.
    pub manual: bool,
    /// Zero means [`DEFAULT_CHECK_POLL_INTERVAL`].
    pub check_poll_interval: Duration,
}

impl TrackerConfig {
    /// Configuration from the group's update strategy.
    pub fn from_group(group: &TaskGroup) -> Self {
        Self {
            min_healthy_time: group.update.min_healthy_time(),
            healthy_deadline: Some(group.update.healthy_deadline()),
            use_checks: group.update.use_checks(),
            manual: group.update.is_manual(),
            check_poll_interval: DEFAULT_CHECK_POLL_INTERVAL,
        }
    }

    fn poll_interval(&self) -> Duration {
        if self.check_poll_interval.is_zero() {
            DEFAULT_CHECK_POLL_INTERVAL
        } else {
            self.check_poll_interval
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    flags: HealthFlags,
    required: Requirements,
    /// A verdict was delivered or the allocation stopped.
    finished: bool,
    alloc_failed: bool,
    /// Unix ms at which the healthy deadline expires.
    deadline_ms: Option<u64>,
    tasks: BTreeMap<String, TaskHealthState>,
}

/// State shared between the tracker and its watchers.
struct Shared {
    alloc_id: String,
    state: Mutex<TrackerState>,
    healthy: Once<bool>,
    stopped: Once<()>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a signal into the flags. Returns true once tracking is over,
    /// whether or not this signal ended it.
    fn signal(&self, signal: HealthSignal) -> bool {
        let mut state = self.lock();
        if state.finished {
            return true;
        }
        let required = state.required;
        match state.flags.apply(signal, required) {
            Some(healthy) => {
                self.finish(&mut state, healthy);
                true
            }
            None => false,
        }
    }

    /// Deliver the verdict and cancel every watcher. Caller holds the lock.
    fn finish(&self, state: &mut TrackerState, healthy: bool) {
        state.finished = true;
        self.healthy.publish(healthy);
        self.shutdown.send_replace(true);
        if healthy {
            info!(alloc_id = %self.alloc_id, "allocation healthy");
        } else {
            warn!(alloc_id = %self.alloc_id, alloc_failed = state.alloc_failed, "allocation unhealthy");
        }
    }

    fn tasks_failed(&self, alloc_level: bool) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.alloc_failed = alloc_level;
        let required = state.required;
        let terminal = HealthSignal::Tasks {
            healthy: false,
            terminal: true,
        };
        if let Some(healthy) = state.flags.apply(terminal, required) {
            self.finish(&mut state, healthy);
        }
    }

    fn mark_stopped(&self) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        self.stopped.publish(());
        self.shutdown.send_replace(true);
        info!(alloc_id = %self.alloc_id, "allocation stopping, health tracking cancelled");
    }

    fn deadline_exceeded(&self) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        warn!(alloc_id = %self.alloc_id, flags = ?state.flags, "healthy deadline exceeded");
        self.finish(&mut state, false);
    }

    fn record_task_states(&self, alloc: &Allocation) {
        let mut state = self.lock();
        for (name, task) in state.tasks.iter_mut() {
            if let Some(ts) = alloc.task_states.get(name) {
                task.state = Some(ts.clone());
            }
        }
    }

    fn record_checks(&self, source: CheckSourceKind, observations: &[CheckObservation]) {
        let mut by_task: HashMap<&str, Vec<CheckObservation>> = HashMap::new();
        for obs in observations {
            if let Some(task) = obs.task.as_deref() {
                by_task.entry(task).or_default().push(obs.clone());
            }
        }
        let mut state = self.lock();
        for (task, checks) in by_task {
            if let Some(th) = state.tasks.get_mut(task) {
                th.checks.insert(source, checks);
            }
        }
    }
}

/// Tracks the health of one allocation until the first verdict.
pub struct Tracker {
    shared: Arc<Shared>,
    group: Arc<TaskGroup>,
    config: TrackerConfig,
    native: Vec<CheckDefinition>,
    updates: Mutex<Option<watch::Receiver<Arc<Allocation>>>>,
    registry: Option<Arc<dyn ServiceRegistry>>,
    check_store: Option<CheckStore>,
}

impl Tracker {
    /// Create a tracker for the allocation currently held by `updates`.
    ///
    /// Every later value sent on `updates` is a new snapshot of the same
    /// allocation. Fails if the allocation's task group is not in its job.
    pub fn new(updates: watch::Receiver<Arc<Allocation>>) -> TrackerResult<Self> {
        let alloc = updates.borrow().clone();
        let group = alloc
            .lookup_task_group()
            .cloned()
            .ok_or_else(|| TrackerError::TaskGroupNotFound {
                alloc_id: alloc.id.clone(),
                group: alloc.task_group.clone(),
            })?;

        let tasks = group
            .tasks
            .iter()
            .map(|t| (t.name.clone(), TaskHealthState::new(t.clone())))
            .collect();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                alloc_id: alloc.id.clone(),
                state: Mutex::new(TrackerState {
                    tasks,
                    ..TrackerState::default()
                }),
                healthy: Once::new(),
                stopped: Once::new(),
                shutdown,
            }),
            config: TrackerConfig::from_group(&group),
            group: Arc::new(group),
            native: native_checks(&alloc).unwrap_or_default(),
            updates: Mutex::new(Some(updates)),
            registry: None,
            check_store: None,
        })
    }

    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_check_store(mut self, store: CheckStore) -> Self {
        self.check_store = Some(store);
        self
    }

    pub fn with_config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_min_healthy_time(mut self, min_healthy_time: Duration) -> Self {
        self.config.min_healthy_time = min_healthy_time;
        self
    }

    pub fn with_healthy_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.config.healthy_deadline = deadline;
        self
    }

    /// A zero interval falls back to [`DEFAULT_CHECK_POLL_INTERVAL`].
    pub fn with_check_poll_interval(mut self, interval: Duration) -> Self {
        self.config.check_poll_interval = interval;
        self
    }

    pub fn alloc_id(&self) -> &str {
        &self.shared.alloc_id
    }

    /// Spawn the watchers. Later calls do nothing.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        let Some(updates) = self
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            debug!(alloc_id = %self.shared.alloc_id, "tracker already started");
            return;
        };

        if self.config.manual {
            debug!(alloc_id = %self.shared.alloc_id, "health is set manually, nothing to track");
            return;
        }

        let required = Requirements::for_group(&self.group, self.config.use_checks);
        {
            let mut state = self.shared.lock();
            state.required = required;
            state.deadline_ms = self
                .config
                .healthy_deadline
                .map(|d| epoch_millis().saturating_add(d.as_millis() as u64));
        }

        let config = Arc::new(self.config.clone());
        let alloc_id = self.shared.alloc_id.as_str();
        let (external, native) = self.group.count_checks();

        tokio::spawn(watch_task_events(
            self.shared.clone(),
            self.group.clone(),
            config.clone(),
            updates,
            self.shared.shutdown.subscribe(),
        ));

        if required.registry_checks {
            match &self.registry {
                Some(registry) => {
                    tokio::spawn(watch_checks(
                        self.shared.clone(),
                        config.clone(),
                        RegistrySource::new(alloc_id, registry.clone()),
                        external,
                        self.shared.shutdown.subscribe(),
                    ));
                }
                None => warn!(
                    %alloc_id,
                    checks = external,
                    "group declares registry checks but no registry is configured"
                ),
            }
        }

        if required.native_checks {
            match &self.check_store {
                Some(store) => {
                    tokio::spawn(watch_checks(
                        self.shared.clone(),
                        config.clone(),
                        NativeSource::new(alloc_id, store.clone(), self.native.clone()),
                        native,
                        self.shared.shutdown.subscribe(),
                    ));
                }
                None => warn!(
                    %alloc_id,
                    checks = native,
                    "group declares native checks but no check store is configured"
                ),
            }
        }

        if let Some(deadline) = config.healthy_deadline {
            tokio::spawn(watch_deadline(
                self.shared.clone(),
                deadline,
                self.shared.shutdown.subscribe(),
            ));
        }

        debug!(
            %alloc_id,
            ?required,
            min_healthy_time = ?config.min_healthy_time,
            healthy_deadline = ?config.healthy_deadline,
            "health tracker started"
        );
    }

    /// Wait for the health verdict.
    pub async fn healthy(&self) -> bool {
        self.shared.healthy.wait().await
    }

    /// The health verdict, if delivered.
    pub fn try_healthy(&self) -> Option<bool> {
        self.shared.healthy.get()
    }

    /// Wait until the allocation is seen stopping.
    pub async fn stopped(&self) {
        self.shared.stopped.wait().await
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.get().is_some()
    }

    /// Wait for whichever comes first: a verdict or a stop.
    pub async fn outcome(&self) -> Outcome {
        tokio::select! {
            healthy = self.healthy() => {
                if healthy { Outcome::Healthy } else { Outcome::Unhealthy }
            }
            _ = self.stopped() => Outcome::Stopped,
        }
    }

    /// Why each task kept the allocation from being healthy.
    ///
    /// Only available after an Unhealthy verdict, and never when the
    /// allocation failed as a whole. Tasks without a reason are omitted.
    pub fn task_events(&self) -> Option<HashMap<String, String>> {
        let state = self.shared.lock();
        if state.alloc_failed || self.shared.healthy.get() != Some(false) {
            return None;
        }
        let ctx = EventContext {
            deadline_ms: state.deadline_ms.unwrap_or_else(epoch_millis),
            healthy_deadline: self.config.healthy_deadline.unwrap_or_default(),
            min_healthy_time: self.config.min_healthy_time,
            use_checks: self.config.use_checks,
        };
        Some(
            state
                .tasks
                .iter()
                .filter_map(|(name, th)| th.event(&ctx).map(|e| (name.clone(), e)))
                .collect(),
        )
    }

    /// Cancel every watcher without delivering a verdict.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Follow allocation snapshots and report task health.
async fn watch_task_events(
    shared: Arc<Shared>,
    group: Arc<TaskGroup>,
    config: Arc<TrackerConfig>,
    mut updates: watch::Receiver<Arc<Allocation>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut alloc = updates.borrow_and_update().clone();
    let mut timer = HealthyTimer::new();
    let mut all_started: Option<u64> = None;

    loop {
        if *shutdown.borrow() {
            return;
        }

        shared.record_task_states(&alloc);
        match evaluate_tasks(&alloc, &group) {
            TaskEvaluation::Stopped => {
                shared.mark_stopped();
                return;
            }
            TaskEvaluation::Failed { alloc_level } => {
                shared.tasks_failed(alloc_level);
                return;
            }
            TaskEvaluation::Progress { all_started_at } => {
                if all_started_at != all_started {
                    // A (re)start means min_healthy_time starts over.
                    timer.disarm();
                    shared.signal(HealthSignal::Tasks {
                        healthy: false,
                        terminal: false,
                    });
                    all_started = all_started_at;
                    if all_started.is_some() {
                        timer.arm(config.min_healthy_time);
                    }
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            changed = updates.changed() => {
                if changed.is_err() {
                    debug!(alloc_id = %shared.alloc_id, "allocation updates closed");
                    return;
                }
                alloc = updates.borrow_and_update().clone();
            }
            _ = timer.fired() => {
                let healthy = HealthSignal::Tasks { healthy: true, terminal: false };
                if shared.signal(healthy) {
                    return;
                }
            }
        }
    }
}

/// Poll one check source and report its health.
async fn watch_checks<S: CheckSource + 'static>(
    shared: Arc<Shared>,
    config: Arc<TrackerConfig>,
    source: S,
    expected: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let kind = source.kind();
    let poll = config.poll_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + poll, poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut timer = HealthyTimer::new();
    let mut lookup_failing = false;

    loop {
        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = timer.fired() => {
                let healthy = HealthSignal::Checks { source: kind, healthy: true };
                if shared.signal(healthy) {
                    return;
                }
                // Re-armed on the next passing poll.
                continue;
            }
            _ = ticker.tick() => {}
        }

        let observed = tokio::select! {
            observed = source.observe() => observed,
            _ = shutdown.changed() => return,
        };
        let observations = match observed {
            Ok(observations) => {
                if lookup_failing {
                    info!(alloc_id = %shared.alloc_id, source = kind.as_str(), "check lookup recovered");
                }
                lookup_failing = false;
                observations
            }
            Err(e) => {
                // Only the first error of an outage is logged.
                if !lookup_failing {
                    warn!(
                        alloc_id = %shared.alloc_id,
                        source = kind.as_str(),
                        error = %e,
                        "error looking up check status"
                    );
                }
                lookup_failing = true;
                continue;
            }
        };

        shared.record_checks(kind, &observations);
        if checks_pass(&observations, expected) {
            if !timer.is_armed() {
                timer.arm(config.min_healthy_time);
            }
        } else {
            timer.disarm();
            shared.signal(HealthSignal::Checks {
                source: kind,
                healthy: false,
            });
        }
    }
}

/// Deliver Unhealthy once `deadline` passes.
async fn watch_deadline(shared: Arc<Shared>, deadline: Duration, mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(deadline) => shared.deadline_exceeded(),
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use warp_core::{
        ClientStatus, DesiredStatus, HealthCheckMode, JobSpec, Task, TaskState, UpdateStrategy,
    };

    fn alloc(update: UpdateStrategy) -> Allocation {
        Allocation {
            id: "alloc-1".to_string(),
            task_group: "web".to_string(),
            job: JobSpec {
                id: "job".to_string(),
                task_groups: vec![TaskGroup {
                    name: "web".to_string(),
                    tasks: vec![Task {
                        name: "main".to_string(),
                        lifecycle: None,
                        services: vec![],
                    }],
                    services: vec![],
                    update,
                }],
            },
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            task_states: HashMap::from([("main".to_string(), TaskState::running(epoch_millis()))]),
        }
    }

    #[test]
    fn config_follows_update_strategy() {
        let update = UpdateStrategy {
            health_check: HealthCheckMode::TaskStates,
            min_healthy_time: "3s".to_string(),
            healthy_deadline: "1m".to_string(),
        };
        let config = TrackerConfig::from_group(alloc(update).lookup_task_group().unwrap());
        assert_eq!(config.min_healthy_time, Duration::from_secs(3));
        assert_eq!(config.healthy_deadline, Some(Duration::from_secs(60)));
        assert!(!config.use_checks);
        assert!(!config.manual);
        assert_eq!(config.check_poll_interval, DEFAULT_CHECK_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_health_is_not_tracked() {
        let update = UpdateStrategy {
            health_check: HealthCheckMode::Manual,
            ..UpdateStrategy::default()
        };
        let (_tx, rx) = watch::channel(Arc::new(alloc(update)));
        let tracker = Tracker::new(rx)
            .unwrap()
            .with_min_healthy_time(Duration::from_millis(200))
            .with_healthy_deadline(Some(Duration::from_secs(1)));
        assert!(tracker.config.manual);
        tracker.start();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(tracker.try_healthy(), None);
        assert!(tracker.task_events().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_start_delivers_nothing() {
        let (_tx, rx) = watch::channel(Arc::new(alloc(UpdateStrategy::default())));
        let tracker = Tracker::new(rx).unwrap();
        tracker.shutdown();
        tracker.start();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(tracker.try_healthy(), None);
        assert!(!tracker.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_ignored() {
        let (_tx, rx) = watch::channel(Arc::new(alloc(UpdateStrategy::default())));
        let tracker = Tracker::new(rx)
            .unwrap()
            .with_min_healthy_time(Duration::from_millis(200));
        tracker.start();
        tracker.start();
        assert!(tracker.healthy().await);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_deadline_never_fires() {
        let mut alloc = alloc(UpdateStrategy::default());
        alloc
            .task_states
            .insert("main".to_string(), TaskState::pending());
        let (_tx, rx) = watch::channel(Arc::new(alloc));
        let tracker = Tracker::new(rx).unwrap().with_healthy_deadline(None);
        tracker.start();

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(tracker.try_healthy(), None);
    }
}
