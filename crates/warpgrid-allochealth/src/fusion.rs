//! Pure health fusion: task progress and check sources into one verdict.
//!
//! Nothing here touches clocks or channels. The tracker's watchers feed
//! observations in, and act on what comes out.

use warp_core::{Allocation, ClientStatus, LifecycleHook, TaskGroup, TaskStatus};

/// A producer of check observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CheckSourceKind {
    /// Checks reported by the external service registry.
    Registry,
    /// Checks executed by this client.
    Native,
}

impl CheckSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckSourceKind::Registry => "registry",
            CheckSourceKind::Native => "native",
        }
    }
}

/// Which check sources must be healthy before the allocation is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    pub registry_checks: bool,
    pub native_checks: bool,
}

impl Requirements {
    /// Derive requirements from the group's declared checks.
    pub fn for_group(group: &TaskGroup, use_checks: bool) -> Self {
        let (external, native) = group.count_checks();
        Self {
            registry_checks: use_checks && external > 0,
            native_checks: use_checks && native > 0,
        }
    }

    pub fn requires(&self, source: CheckSourceKind) -> bool {
        match source {
            CheckSourceKind::Registry => self.registry_checks,
            CheckSourceKind::Native => self.native_checks,
        }
    }
}

/// A change reported by one of the watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    /// Task health changed. `terminal` signals cannot recover.
    Tasks { healthy: bool, terminal: bool },
    /// A check source's health changed.
    Checks { source: CheckSourceKind, healthy: bool },
}

/// Latest health of each signal contributing to the verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthFlags {
    pub tasks_healthy: bool,
    pub registry_checks_healthy: bool,
    pub native_checks_healthy: bool,
}

impl HealthFlags {
    /// Fold a signal into the flags. Returns the verdict to deliver, if
    /// this signal decides one.
    pub fn apply(&mut self, signal: HealthSignal, required: Requirements) -> Option<bool> {
        match signal {
            HealthSignal::Tasks { healthy, terminal } => {
                self.tasks_healthy = healthy;
                if terminal {
                    return Some(healthy);
                }
                if !healthy {
                    // Checks have to pass again after the tasks recover.
                    self.registry_checks_healthy = false;
                    self.native_checks_healthy = false;
                    return None;
                }
                self.is_healthy(required).then_some(true)
            }
            HealthSignal::Checks { source, healthy } => {
                let healthy = healthy && self.tasks_healthy;
                *self.check_flag(source) = healthy;
                (healthy && self.is_healthy(required)).then_some(true)
            }
        }
    }

    /// Whether tasks and every required check source are healthy.
    pub fn is_healthy(&self, required: Requirements) -> bool {
        self.tasks_healthy
            && (!required.registry_checks || self.registry_checks_healthy)
            && (!required.native_checks || self.native_checks_healthy)
    }

    fn check_flag(&mut self, source: CheckSourceKind) -> &mut bool {
        match source {
            CheckSourceKind::Registry => &mut self.registry_checks_healthy,
            CheckSourceKind::Native => &mut self.native_checks_healthy,
        }
    }
}

/// What an allocation snapshot says about its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvaluation {
    /// The allocation is being stopped or evicted.
    Stopped,
    /// A task failed, or the allocation failed as a whole.
    Failed { alloc_level: bool },
    /// Tasks are progressing. Holds the latest start time (ms) once every
    /// counted task has started.
    Progress { all_started_at: Option<u64> },
}

/// Evaluate the task states of `alloc` against its group definition.
///
/// Poststop tasks are ignored. A poststart task that completed
/// successfully no longer counts. A finished task counts as failed unless
/// it is an ephemeral prestart task.
pub fn evaluate_tasks(alloc: &Allocation, group: &TaskGroup) -> TaskEvaluation {
    if alloc.is_stopping() {
        return TaskEvaluation::Stopped;
    }

    // Failures are checked across all tasks before start times.
    let mut counted = Vec::with_capacity(group.tasks.len());
    for task in &group.tasks {
        let hook = task.ephemeral_hook();
        if hook == Some(LifecycleHook::Poststop) {
            continue;
        }
        let state = alloc.task_states.get(&task.name);
        if let Some(state) = state {
            if hook == Some(LifecycleHook::Poststart) && state.successful() {
                continue;
            }
            if state.failed || (state.has_finished() && hook != Some(LifecycleHook::Prestart)) {
                return TaskEvaluation::Failed { alloc_level: false };
            }
        }
        counted.push(state);
    }

    if alloc.client_status == ClientStatus::Failed {
        return TaskEvaluation::Failed { alloc_level: true };
    }

    let mut latest: Option<u64> = None;
    for state in counted {
        match state {
            Some(state) if state.state != TaskStatus::Pending => {
                let started = state.started_at_ms.unwrap_or(0);
                latest = Some(latest.map_or(started, |l| l.max(started)));
            }
            _ => return TaskEvaluation::Progress { all_started_at: None },
        }
    }
    TaskEvaluation::Progress { all_started_at: latest }
}
