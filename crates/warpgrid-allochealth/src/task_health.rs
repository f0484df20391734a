//! Per-task explanations for an unhealthy verdict.

use std::collections::BTreeMap;
use std::time::Duration;

use warp_core::{Task, TaskState, TaskStatus};

use crate::fusion::CheckSourceKind;
use crate::registry::CheckStatus;
use crate::source::CheckObservation;

/// Inputs shared by every task's explanation.
#[derive(Debug, Clone, Copy)]
pub struct EventContext {
    /// When the healthy deadline expires (Unix ms).
    pub deadline_ms: u64,
    pub healthy_deadline: Duration,
    pub min_healthy_time: Duration,
    pub use_checks: bool,
}

/// What the tracker last saw for one task.
#[derive(Debug, Clone)]
pub struct TaskHealthState {
    pub task: Task,
    pub state: Option<TaskState>,
    /// Latest observations of this task's checks, per source.
    pub checks: BTreeMap<CheckSourceKind, Vec<CheckObservation>>,
}

impl TaskHealthState {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            state: None,
            checks: BTreeMap::new(),
        }
    }

    /// Why this task kept the allocation from being healthy, if it did.
    pub fn event(&self, ctx: &EventContext) -> Option<String> {
        let desired = self.task.desired_checks();

        if let Some(state) = &self.state {
            if state.failed {
                return Some("Unhealthy because of failed task".to_string());
            }
            match state.state {
                TaskStatus::Pending => {
                    return Some(format!(
                        "Task not running by healthy_deadline of {:?}",
                        ctx.healthy_deadline
                    ));
                }
                TaskStatus::Dead => {
                    // Ephemeral tasks are expected to finish.
                    if self.task.ephemeral_hook().is_none() {
                        return Some("Unhealthy because of dead task".to_string());
                    }
                }
                TaskStatus::Running => {
                    let started = state.started_at_ms.unwrap_or(0);
                    let min_ms = ctx.min_healthy_time.as_millis() as u64;
                    if started.saturating_add(min_ms) > ctx.deadline_ms {
                        return Some(format!(
                            "Task not running for min_healthy_time of {:?} by healthy_deadline of {:?}",
                            ctx.min_healthy_time, ctx.healthy_deadline
                        ));
                    }
                }
            }
        }

        if !self.checks.is_empty() {
            let mut not_passing: Vec<&str> = Vec::new();
            let mut passing = 0;
            for check in self.checks.values().flatten() {
                if check.status == CheckStatus::Passing {
                    passing += 1;
                } else if !not_passing.contains(&check.service.as_str()) {
                    not_passing.push(&check.service);
                }
            }
            if !not_passing.is_empty() {
                return Some(format!(
                    "Services not healthy by deadline: {}",
                    not_passing.join(", ")
                ));
            }
            if passing != desired {
                return Some(format!(
                    "Only {passing} out of {desired} checks registered and passing"
                ));
            }
        } else if ctx.use_checks && desired > 0 {
            return Some("Service checks not registered".to_string());
        }

        None
    }
}
