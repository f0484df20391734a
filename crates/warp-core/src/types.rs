//! Allocation data model shared across WarpGrid crates.
//!
//! An allocation is one scheduled instance of a task group on a node. The
//! health tracking crates only read these types; the scheduler owns them
//! and pushes fresh copies whenever task states change.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;

/// Unique identifier for an allocation.
pub type AllocId = String;

const DEFAULT_MIN_HEALTHY_TIME: Duration = Duration::from_secs(10);
const DEFAULT_HEALTHY_DEADLINE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

// ── Allocation ────────────────────────────────────────────────────

/// One scheduled instance of a task group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub id: AllocId,
    /// Name of the task group (within `job`) this allocation runs.
    pub task_group: String,
    pub job: JobSpec,
    pub desired_status: DesiredStatus,
    pub client_status: ClientStatus,
    /// Latest runtime state per task name.
    #[serde(default)]
    pub task_states: HashMap<String, TaskState>,
}

impl Allocation {
    /// Find the task group this allocation runs.
    pub fn lookup_task_group(&self) -> Option<&TaskGroup> {
        self.job.lookup_task_group(&self.task_group)
    }

    /// Whether the server asked for this allocation to go away.
    pub fn is_stopping(&self) -> bool {
        matches!(
            self.desired_status,
            DesiredStatus::Stop | DesiredStatus::Evict
        )
    }
}

/// What the server wants the allocation to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Run,
    Stop,
    Evict,
}

/// What the client reports the allocation is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
}

// ── Job spec ──────────────────────────────────────────────────────

/// The job specification an allocation was created from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSpec {
    pub id: String,
    pub task_groups: Vec<TaskGroup>,
}

impl JobSpec {
    pub fn lookup_task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }
}

/// A named set of tasks scheduled together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskGroup {
    pub name: String,
    pub tasks: Vec<Task>,
    /// Group-level services.
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub update: UpdateStrategy,
}

impl TaskGroup {
    pub fn lookup_task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Count declared checks across group and task services, split by
    /// provider as `(external, native)`.
    pub fn count_checks(&self) -> (usize, usize) {
        let mut external = 0;
        let mut native = 0;
        let services = self
            .services
            .iter()
            .chain(self.tasks.iter().flat_map(|t| t.services.iter()));
        for service in services {
            match service.provider {
                ServiceProvider::External => external += service.checks.len(),
                ServiceProvider::Native => native += service.checks.len(),
            }
        }
        (external, native)
    }
}

/// How a rolling deployment judges an allocation's health.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateStrategy {
    #[serde(default)]
    pub health_check: HealthCheckMode,
    /// How long tasks (and checks) must stay healthy (e.g., "10s").
    #[serde(default = "default_min_healthy_time")]
    pub min_healthy_time: String,
    /// Upper bound for reaching a healthy verdict (e.g., "5m").
    #[serde(default = "default_healthy_deadline")]
    pub healthy_deadline: String,
}

fn default_min_healthy_time() -> String {
    "10s".to_string()
}

fn default_healthy_deadline() -> String {
    "5m".to_string()
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            health_check: HealthCheckMode::default(),
            min_healthy_time: default_min_healthy_time(),
            healthy_deadline: default_healthy_deadline(),
        }
    }
}

impl UpdateStrategy {
    pub fn min_healthy_time(&self) -> Duration {
        parse_duration(&self.min_healthy_time).unwrap_or(DEFAULT_MIN_HEALTHY_TIME)
    }

    pub fn healthy_deadline(&self) -> Duration {
        parse_duration(&self.healthy_deadline).unwrap_or(DEFAULT_HEALTHY_DEADLINE)
    }

    /// Whether service checks take part in the health verdict.
    pub fn use_checks(&self) -> bool {
        self.health_check == HealthCheckMode::Checks
    }

    /// Whether health is left to an operator instead of being tracked.
    pub fn is_manual(&self) -> bool {
        self.health_check == HealthCheckMode::Manual
    }
}

/// Which signals make up an allocation's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckMode {
    /// Task states plus service checks.
    #[default]
    Checks,
    /// Task states only.
    TaskStates,
    /// Health is set by an operator; nothing is tracked.
    Manual,
}

// ── Tasks ─────────────────────────────────────────────────────────

/// A task definition within a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub lifecycle: Option<Lifecycle>,
    #[serde(default)]
    pub services: Vec<Service>,
}

impl Task {
    /// The lifecycle hook of a task that is allowed to run to completion.
    ///
    /// Sidecars are long-lived and behave like main tasks, so they have no
    /// ephemeral hook.
    pub fn ephemeral_hook(&self) -> Option<LifecycleHook> {
        self.lifecycle
            .as_ref()
            .filter(|l| !l.sidecar)
            .map(|l| l.hook)
    }

    /// Number of checks declared across this task's services.
    pub fn desired_checks(&self) -> usize {
        self.services.iter().map(|s| s.checks.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lifecycle {
    pub hook: LifecycleHook,
    #[serde(default)]
    pub sidecar: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleHook {
    Prestart,
    Poststart,
    Poststop,
}

/// Runtime state of a single task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskState {
    pub state: TaskStatus,
    #[serde(default)]
    pub failed: bool,
    /// Unix timestamp (milliseconds) of the latest start.
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    /// Unix timestamp (milliseconds) the task finished, if it has.
    #[serde(default)]
    pub finished_at_ms: Option<u64>,
}

impl TaskState {
    pub fn pending() -> Self {
        Self {
            state: TaskStatus::Pending,
            failed: false,
            started_at_ms: None,
            finished_at_ms: None,
        }
    }

    pub fn running(started_at_ms: u64) -> Self {
        Self {
            state: TaskStatus::Running,
            failed: false,
            started_at_ms: Some(started_at_ms),
            finished_at_ms: None,
        }
    }

    /// Dead without failure.
    pub fn successful(&self) -> bool {
        self.state == TaskStatus::Dead && !self.failed
    }

    pub fn has_finished(&self) -> bool {
        self.finished_at_ms.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Dead,
}

// ── Services ──────────────────────────────────────────────────────

/// A service registration declared by a group or task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub provider: ServiceProvider,
    /// Address (`ip:port`) checks probe when they declare none.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub checks: Vec<ServiceCheck>,
}

/// Who runs a service's checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceProvider {
    /// Checks run by the client's own observers.
    #[default]
    Native,
    /// Checks run by an external service registry.
    External,
}

/// A check attached to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceCheck {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    /// HTTP path (http only).
    #[serde(default)]
    pub path: Option<String>,
    /// HTTP method (http only, defaults to GET).
    #[serde(default)]
    pub method: Option<String>,
    /// Overrides the service address.
    #[serde(default)]
    pub address: Option<String>,
    /// Check interval (e.g., "5s").
    pub interval: String,
    /// Timeout per check (e.g., "2s").
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub on_update: OnUpdate,
}

impl ServiceCheck {
    /// Run interval; a missing, invalid or zero value means the default 10s.
    pub fn interval(&self) -> Duration {
        parse_duration(&self.interval)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_CHECK_INTERVAL)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.as_deref().and_then(parse_duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Tcp,
    Http,
}

/// How a check's degraded states affect deployment health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnUpdate {
    /// Only passing counts as healthy.
    #[default]
    RequireHealthy,
    /// Warnings count as healthy.
    IgnoreWarnings,
    /// The check never gates health.
    Ignore,
}
