//! Check identity, definitions, and query results.
//!
//! The checks hook (which runs checks) and the allocation health tracker
//! (which reads their results) each derive the check set of an allocation
//! on their own with [`find_checks`]. Identities are a pure function of
//! `(alloc_id, group, scope, check name)`, so both sides line up without
//! sharing a registry, and persisted results can be reconciled against a
//! freshly derived set after a restart.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{Allocation, CheckType, OnUpdate, ServiceCheck, ServiceProvider};

/// Scope name used for checks of group-level services.
pub const GROUP_SCOPE: &str = "group";

/// Stable identifier of a check within an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckId(String);

impl CheckId {
    /// Derive the identity of a check.
    pub fn new(alloc_id: &str, group: &str, scope: &str, name: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [alloc_id, group, scope, name] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CheckId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether a check gates health or is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Healthiness,
    Readiness,
}

impl Kind {
    /// Checks whose update policy is `ignore` are readiness checks.
    pub fn of(check: &ServiceCheck) -> Self {
        if check.on_update == OnUpdate::Ignore {
            Kind::Readiness
        } else {
            Kind::Healthiness
        }
    }
}

/// Outcome of a single check execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResult {
    Success,
    Critical,
    /// No result yet.
    Missing,
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckResult::Success => f.write_str("success"),
            CheckResult::Critical => f.write_str("critical"),
            CheckResult::Missing => f.write_str("missing"),
        }
    }
}

/// The latest result of a check. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub id: CheckId,
    pub kind: Kind,
    pub result: CheckResult,
    /// Human-readable output (response body or error text).
    pub output: String,
    /// Unix timestamp (seconds) of the execution.
    pub timestamp: u64,
}

impl QueryResult {
    /// A placeholder written before a check has run for the first time.
    pub fn pending(id: CheckId, kind: Kind, timestamp: u64) -> Self {
        Self {
            id,
            kind,
            result: CheckResult::Missing,
            output: "pending".to_string(),
            timestamp,
        }
    }
}

/// Where in the group a check was declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CheckScope {
    Group,
    Task(String),
}

impl CheckScope {
    pub fn as_str(&self) -> &str {
        match self {
            CheckScope::Group => GROUP_SCOPE,
            CheckScope::Task(name) => name,
        }
    }

    pub fn task_name(&self) -> Option<&str> {
        match self {
            CheckScope::Group => None,
            CheckScope::Task(name) => Some(name),
        }
    }
}

/// The minimal information needed to execute a check.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub kind: Kind,
    pub check_type: CheckType,
    /// `ip:port` to probe.
    pub address: Option<String>,
    /// Request path (http only).
    pub path: String,
    /// Request method (http only).
    pub method: String,
    pub timeout: Option<Duration>,
}

/// A check of an allocation, with its identity and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckDefinition {
    pub id: CheckId,
    pub scope: CheckScope,
    pub service: String,
    pub provider: ServiceProvider,
    /// Address of the owning service, used when the check sets none.
    pub service_address: Option<String>,
    pub check: ServiceCheck,
}

impl CheckDefinition {
    pub fn kind(&self) -> Kind {
        Kind::of(&self.check)
    }

    pub fn query(&self) -> Query {
        Query {
            kind: self.kind(),
            check_type: self.check.check_type,
            address: self
                .check
                .address
                .clone()
                .or_else(|| self.service_address.clone()),
            path: self.check.path.clone().unwrap_or_else(|| "/".to_string()),
            method: self
                .check
                .method
                .as_deref()
                .unwrap_or("GET")
                .to_ascii_uppercase(),
            timeout: self.check.timeout(),
        }
    }
}

/// Derive every group- and task-level check of an allocation.
///
/// Returns `None` when the allocation's task group does not exist in its
/// job. Group checks come first, then task checks in task order.
pub fn find_checks(alloc: &Allocation) -> Option<Vec<CheckDefinition>> {
    let tg = alloc.lookup_task_group()?;
    let mut result = Vec::new();

    let scoped = tg
        .services
        .iter()
        .map(|s| (CheckScope::Group, s))
        .chain(tg.tasks.iter().flat_map(|task| {
            task.services
                .iter()
                .map(|s| (CheckScope::Task(task.name.clone()), s))
        }));

    for (scope, service) in scoped {
        for check in &service.checks {
            result.push(CheckDefinition {
                id: CheckId::new(&alloc.id, &alloc.task_group, scope.as_str(), &check.name),
                scope: scope.clone(),
                service: service.name.clone(),
                provider: service.provider,
                service_address: service.address.clone(),
                check: check.clone(),
            });
        }
    }

    Some(result)
}

/// Current Unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
