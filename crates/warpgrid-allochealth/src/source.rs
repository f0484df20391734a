//! Check sources: where the tracker's check observations come from.
//!
//! Both the external registry and this client's own check store are
//! projected into the same [`CheckObservation`] shape, so one watcher loop
//! serves either.

use std::sync::Arc;

use async_trait::async_trait;

use warp_core::{CheckDefinition, CheckResult, OnUpdate};
use warpgrid_health::CheckStore;

use crate::error::RegistryError;
use crate::fusion::CheckSourceKind;
use crate::registry::{CheckStatus, ServiceRegistry};

/// The observed state of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckObservation {
    /// Owning task; `None` for group-level services.
    pub task: Option<String>,
    pub service: String,
    pub check: String,
    pub status: CheckStatus,
    pub on_update: OnUpdate,
}

impl CheckObservation {
    /// Whether this check allows the allocation to be healthy.
    pub fn passes(&self) -> bool {
        match self.status {
            CheckStatus::Passing => true,
            CheckStatus::Warning => self.on_update != OnUpdate::RequireHealthy,
            CheckStatus::Critical => self.on_update == OnUpdate::Ignore,
            CheckStatus::Pending | CheckStatus::Maintenance => false,
        }
    }
}

/// Whether at least `expected` checks are reported and all of them pass.
pub fn checks_pass(observations: &[CheckObservation], expected: usize) -> bool {
    observations.len() >= expected && observations.iter().all(CheckObservation::passes)
}

/// Produces the current observations of one kind of check.
#[async_trait]
pub trait CheckSource: Send + Sync {
    fn kind(&self) -> CheckSourceKind;

    async fn observe(&self) -> Result<Vec<CheckObservation>, RegistryError>;
}

/// Checks the external registry runs for an allocation.
pub struct RegistrySource {
    alloc_id: String,
    registry: Arc<dyn ServiceRegistry>,
}

impl RegistrySource {
    pub fn new(alloc_id: &str, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            alloc_id: alloc_id.to_string(),
            registry,
        }
    }
}

#[async_trait]
impl CheckSource for RegistrySource {
    fn kind(&self) -> CheckSourceKind {
        CheckSourceKind::Registry
    }

    async fn observe(&self) -> Result<Vec<CheckObservation>, RegistryError> {
        let registration = self.registry.alloc_registrations(&self.alloc_id).await?;
        let mut observations = Vec::with_capacity(registration.num_checks());
        for (task, registrations) in registration.tasks {
            for service in registrations.services {
                for check in &service.checks {
                    observations.push(CheckObservation {
                        task: Some(task.clone()),
                        service: service.service.clone(),
                        check: check.name.clone(),
                        status: check.status,
                        on_update: service
                            .check_on_update
                            .get(&check.check_id)
                            .copied()
                            .unwrap_or_default(),
                    });
                }
            }
        }
        Ok(observations)
    }
}

/// Checks this client runs itself, read from the check store.
pub struct NativeSource {
    alloc_id: String,
    store: CheckStore,
    checks: Vec<CheckDefinition>,
}

impl NativeSource {
    /// `checks` are the allocation's native check definitions.
    pub fn new(alloc_id: &str, store: CheckStore, checks: Vec<CheckDefinition>) -> Self {
        Self {
            alloc_id: alloc_id.to_string(),
            store,
            checks,
        }
    }
}

#[async_trait]
impl CheckSource for NativeSource {
    fn kind(&self) -> CheckSourceKind {
        CheckSourceKind::Native
    }

    async fn observe(&self) -> Result<Vec<CheckObservation>, RegistryError> {
        let results = self.store.list(&self.alloc_id);
        Ok(self
            .checks
            .iter()
            .map(|def| {
                let status = match results.get(&def.id).map(|r| r.result) {
                    Some(CheckResult::Success) => CheckStatus::Passing,
                    Some(CheckResult::Critical) => CheckStatus::Critical,
                    Some(CheckResult::Missing) | None => CheckStatus::Pending,
                };
                CheckObservation {
                    task: def.scope.task_name().map(str::to_string),
                    service: def.service.clone(),
                    check: def.check.name.clone(),
                    status,
                    on_update: def.check.on_update,
                }
            })
            .collect())
    }
}
