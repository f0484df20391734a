//! External service registry interface.
//!
//! The registry reports the checks it runs for an allocation's services,
//! grouped by task. Its client lives outside this crate; the tracker only
//! polls [`ServiceRegistry::alloc_registrations`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use warp_core::OnUpdate;

use crate::error::RegistryError;

/// Status of a check as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    /// Registered but not run yet.
    Pending,
    /// Administratively disabled.
    Maintenance,
}

/// A single registered check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredCheck {
    pub check_id: String,
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub output: String,
}

/// One registered service with its checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service: String,
    pub checks: Vec<RegisteredCheck>,
    /// `on_update` policy per check ID. Missing entries require healthy.
    #[serde(default)]
    pub check_on_update: HashMap<String, OnUpdate>,
}

/// Registrations of one task (or of the group's own services).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistrations {
    pub services: Vec<ServiceRegistration>,
}

/// Everything the registry knows about one allocation, keyed by task name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRegistration {
    pub tasks: HashMap<String, ServiceRegistrations>,
}

impl AllocRegistration {
    /// Total number of registered checks.
    pub fn num_checks(&self) -> usize {
        self.tasks
            .values()
            .flat_map(|t| t.services.iter())
            .map(|s| s.checks.len())
            .sum()
    }
}

/// Read access to the external service registry.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn alloc_registrations(&self, alloc_id: &str)
    -> Result<AllocRegistration, RegistryError>;
}
