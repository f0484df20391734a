//! warpgrid-allochealth — decides whether a deployed allocation is healthy.
//!
//! A [`Tracker`] watches one allocation until the first of:
//!
//! - every task has run for `min_healthy_time` and every required check
//!   source has passed for `min_healthy_time` → **healthy**;
//! - a task fails, or `healthy_deadline` passes → **unhealthy**;
//! - the allocation is stopped → **stopped** (no verdict).
//!
//! # Architecture
//!
//! ```text
//! Tracker
//!   ├── task watcher     ← watch::Receiver<Arc<Allocation>>
//!   ├── check watcher    ← RegistrySource (external registry, polled)
//!   ├── check watcher    ← NativeSource (CheckStore, polled)
//!   └── deadline watcher
//!         │
//!         └── HealthFlags::apply → Once<bool> verdict + shutdown
//! ```
//!
//! After an unhealthy verdict, [`Tracker::task_events`] explains per task
//! what kept the allocation from being healthy.

pub mod error;
pub mod fusion;
pub mod registry;
pub mod signal;
pub mod source;
pub mod task_health;
pub mod timer;
pub mod tracker;

pub use error::{RegistryError, TrackerError, TrackerResult};
pub use fusion::{CheckSourceKind, HealthFlags, HealthSignal, Requirements, TaskEvaluation};
pub use registry::{
    AllocRegistration, CheckStatus, RegisteredCheck, ServiceRegistration, ServiceRegistrations,
    ServiceRegistry,
};
pub use source::{CheckObservation, CheckSource, NativeSource, RegistrySource, checks_pass};
pub use task_health::{EventContext, TaskHealthState};
pub use tracker::{DEFAULT_CHECK_POLL_INTERVAL, Outcome, Tracker, TrackerConfig};
