//! warpgrid-health — native service checks for WarpGrid allocations.
//!
//! Runs the checks declared by an allocation's services and keeps the
//! latest result of each one, in memory and in the client state store.
//! The allocation health tracker reads these results to decide whether a
//! deployment may proceed.
//!
//! # Architecture
//!
//! ```text
//! ChecksHook (one per allocation)
//!   ├── find checks in the job spec → CheckId per check
//!   ├── seed a pending QueryResult per check
//!   └── Observer per check (shared shutdown channel)
//!       ├── Checker::check(query) → ProbeOutcome (tcp / http)
//!       └── CheckStore::set → memory + StateStore (redb)
//! ```
//!
//! A probe never fails with an error: connection and protocol problems
//! become `critical` results whose output carries the error text.

pub mod checker;
pub mod error;
pub mod hook;
pub mod observer;
pub mod store;

pub use checker::{Checker, ProbeChecker, ProbeOutcome};
pub use error::{ChecksError, ChecksResult};
pub use hook::{ChecksHook, native_checks};
pub use observer::Observer;
pub use store::{AllocResultMap, CheckStore, StateDb};
