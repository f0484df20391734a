//! warpgrid-state — durable client state for WarpGrid health checks.
//!
//! Backed by [redb](https://docs.rs/redb), persists the latest result of
//! every service check the client runs so results survive a restart.
//!
//! # Layout
//!
//! Results are JSON-serialized into redb's `&[u8]` value column under the
//! composite key `{alloc_id}:{check_id}`. Prefix scans on `{alloc_id}:`
//! list or purge one allocation; point removes drop an explicit subset.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
