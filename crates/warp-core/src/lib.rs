pub mod checks;
pub mod config;
pub mod duration;
pub mod types;

pub use checks::{
    CheckDefinition, CheckId, CheckResult, CheckScope, Kind, Query, QueryResult, find_checks,
};
pub use config::ClientConfig;
pub use duration::parse_duration;
pub use types::*;
