//! redb table definitions for the client state store.

use redb::TableDefinition;

/// Latest check results keyed by `{alloc_id}:{check_id}`.
pub const CHECK_RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("check_results");
