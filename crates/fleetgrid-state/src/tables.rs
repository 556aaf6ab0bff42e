//! redb table definitions for the FleetGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Executables use composite `{id}:{version}` keys.

use redb::TableDefinition;

/// Device records keyed by `{device_id}`.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");

/// Workload records keyed by `{workload_id}`.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");

/// Executable artifacts keyed by `{executable_id}:{version}`.
pub const EXECUTABLES: TableDefinition<&str, &[u8]> = TableDefinition::new("executables");
