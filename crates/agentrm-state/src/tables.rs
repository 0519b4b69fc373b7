//! redb table definitions for the snapshot store.
//!
//! Snapshot tables use `&str` keys and `&[u8]` values (JSON-serialized
//! records). `AGENT_INSTANCES` is the unique index from agent ID to the
//! instance UUID currently holding that agent's snapshot.

use redb::TableDefinition;

/// Agent snapshots keyed by `{instance_uuid}`.
pub const AGENT_SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agent_snapshots");

/// `{agent_id}` → `{instance_uuid}`.
pub const AGENT_INSTANCES: TableDefinition<&str, &str> = TableDefinition::new("agent_instances");

/// Container rows keyed by `{container_id}`.
pub const CONTAINER_SNAPSHOTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("container_snapshots");
