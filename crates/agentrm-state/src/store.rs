//! StateStore — redb-backed snapshot persistence.
//!
//! Provides typed upsert/select/delete operations over agent snapshots and
//! container rows. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use agentrm_core::{AgentId, AllocationId, ContainerId};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe snapshot store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent snapshot store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory snapshot store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(AGENT_SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(AGENT_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(CONTAINER_SNAPSHOTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Insert or update an agent snapshot.
    ///
    /// A row with the same instance UUID is updated in place. Failing that,
    /// the row currently held by the same agent ID is replaced, so an agent
    /// never has more than one stored snapshot.
    pub fn put_agent(&self, snapshot: &AgentSnapshot) -> StateResult<()> {
        let key = snapshot.table_key();
        let agent_id = snapshot.agent_id.as_str();
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut index = txn.open_table(AGENT_INSTANCES).map_err(map_err!(Table))?;
            let mut table = txn.open_table(AGENT_SNAPSHOTS).map_err(map_err!(Table))?;

            // The UUID row may have been written under another agent ID.
            let owner: Option<AgentSnapshot> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };
            if let Some(owner) = owner.filter(|o| o.agent_id != snapshot.agent_id) {
                index
                    .remove(owner.agent_id.as_str())
                    .map_err(map_err!(Write))?;
            }

            let previous = index
                .get(agent_id)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            if let Some(previous) = previous.filter(|p| *p != key) {
                table.remove(previous.as_str()).map_err(map_err!(Write))?;
                debug!(%agent_id, %previous, "replaced snapshot of earlier incarnation");
            }

            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            index
                .insert(agent_id, key.as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%agent_id, instance = %key, "agent snapshot stored");
        Ok(())
    }

    /// Get the snapshot stored for an agent ID.
    pub fn get_agent(&self, agent_id: &AgentId) -> StateResult<Option<AgentSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let index = txn.open_table(AGENT_INSTANCES).map_err(map_err!(Table))?;
        let Some(key) = index
            .get(agent_id.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string())
        else {
            return Ok(None);
        };
        let table = txn.open_table(AGENT_SNAPSHOTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: AgentSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Err(StateError::NotFound(format!(
                "snapshot {key} indexed for agent {agent_id}"
            ))),
        }
    }

    /// List all agent snapshots.
    pub fn list_agents(&self) -> StateResult<Vec<AgentSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AGENT_SNAPSHOTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: AgentSnapshot =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(snapshot);
        }
        Ok(results)
    }

    /// Delete the snapshot of an agent. Returns true if it existed.
    pub fn delete_agent(&self, agent_id: &AgentId) -> StateResult<bool> {
        Ok(self.delete_agents(std::slice::from_ref(agent_id))? == 1)
    }

    /// Delete the snapshots of several agents. Returns number deleted.
    pub fn delete_agents(&self, agent_ids: &[AgentId]) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut index = txn.open_table(AGENT_INSTANCES).map_err(map_err!(Table))?;
            let mut table = txn.open_table(AGENT_SNAPSHOTS).map_err(map_err!(Table))?;
            for agent_id in agent_ids {
                let key = index
                    .remove(agent_id.as_str())
                    .map_err(map_err!(Write))?
                    .map(|guard| guard.value().to_string());
                if let Some(key) = key {
                    table.remove(key.as_str()).map_err(map_err!(Write))?;
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(requested = agent_ids.len(), deleted = count, "agent snapshots deleted");
        Ok(count)
    }

    // ── Containers ─────────────────────────────────────────────────

    /// Insert or update a container row.
    ///
    /// A row written without an allocation keeps the allocation already
    /// recorded for that container.
    pub fn put_container(&self, snapshot: &ContainerSnapshot) -> StateResult<()> {
        let key = snapshot.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONTAINER_SNAPSHOTS).map_err(map_err!(Table))?;
            let existing: Option<ContainerSnapshot> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            };

            let mut row = snapshot.clone();
            if row.allocation_id.is_none() {
                row.allocation_id = existing.and_then(|e| e.allocation_id);
            }
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(container_id = %key, state = ?snapshot.state, "container row stored");
        Ok(())
    }

    /// Get a container row by ID.
    pub fn get_container(&self, container_id: &ContainerId) -> StateResult<Option<ContainerSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONTAINER_SNAPSHOTS).map_err(map_err!(Table))?;
        match table.get(container_id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: ContainerSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Get the rows of the given containers. Unknown IDs are skipped.
    pub fn get_containers(&self, container_ids: &[ContainerId]) -> StateResult<Vec<ContainerSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONTAINER_SNAPSHOTS).map_err(map_err!(Table))?;
        let mut results = Vec::with_capacity(container_ids.len());
        for id in container_ids {
            if let Some(guard) = table.get(id.as_str()).map_err(map_err!(Read))? {
                let snapshot: ContainerSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                results.push(snapshot);
            }
        }
        Ok(results)
    }

    /// Resolve the owning allocation of each given container.
    ///
    /// Containers without a recorded allocation are absent from the result.
    pub fn container_allocations(
        &self,
        container_ids: &[ContainerId],
    ) -> StateResult<HashMap<ContainerId, AllocationId>> {
        let rows = self.get_containers(container_ids)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.allocation_id.map(|a| (row.container_id, a)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrm_core::{ContainerState, Device, DeviceType};
    use uuid::Uuid;

    fn test_agent(agent_id: &str) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: AgentId::new(agent_id),
            instance_uuid: Uuid::new_v4(),
            resource_pool_name: "default".to_string(),
            started: true,
            enabled: true,
            draining: false,
            max_zero_slot_containers: 100,
            slots: vec![SlotSnapshot {
                device: Device::new(0, DeviceType::Cuda, "T4"),
                device_added: true,
                agent_enabled: true,
                user_enabled: true,
                draining: false,
                container_id: Some(ContainerId::new("c1")),
            }],
            containers: vec![ContainerId::new("c1")],
        }
    }

    fn test_container(id: &str, state: ContainerState) -> ContainerSnapshot {
        ContainerSnapshot {
            container_id: ContainerId::new(id),
            allocation_id: None,
            state,
            devices: vec![Device::new(0, DeviceType::Cuda, "T4")],
        }
    }

    // ── Agent snapshots ────────────────────────────────────────────

    #[test]
    fn agent_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let snapshot = test_agent("agent-1");

        store.put_agent(&snapshot).unwrap();
        let retrieved = store.get_agent(&AgentId::new("agent-1")).unwrap();

        assert_eq!(retrieved, Some(snapshot));
    }

    #[test]
    fn agent_same_instance_updates_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut snapshot = test_agent("agent-1");
        store.put_agent(&snapshot).unwrap();

        snapshot.draining = true;
        snapshot.enabled = false;
        store.put_agent(&snapshot).unwrap();

        let all = store.list_agents().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].draining);
        assert!(!all[0].enabled);
    }

    #[test]
    fn agent_new_instance_replaces_previous_row() {
        let store = StateStore::open_in_memory().unwrap();
        let first = test_agent("agent-1");
        store.put_agent(&first).unwrap();

        let mut second = test_agent("agent-1");
        second.resource_pool_name = "gpu".to_string();
        store.put_agent(&second).unwrap();

        let all = store.list_agents().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].instance_uuid, second.instance_uuid);
        assert_eq!(all[0].resource_pool_name, "gpu");
    }

    #[test]
    fn agent_uuid_reused_by_other_agent_moves_row() {
        let store = StateStore::open_in_memory().unwrap();
        let first = test_agent("agent-1");
        store.put_agent(&first).unwrap();

        let mut moved = test_agent("agent-2");
        moved.instance_uuid = first.instance_uuid;
        store.put_agent(&moved).unwrap();

        assert!(store.get_agent(&AgentId::new("agent-1")).unwrap().is_none());
        assert_eq!(store.get_agent(&AgentId::new("agent-2")).unwrap(), Some(moved));
        assert_eq!(store.list_agents().unwrap().len(), 1);
    }

    #[test]
    fn agent_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_agent(&test_agent("agent-1")).unwrap();

        assert!(store.delete_agent(&AgentId::new("agent-1")).unwrap());
        assert!(!store.delete_agent(&AgentId::new("agent-1")).unwrap());
        assert!(store.get_agent(&AgentId::new("agent-1")).unwrap().is_none());
        assert!(store.list_agents().unwrap().is_empty());
    }

    #[test]
    fn agent_delete_many() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_agent(&test_agent("agent-1")).unwrap();
        store.put_agent(&test_agent("agent-2")).unwrap();
        store.put_agent(&test_agent("agent-3")).unwrap();

        let deleted = store
            .delete_agents(&[AgentId::new("agent-1"), AgentId::new("agent-3"), AgentId::new("nope")])
            .unwrap();
        assert_eq!(deleted, 2);

        let remaining = store.list_agents().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].agent_id, AgentId::new("agent-2"));
    }

    // ── Container rows ─────────────────────────────────────────────

    #[test]
    fn container_update_keeps_recorded_allocation() {
        let store = StateStore::open_in_memory().unwrap();
        let placed = test_container("c1", ContainerState::Starting)
            .with_allocation(AllocationId::new("alloc-1"));
        store.put_container(&placed).unwrap();

        store
            .put_container(&test_container("c1", ContainerState::Running))
            .unwrap();

        let row = store.get_container(&ContainerId::new("c1")).unwrap().unwrap();
        assert_eq!(row.state, ContainerState::Running);
        assert_eq!(row.allocation_id, Some(AllocationId::new("alloc-1")));
    }

    #[test]
    fn container_batch_lookup_skips_unknown() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_container(&test_container("c1", ContainerState::Running))
            .unwrap();
        store
            .put_container(&test_container("c2", ContainerState::Assigned))
            .unwrap();

        let rows = store
            .get_containers(&[ContainerId::new("c1"), ContainerId::new("missing")])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].container_id, ContainerId::new("c1"));
    }

    #[test]
    fn container_allocations_only_include_placed_containers() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_container(
                &test_container("c1", ContainerState::Running)
                    .with_allocation(AllocationId::new("alloc-1")),
            )
            .unwrap();
        store
            .put_container(&test_container("c2", ContainerState::Assigned))
            .unwrap();

        let owners = store
            .container_allocations(&[ContainerId::new("c1"), ContainerId::new("c2")])
            .unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[&ContainerId::new("c1")], AllocationId::new("alloc-1"));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");
        let snapshot = test_agent("agent-1");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_agent(&snapshot).unwrap();
            store
                .put_container(&test_container("c1", ContainerState::Running))
                .unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_agent(&AgentId::new("agent-1")).unwrap(), Some(snapshot));
        assert!(store.get_container(&ContainerId::new("c1")).unwrap().is_some());
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_agents().unwrap().is_empty());
        assert!(store.get_agent(&AgentId::new("any")).unwrap().is_none());
        assert!(store.get_containers(&[]).unwrap().is_empty());
        assert!(store.container_allocations(&[]).unwrap().is_empty());
        assert_eq!(store.delete_agents(&[]).unwrap(), 0);
    }
}
