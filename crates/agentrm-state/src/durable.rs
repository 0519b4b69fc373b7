//! The narrow persistence interface the agent engine writes through.
//!
//! One write method per record kind plus the bulk reads recovery needs.
//! Writers treat every error as best-effort: they log and carry on.

use std::collections::HashMap;

use agentrm_core::{AgentId, AllocationId, ContainerId};

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::{AgentSnapshot, ContainerSnapshot};

pub trait DurableStore: Send + Sync {
    /// Upsert an agent snapshot, keyed by instance UUID then agent ID.
    fn upsert_agent(&self, snapshot: &AgentSnapshot) -> StateResult<()>;

    /// Upsert a container row.
    fn upsert_container(&self, snapshot: &ContainerSnapshot) -> StateResult<()>;

    /// Remove the snapshots of the given agents. Returns number removed.
    fn delete_agents(&self, agent_ids: &[AgentId]) -> StateResult<u32>;

    /// Every stored agent snapshot.
    fn load_agents(&self) -> StateResult<Vec<AgentSnapshot>>;

    /// Rows of the given containers; unknown IDs are skipped.
    fn load_containers(&self, container_ids: &[ContainerId]) -> StateResult<Vec<ContainerSnapshot>>;

    /// Owning allocation of each given container, where one is recorded.
    fn load_container_allocations(
        &self,
        container_ids: &[ContainerId],
    ) -> StateResult<HashMap<ContainerId, AllocationId>>;
}

impl DurableStore for StateStore {
    fn upsert_agent(&self, snapshot: &AgentSnapshot) -> StateResult<()> {
        self.put_agent(snapshot)
    }

    fn upsert_container(&self, snapshot: &ContainerSnapshot) -> StateResult<()> {
        self.put_container(snapshot)
    }

    fn delete_agents(&self, agent_ids: &[AgentId]) -> StateResult<u32> {
        StateStore::delete_agents(self, agent_ids)
    }

    fn load_agents(&self) -> StateResult<Vec<AgentSnapshot>> {
        self.list_agents()
    }

    fn load_containers(&self, container_ids: &[ContainerId]) -> StateResult<Vec<ContainerSnapshot>> {
        self.get_containers(container_ids)
    }

    fn load_container_allocations(
        &self,
        container_ids: &[ContainerId],
    ) -> StateResult<HashMap<ContainerId, AllocationId>> {
        self.container_allocations(container_ids)
    }
}
