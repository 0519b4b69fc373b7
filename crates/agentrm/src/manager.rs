//! AgentManager — registry of per-agent processors.
//!
//! Spawns one [`AgentProcessor`] per agent, either on first contact or
//! from stored snapshots at startup, and hands out their handles.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use agentrm_core::{AgentId, AgentStarted, RmConfig};
use agentrm_state::DurableStore;

use crate::agent_state::AgentState;
use crate::bus::AllocationEventBus;
use crate::error::AgentResult;
use crate::processor::{AgentHandle, AgentProcessor};
use crate::recovery;

/// A running processor and its task.
struct ProcessorSlot {
    handle: AgentHandle,
    task: JoinHandle<()>,
}

pub struct AgentManager {
    config: RmConfig,
    store: Arc<dyn DurableStore>,
    bus: AllocationEventBus,
    agents: HashMap<AgentId, ProcessorSlot>,
}

impl AgentManager {
    pub fn new(config: RmConfig, store: Arc<dyn DurableStore>) -> Self {
        let bus = AllocationEventBus::new(config.bus.capacity);
        Self {
            config,
            store,
            bus,
            agents: HashMap::new(),
        }
    }

    pub fn bus(&self) -> &AllocationEventBus {
        &self.bus
    }

    /// Rebuild every stored agent and spawn its processor.
    ///
    /// Recovered agents keep their containers until they reconnect and
    /// reconcile through [`AgentHandle::reattach`].
    pub fn recover(&mut self) -> AgentResult<usize> {
        let mut states = recovery::retrieve_agent_states(self.store.as_ref())?;
        recovery::restore_container_owners(self.store.as_ref(), &mut states)?;

        let count = states.len();
        for (_, state) in states {
            self.spawn(state);
        }
        info!(agents = count, "recovered agents");
        Ok(count)
    }

    /// Route an agent's start message, spawning its processor if needed.
    pub async fn agent_started(&mut self, agent_id: AgentId, msg: AgentStarted) -> AgentResult<AgentHandle> {
        let handle = match self.agents.get(&agent_id) {
            Some(slot) => slot.handle.clone(),
            None => {
                let state = AgentState::new(
                    agent_id,
                    self.config.agents.default_resource_pool.clone(),
                    self.config.agents.max_zero_slot_containers,
                );
                self.spawn(state)
            }
        };
        handle.agent_started(msg).await?;
        Ok(handle)
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<&AgentHandle> {
        self.agents.get(agent_id).map(|slot| &slot.handle)
    }

    /// Known agent IDs, sorted.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Point-in-time copies of every agent, for cross-agent scheduling.
    pub async fn copies(&self) -> AgentResult<Vec<AgentState>> {
        let mut copies = Vec::with_capacity(self.agents.len());
        for id in self.agent_ids() {
            if let Some(slot) = self.agents.get(&id) {
                copies.push(slot.handle.copy().await?);
            }
        }
        Ok(copies)
    }

    /// Delete an agent's state and stop its processor.
    pub async fn remove(&mut self, agent_id: &AgentId) -> AgentResult<bool> {
        let Some(slot) = self.agents.remove(agent_id) else {
            return Ok(false);
        };
        let result = slot.handle.remove().await;
        if let Err(e) = slot.task.await {
            warn!(%agent_id, error = %e, "agent processor task failed");
        }
        result.map(|()| true)
    }

    /// Stop every processor, waiting for queued commands to drain.
    pub async fn shutdown(self) {
        for (agent_id, slot) in self.agents {
            drop(slot.handle);
            if let Err(e) = slot.task.await {
                warn!(%agent_id, error = %e, "agent processor task failed");
            }
        }
        info!("agent manager stopped");
    }

    fn spawn(&mut self, state: AgentState) -> AgentHandle {
        let agent_id = state.id().clone();
        let processor = AgentProcessor::new(state, self.store.clone(), Arc::new(self.bus.clone()));
        let (handle, task) = processor.spawn(self.config.processor.queue_depth);
        self.agents.insert(
            agent_id,
            ProcessorSlot {
                handle: handle.clone(),
                task,
            },
        );
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrm_core::{AllocationId, Container, ContainerId, Device, DeviceType, StartTaskContainer};
    use agentrm_state::StateStore;

    use crate::agent_state::SlotPatch;

    fn started() -> AgentStarted {
        AgentStarted {
            devices: vec![Device::new(0, DeviceType::Cpu, "EPYC")],
            resource_pool_name: String::new(),
        }
    }

    #[tokio::test]
    async fn new_agents_take_configured_defaults() {
        let mut config = RmConfig::default();
        config.agents.default_resource_pool = "batch".to_string();
        config.agents.max_zero_slot_containers = 3;
        let mut manager = AgentManager::new(config, Arc::new(StateStore::open_in_memory().unwrap()));

        let handle = manager
            .agent_started(AgentId::new("agent-1"), started())
            .await
            .unwrap();

        let copy = handle.copy().await.unwrap();
        assert_eq!(copy.resource_pool_name(), "batch");
        assert_eq!(copy.num_zero_slots(), 3);
        assert_eq!(manager.agent_ids(), vec![AgentId::new("agent-1")]);
    }

    #[tokio::test]
    async fn recover_spawns_stored_agents() {
        let store = StateStore::open_in_memory().unwrap();
        {
            let mut manager = AgentManager::new(RmConfig::default(), Arc::new(store.clone()));
            let handle = manager
                .agent_started(AgentId::new("agent-1"), started())
                .await
                .unwrap();
            handle.allocate(1, ContainerId::new("c1")).await.unwrap();
            drop(handle);
            manager.shutdown().await;
        }

        let mut manager = AgentManager::new(RmConfig::default(), Arc::new(store));
        assert_eq!(manager.recover().unwrap(), 1);

        let copies = manager.copies().await.unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].num_used_slots(), 1);
    }

    #[tokio::test]
    async fn evictions_reach_bus_subscribers() {
        let mut manager =
            AgentManager::new(RmConfig::default(), Arc::new(StateStore::open_in_memory().unwrap()));
        let mut releases = manager.bus().subscribe();
        let handle = manager
            .agent_started(AgentId::new("agent-1"), started())
            .await
            .unwrap();
        handle
            .start_container(StartTaskContainer {
                allocation_id: AllocationId::new("alloc-1"),
                container: Container::new(ContainerId::new("c1"))
                    .with_devices(vec![Device::new(0, DeviceType::Cpu, "EPYC")]),
            })
            .await
            .unwrap();

        handle
            .patch_slot(0, SlotPatch { enabled: Some(false), drain: Some(false) })
            .await
            .unwrap();

        let release = releases.recv().await.unwrap();
        assert_eq!(release.allocation_id.as_str(), "alloc-1");
    }

    #[tokio::test]
    async fn removing_unknown_agent_is_noop() {
        let mut manager =
            AgentManager::new(RmConfig::default(), Arc::new(StateStore::open_in_memory().unwrap()));
        assert!(!manager.remove(&AgentId::new("ghost")).await.unwrap());
    }
}
