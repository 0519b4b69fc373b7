//! Durable record types for the snapshot store.
//!
//! These are serialized projections of the live agent aggregate. They are
//! written after every state-changing operation and read back only when
//! the manager restarts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agentrm_core::{AgentId, AllocationId, Container, ContainerId, ContainerState, Device};

// ── Agent ─────────────────────────────────────────────────────────

/// Persisted state of one agent-state incarnation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    /// Random per-incarnation identifier; the primary key.
    pub instance_uuid: Uuid,
    pub resource_pool_name: String,
    /// Set once the agent has reported its inventory, even an empty one.
    #[serde(default)]
    pub started: bool,
    pub enabled: bool,
    pub draining: bool,
    pub max_zero_slot_containers: usize,
    pub slots: Vec<SlotSnapshot>,
    /// Containers tracked by the agent; their rows live in the container table.
    pub containers: Vec<ContainerId>,
}

/// Persisted state of a single slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotSnapshot {
    pub device: Device,
    pub device_added: bool,
    pub agent_enabled: bool,
    pub user_enabled: bool,
    pub draining: bool,
    pub container_id: Option<ContainerId>,
}

impl AgentSnapshot {
    /// Build the key for the agent snapshot table.
    pub fn table_key(&self) -> String {
        self.instance_uuid.to_string()
    }
}

// ── Container ─────────────────────────────────────────────────────

/// Persisted row for one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerSnapshot {
    pub container_id: ContainerId,
    /// Owning allocation, once the container was placed by the scheduler.
    pub allocation_id: Option<AllocationId>,
    pub state: ContainerState,
    pub devices: Vec<Device>,
}

impl ContainerSnapshot {
    pub fn from_container(container: &Container) -> Self {
        Self {
            container_id: container.id.clone(),
            allocation_id: None,
            state: container.state,
            devices: container.devices.clone(),
        }
    }

    pub fn with_allocation(mut self, allocation_id: AllocationId) -> Self {
        self.allocation_id = Some(allocation_id);
        self
    }

    pub fn to_container(&self) -> Container {
        Container {
            id: self.container_id.clone(),
            state: self.state,
            devices: self.devices.clone(),
        }
    }

    /// Build the key for the container table.
    pub fn table_key(&self) -> &str {
        self.container_id.as_str()
    }
}
