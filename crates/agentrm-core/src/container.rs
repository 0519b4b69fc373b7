//! Containers tracked against an agent's slots.

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::id::ContainerId;

/// Lifecycle state of a container as reported by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Registered against capacity, not yet launched.
    #[default]
    Assigned,
    Starting,
    Running,
    Terminated,
}

/// A container and the devices it occupies.
///
/// A container with no devices is a zero-slot container and counts against
/// the agent's separate zero-slot capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl Container {
    /// A freshly registered container with no devices.
    pub fn new(id: ContainerId) -> Self {
        Self {
            id,
            state: ContainerState::Assigned,
            devices: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: ContainerState) -> Self {
        self.state = state;
        self
    }

    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn is_zero_slot(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ContainerState::Terminated
    }
}
