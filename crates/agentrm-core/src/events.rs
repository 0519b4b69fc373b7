//! Typed events delivered by the agent transport layer.
//!
//! The engine never performs socket I/O itself; these structs arrive
//! already decoded.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::container::Container;
use crate::device::Device;
use crate::id::{AllocationId, ContainerId};

/// Device inventory report sent when an agent (re)connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStarted {
    pub devices: Vec<Device>,
    pub resource_pool_name: String,
}

/// Lifecycle update for a single container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStateChanged {
    pub container: Container,
}

/// Explicit placement command issued by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTaskContainer {
    pub allocation_id: AllocationId,
    pub container: Container,
}

/// Agent's answer to a reattach request for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerReattachAck {
    pub container_id: ContainerId,
    /// Set when the agent could not reattach to the container.
    #[serde(default)]
    pub failure: Option<String>,
}

impl ContainerReattachAck {
    pub fn recovered(container_id: ContainerId) -> Self {
        Self {
            container_id,
            failure: None,
        }
    }

    pub fn failed(container_id: ContainerId, reason: impl Into<String>) -> Self {
        Self {
            container_id,
            failure: Some(reason.into()),
        }
    }

    pub fn is_recovered(&self) -> bool {
        self.failure.is_none()
    }
}

/// Container IDs the agent successfully reattached to.
pub fn recovered_container_ids(acks: &[ContainerReattachAck]) -> HashSet<ContainerId> {
    acks.iter()
        .filter(|ack| ack.is_recovered())
        .map(|ack| ack.container_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_acks_are_not_recovered() {
        let acks = vec![
            ContainerReattachAck::recovered(ContainerId::new("c1")),
            ContainerReattachAck::failed(ContainerId::new("c2"), "container gone"),
            ContainerReattachAck::recovered(ContainerId::new("c3")),
        ];

        let ids = recovered_container_ids(&acks);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&ContainerId::new("c1")));
        assert!(!ids.contains(&ContainerId::new("c2")));
        assert!(ids.contains(&ContainerId::new("c3")));
    }

    #[test]
    fn agent_started_parses_from_json() {
        let raw = r#"{
            "devices": [{"id": 0, "kind": "cuda", "brand": "A100", "uuid": "GPU-0"}],
            "resource_pool_name": "gpu-pool"
        }"#;
        let msg: AgentStarted = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.devices.len(), 1);
        assert_eq!(msg.resource_pool_name, "gpu-pool");
    }
}
