//! Read-only views of agent state for operators and schedulers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use agentrm_core::{AgentId, Container, Device};

/// State of one slot as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSummary {
    pub id: String,
    pub device: Device,
    pub enabled: bool,
    pub draining: bool,
    pub container: Option<Container>,
}

/// Slot summaries keyed by slot address.
pub type SlotsSummary = BTreeMap<String, SlotSummary>;

/// Capacity figures and slots of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub resource_pool_name: String,
    pub enabled: bool,
    pub draining: bool,
    pub num_slots: usize,
    pub num_used_slots: usize,
    pub num_empty_slots: usize,
    pub num_zero_slots: usize,
    pub num_used_zero_slots: usize,
    pub num_containers: usize,
    pub slots: SlotsSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrm_core::{ContainerId, ContainerState, DeviceType};

    #[test]
    fn slot_summary_serializes_occupant_inline() {
        let summary = SlotSummary {
            id: "0".to_string(),
            device: Device::new(0, DeviceType::Cuda, "T4"),
            enabled: true,
            draining: false,
            container: Some(Container::new(ContainerId::new("c1")).with_state(ContainerState::Running)),
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["id"], "0");
        assert_eq!(json["device"]["brand"], "T4");
        assert_eq!(json["container"]["id"], "c1");
        assert_eq!(json["draining"], false);
    }
}
