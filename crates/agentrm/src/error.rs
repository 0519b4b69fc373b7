//! Agent engine error types.

use thiserror::Error;

use agentrm_core::{AgentId, Device, DeviceId};
use agentrm_state::StateError;

/// Errors returned by agent state operations.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("not enough devices: requested {requested}, {free} free")]
    InsufficientDevices { requested: usize, free: usize },

    #[error("can't find slot")]
    SlotNotFound,

    #[error("container allocated but slot is not enabled")]
    SlotNotEnabled,

    #[error("container already allocated to slot")]
    SlotOccupied,

    #[error("bad start container on device {device} ({agent_id}): {source}")]
    StartContainer {
        device: DeviceId,
        agent_id: AgentId,
        #[source]
        source: Box<AgentError>,
    },

    #[error("slot {device} not found on agent {agent_id}")]
    UnknownSlot { device: DeviceId, agent_id: AgentId },

    #[error("device count has changed: {known} -> {reported}")]
    DeviceCountChanged { known: usize, reported: usize },

    #[error("device properties have changed: {} -> {}", .known, fmt_reported(.reported))]
    DeviceChanged {
        known: Device,
        reported: Option<Device>,
    },

    #[error("resource pool has changed: {known} -> {reported}")]
    ResourcePoolChanged { known: String, reported: String },

    #[error("invalid snapshot for agent {agent_id}: {reason}")]
    InvalidSnapshot { agent_id: AgentId, reason: String },

    #[error("agent {0} processor has stopped")]
    ProcessorStopped(AgentId),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

fn fmt_reported(reported: &Option<Device>) -> String {
    match reported {
        Some(device) => device.to_string(),
        None => "<missing>".to_string(),
    }
}

impl AgentError {
    /// Reattach validation failures: the agent must be restarted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AgentError::DeviceCountChanged { .. }
                | AgentError::DeviceChanged { .. }
                | AgentError::ResourcePoolChanged { .. }
        )
    }

    /// Capacity failures leave the agent untouched.
    pub fn is_capacity(&self) -> bool {
        match self {
            AgentError::InsufficientDevices { .. }
            | AgentError::SlotNotFound
            | AgentError::SlotNotEnabled
            | AgentError::SlotOccupied => true,
            AgentError::StartContainer { source, .. } => source.is_capacity(),
            _ => false,
        }
    }

    /// Whether a scheduler may retry the request, possibly on another agent.
    pub fn is_retryable(&self) -> bool {
        self.is_capacity()
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
