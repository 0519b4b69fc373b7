//! agentrm-core — shared value types for the agent resource manager.
//!
//! Everything here is plain data: identifiers, the device and container
//! model reported by agents, the typed transport events the engine
//! consumes, and the TOML configuration.

pub mod config;
pub mod container;
pub mod device;
pub mod events;
pub mod id;

pub use config::RmConfig;
pub use container::{Container, ContainerState};
pub use device::{Device, DeviceId, DeviceType};
pub use events::*;
pub use id::{AgentId, AllocationId, ContainerId};
