//! agentrm — per-agent resource management.
//!
//! Tracks the devices ("slots") each agent contributes, which container
//! occupies them, and whether operators have enabled, disabled or drained
//! them. State lives in an [`AgentState`] aggregate owned by one
//! [`AgentProcessor`] task per agent; snapshots go to the durable store on
//! every change, so a restarted manager can rebuild its agents (see
//! [`recovery`]) and reconcile them when they reconnect.

pub mod agent_state;
pub mod bus;
pub mod error;
pub mod manager;
pub mod processor;
pub mod recovery;
pub mod slot;
pub mod summary;

pub use agent_state::{AgentState, SlotPatch};
pub use bus::{AllocationEventBus, ReleasePublisher, ReleaseResources};
pub use error::{AgentError, AgentResult};
pub use manager::AgentManager;
pub use processor::{AgentCommand, AgentHandle, AgentProcessor};
pub use recovery::{clear_agent_states, restore_container_owners, retrieve_agent_states};
pub use slot::{Slot, SlotEnablement, SlotStatus};
pub use summary::{AgentSummary, SlotSummary, SlotsSummary};
