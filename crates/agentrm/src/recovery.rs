//! Restart recovery: rebuild agents from the snapshot store.
//!
//! A restarted manager first calls [`retrieve_agent_states`] to rebuild
//! every stored agent, then [`restore_container_owners`] to reattach the
//! container → allocation map, and finally reconciles each agent against
//! the reattach acks it sends when it reconnects.

use std::collections::HashMap;

use tracing::{info, warn};

use agentrm_core::AgentId;
use agentrm_state::DurableStore;

use crate::agent_state::AgentState;
use crate::error::{AgentError, AgentResult};

/// Rebuild every stored agent, keyed by agent ID.
///
/// A snapshot that cannot be rebuilt fails the whole retrieval.
pub fn retrieve_agent_states(store: &dyn DurableStore) -> AgentResult<HashMap<AgentId, AgentState>> {
    let snapshots = store.load_agents()?;
    let mut agents = HashMap::with_capacity(snapshots.len());

    for snapshot in snapshots {
        let rows = store.load_containers(&snapshot.containers)?;
        let state = AgentState::from_snapshot(snapshot, rows)?;
        if let Some(previous) = agents.insert(state.id().clone(), state) {
            return Err(AgentError::InvalidSnapshot {
                agent_id: previous.id().clone(),
                reason: "more than one stored snapshot".to_string(),
            });
        }
    }

    info!(agents = agents.len(), "retrieved agent states");
    Ok(agents)
}

/// Reload the container → allocation map of every recovered agent.
///
/// Returns the total number of mappings installed.
pub fn restore_container_owners(
    store: &dyn DurableStore,
    agents: &mut HashMap<AgentId, AgentState>,
) -> AgentResult<usize> {
    let mut restored = 0;
    for state in agents.values_mut() {
        let ids = state.container_ids();
        if ids.is_empty() {
            continue;
        }
        let owners = store.load_container_allocations(&ids)?;
        let installed = state.restore_container_owners(owners);
        if installed < ids.len() {
            warn!(
                agent_id = %state.id(),
                tracked = ids.len(),
                installed,
                "some recovered containers have no recorded allocation"
            );
        }
        restored += installed;
    }
    Ok(restored)
}

/// Delete the stored snapshots of the given agents.
pub fn clear_agent_states(store: &dyn DurableStore, agent_ids: &[AgentId]) -> AgentResult<u32> {
    let removed = store.delete_agents(agent_ids)?;
    info!(requested = agent_ids.len(), removed, "cleared agent states");
    Ok(removed)
}
