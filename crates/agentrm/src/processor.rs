//! Per-agent processor task.
//!
//! Each agent's [`AgentState`] is owned by exactly one spawned task that
//! drains a bounded command queue, so the aggregate needs no locking.
//! Callers talk to it through a cloneable [`AgentHandle`]; every command
//! carries a `oneshot` sender for its reply.
//!
//! After every state change the task writes the agent snapshot (and the
//! touched container row) through the [`DurableStore`]. Writes are
//! best-effort: failures are logged and the in-memory change stands.
//! Force-release requests produced by transitions go to the
//! [`ReleasePublisher`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentrm_core::{
    AgentId, AgentStarted, ContainerId, ContainerReattachAck, ContainerStateChanged, Device,
    DeviceId, StartTaskContainer, recovered_container_ids,
};
use agentrm_state::{ContainerSnapshot, DurableStore};

use crate::agent_state::{AgentState, SlotPatch};
use crate::bus::{ReleasePublisher, ReleaseResources};
use crate::error::{AgentError, AgentResult};
use crate::summary::{AgentSummary, SlotSummary, SlotsSummary};

type Reply<T> = oneshot::Sender<T>;

/// Commands accepted by an agent processor.
#[derive(Debug)]
pub enum AgentCommand {
    Started {
        msg: AgentStarted,
        reply: Reply<AgentResult<()>>,
    },
    ContainerStateChanged {
        msg: ContainerStateChanged,
        reply: Reply<()>,
    },
    StartContainer {
        msg: StartTaskContainer,
        reply: Reply<AgentResult<()>>,
    },
    Allocate {
        slots: usize,
        container_id: ContainerId,
        reply: Reply<AgentResult<Vec<Device>>>,
    },
    Deallocate {
        container_id: ContainerId,
        reply: Reply<bool>,
    },
    Enable {
        reply: Reply<()>,
    },
    Disable {
        drain: bool,
        reply: Reply<()>,
    },
    PatchSlot {
        device_id: DeviceId,
        patch: SlotPatch,
        reply: Reply<AgentResult<SlotSummary>>,
    },
    PatchAllSlots {
        patch: SlotPatch,
        reply: Reply<SlotsSummary>,
    },
    Reattach {
        acks: Vec<ContainerReattachAck>,
        reply: Reply<bool>,
    },
    RestoreOwners {
        reply: Reply<AgentResult<usize>>,
    },
    Copy {
        reply: Reply<AgentState>,
    },
    Summary {
        base_address: String,
        reply: Reply<AgentSummary>,
    },
    /// Delete the agent's snapshot and stop the task.
    Remove {
        reply: Reply<AgentResult<()>>,
    },
}

/// Cloneable handle to a running agent processor.
#[derive(Clone)]
pub struct AgentHandle {
    agent_id: AgentId,
    tx: mpsc::Sender<AgentCommand>,
}

impl AgentHandle {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> AgentCommand,
    ) -> AgentResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| AgentError::ProcessorStopped(self.agent_id.clone()))?;
        rx.await
            .map_err(|_| AgentError::ProcessorStopped(self.agent_id.clone()))
    }

    /// Register the reported inventory, or validate it on reconnect.
    pub async fn agent_started(&self, msg: AgentStarted) -> AgentResult<()> {
        self.request(|reply| AgentCommand::Started { msg, reply })
            .await?
    }

    pub async fn container_state_changed(&self, msg: ContainerStateChanged) -> AgentResult<()> {
        self.request(|reply| AgentCommand::ContainerStateChanged { msg, reply })
            .await
    }

    pub async fn start_container(&self, msg: StartTaskContainer) -> AgentResult<()> {
        self.request(|reply| AgentCommand::StartContainer { msg, reply })
            .await?
    }

    pub async fn allocate(&self, slots: usize, container_id: ContainerId) -> AgentResult<Vec<Device>> {
        self.request(|reply| AgentCommand::Allocate {
            slots,
            container_id,
            reply,
        })
        .await?
    }

    pub async fn deallocate(&self, container_id: ContainerId) -> AgentResult<bool> {
        self.request(|reply| AgentCommand::Deallocate {
            container_id,
            reply,
        })
        .await
    }

    pub async fn enable(&self) -> AgentResult<()> {
        self.request(|reply| AgentCommand::Enable { reply }).await
    }

    pub async fn disable(&self, drain: bool) -> AgentResult<()> {
        self.request(|reply| AgentCommand::Disable { drain, reply })
            .await
    }

    pub async fn patch_slot(&self, device_id: DeviceId, patch: SlotPatch) -> AgentResult<SlotSummary> {
        self.request(|reply| AgentCommand::PatchSlot {
            device_id,
            patch,
            reply,
        })
        .await?
    }

    pub async fn patch_all_slots(&self, patch: SlotPatch) -> AgentResult<SlotsSummary> {
        self.request(|reply| AgentCommand::PatchAllSlots { patch, reply })
            .await
    }

    /// Reconcile against the agent's reattach acks. Returns whether anything was cleared.
    pub async fn reattach(&self, acks: Vec<ContainerReattachAck>) -> AgentResult<bool> {
        self.request(|reply| AgentCommand::Reattach { acks, reply })
            .await
    }

    /// Reload the container → allocation map from the store.
    pub async fn restore_container_owners(&self) -> AgentResult<usize> {
        self.request(|reply| AgentCommand::RestoreOwners { reply })
            .await?
    }

    /// Deep copy of the agent's current state.
    pub async fn copy(&self) -> AgentResult<AgentState> {
        self.request(|reply| AgentCommand::Copy { reply }).await
    }

    pub async fn summary(&self, base_address: impl Into<String>) -> AgentResult<AgentSummary> {
        let base_address = base_address.into();
        self.request(|reply| AgentCommand::Summary {
            base_address,
            reply,
        })
        .await
    }

    /// Delete the agent's snapshot and stop its processor.
    pub async fn remove(&self) -> AgentResult<()> {
        self.request(|reply| AgentCommand::Remove { reply })
            .await?
    }
}

/// Owner of one agent's state.
pub struct AgentProcessor {
    state: AgentState,
    store: Arc<dyn DurableStore>,
    publisher: Arc<dyn ReleasePublisher>,
}

impl AgentProcessor {
    pub fn new(
        state: AgentState,
        store: Arc<dyn DurableStore>,
        publisher: Arc<dyn ReleasePublisher>,
    ) -> Self {
        Self {
            state,
            store,
            publisher,
        }
    }

    /// Spawn the processor task. It runs until every handle is dropped or
    /// the agent is removed.
    pub fn spawn(self, queue_depth: usize) -> (AgentHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let handle = AgentHandle {
            agent_id: self.state.id().clone(),
            tx,
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<AgentCommand>) {
        info!(agent_id = %self.state.id(), "agent processor started");
        while let Some(command) = rx.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        info!(agent_id = %self.state.id(), "agent processor stopped");
    }

    /// Apply one command. Returns false when the processor should stop.
    fn handle(&mut self, command: AgentCommand) -> bool {
        match command {
            AgentCommand::Started { msg, reply } => {
                let _ = reply.send(self.on_started(&msg));
            }
            AgentCommand::ContainerStateChanged { msg, reply } => {
                self.state.container_state_changed(&msg);
                self.persist_container(ContainerSnapshot::from_container(&msg.container));
                self.persist();
                let _ = reply.send(());
            }
            AgentCommand::StartContainer { msg, reply } => {
                let result = self.state.start_container(&msg);
                if result.is_ok() {
                    self.persist_tracked_container(&msg.container.id);
                    self.persist();
                }
                let _ = reply.send(result);
            }
            AgentCommand::Allocate {
                slots,
                container_id,
                reply,
            } => {
                let result = self.state.allocate(slots, &container_id);
                // The container record is registered even on failure.
                self.persist_tracked_container(&container_id);
                self.persist();
                let _ = reply.send(result);
            }
            AgentCommand::Deallocate {
                container_id,
                reply,
            } => {
                let changed = self.state.deallocate(&container_id);
                if changed {
                    self.persist();
                }
                let _ = reply.send(changed);
            }
            AgentCommand::Enable { reply } => {
                let releases = self.state.enable();
                self.publish(releases);
                self.persist();
                let _ = reply.send(());
            }
            AgentCommand::Disable { drain, reply } => {
                let releases = self.state.disable(drain);
                self.publish(releases);
                self.persist();
                let _ = reply.send(());
            }
            AgentCommand::PatchSlot {
                device_id,
                patch,
                reply,
            } => {
                let result = self
                    .state
                    .patch_slot(device_id, patch)
                    .map(|(summary, releases)| {
                        self.publish(releases);
                        self.persist();
                        summary
                    });
                let _ = reply.send(result);
            }
            AgentCommand::PatchAllSlots { patch, reply } => {
                let (summary, releases) = self.state.patch_all_slots(patch);
                self.publish(releases);
                self.persist();
                let _ = reply.send(summary);
            }
            AgentCommand::Reattach { acks, reply } => {
                let recovered = recovered_container_ids(&acks);
                let updated = self.state.clear_unless_recovered(&recovered);
                if updated {
                    self.persist();
                }
                let _ = reply.send(updated);
            }
            AgentCommand::RestoreOwners { reply } => {
                let _ = reply.send(self.restore_container_owners());
            }
            AgentCommand::Copy { reply } => {
                let _ = reply.send(self.state.deep_copy());
            }
            AgentCommand::Summary {
                base_address,
                reply,
            } => {
                let _ = reply.send(self.state.summary(&base_address));
            }
            AgentCommand::Remove { reply } => {
                let result = self
                    .store
                    .delete_agents(std::slice::from_ref(self.state.id()))
                    .map(|removed| {
                        info!(agent_id = %self.state.id(), removed, "agent state deleted");
                    })
                    .map_err(AgentError::from);
                let _ = reply.send(result);
                return false;
            }
        }
        true
    }

    fn on_started(&mut self, msg: &AgentStarted) -> AgentResult<()> {
        if !self.state.is_started() {
            self.state.agent_started(msg);
            self.persist();
            return Ok(());
        }

        // Reconnect: the known inventory stands and must match.
        self.state.validate_device_inventory(msg)?;
        self.state.validate_resource_pool(msg)?;
        info!(agent_id = %self.state.id(), "agent reattached with matching inventory");
        Ok(())
    }

    fn restore_container_owners(&mut self) -> AgentResult<usize> {
        let ids = self.state.container_ids();
        let owners = if ids.is_empty() {
            HashMap::new()
        } else {
            self.store.load_container_allocations(&ids)?
        };
        Ok(self.state.restore_container_owners(owners))
    }

    fn publish(&self, releases: Vec<ReleaseResources>) {
        for release in releases {
            info!(
                agent_id = %self.state.id(),
                allocation_id = %release.allocation_id,
                reason = %release.reason,
                "force-releasing allocation"
            );
            self.publisher.publish(release);
        }
    }

    fn persist(&self) {
        let snapshot = self.state.snapshot();
        match self.store.upsert_agent(&snapshot) {
            Ok(()) => debug!(agent_id = %self.state.id(), "agent snapshot persisted"),
            Err(e) => warn!(
                agent_id = %self.state.id(),
                error = %e,
                "failed to persist agent snapshot"
            ),
        }
    }

    fn persist_tracked_container(&self, container_id: &ContainerId) {
        if let Some(row) = self.state.container_snapshot(container_id) {
            self.persist_container(row);
        }
    }

    fn persist_container(&self, row: ContainerSnapshot) {
        if let Err(e) = self.store.upsert_container(&row) {
            warn!(
                agent_id = %self.state.id(),
                container_id = %row.container_id,
                error = %e,
                "failed to persist container"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use agentrm_core::{AllocationId, Container, ContainerState, DeviceType};
    use agentrm_state::{
        AgentSnapshot, StateError, StateResult, StateStore,
    };

    use crate::bus::AllocationEventBus;

    /// Store whose every write fails.
    struct FailingStore;

    impl DurableStore for FailingStore {
        fn upsert_agent(&self, _: &AgentSnapshot) -> StateResult<()> {
            Err(StateError::Write("disk full".into()))
        }
        fn upsert_container(&self, _: &ContainerSnapshot) -> StateResult<()> {
            Err(StateError::Write("disk full".into()))
        }
        fn delete_agents(&self, _: &[AgentId]) -> StateResult<u32> {
            Err(StateError::Write("disk full".into()))
        }
        fn load_agents(&self) -> StateResult<Vec<AgentSnapshot>> {
            Ok(Vec::new())
        }
        fn load_containers(&self, _: &[ContainerId]) -> StateResult<Vec<ContainerSnapshot>> {
            Ok(Vec::new())
        }
        fn load_container_allocations(
            &self,
            _: &[ContainerId],
        ) -> StateResult<HashMap<ContainerId, AllocationId>> {
            Err(StateError::Read("disk gone".into()))
        }
    }

    /// Publisher that records what it was given.
    #[derive(Default)]
    struct RecordingPublisher(Mutex<Vec<ReleaseResources>>);

    impl ReleasePublisher for RecordingPublisher {
        fn publish(&self, release: ReleaseResources) {
            self.0.lock().unwrap().push(release);
        }
    }

    fn started(n: u32) -> AgentStarted {
        AgentStarted {
            devices: (0..n)
                .map(|i| Device::new(i, DeviceType::Cuda, "T4"))
                .collect(),
            resource_pool_name: "gpu".to_string(),
        }
    }

    fn spawn_with(
        store: Arc<dyn DurableStore>,
        publisher: Arc<dyn ReleasePublisher>,
    ) -> (AgentHandle, JoinHandle<()>) {
        let state = AgentState::new(AgentId::new("agent-1"), "default", 4);
        AgentProcessor::new(state, store, publisher).spawn(8)
    }

    #[tokio::test]
    async fn state_changes_are_persisted() {
        let store = StateStore::open_in_memory().unwrap();
        let (handle, _task) = spawn_with(
            Arc::new(store.clone()),
            Arc::new(AllocationEventBus::new(8)),
        );

        handle.agent_started(started(2)).await.unwrap();
        handle.allocate(1, ContainerId::new("c1")).await.unwrap();

        let snapshot = store.get_agent(&AgentId::new("agent-1")).unwrap().unwrap();
        assert_eq!(snapshot.slots.len(), 2);
        assert_eq!(snapshot.containers, vec![ContainerId::new("c1")]);
        assert!(store.get_container(&ContainerId::new("c1")).unwrap().is_some());
    }

    #[tokio::test]
    async fn persistence_failures_do_not_block_transitions() {
        let (handle, _task) = spawn_with(
            Arc::new(FailingStore),
            Arc::new(AllocationEventBus::new(8)),
        );

        handle.agent_started(started(2)).await.unwrap();
        let claimed = handle.allocate(2, ContainerId::new("c1")).await.unwrap();
        assert_eq!(claimed.len(), 2);

        let copy = handle.copy().await.unwrap();
        assert_eq!(copy.num_used_slots(), 2);
        assert_eq!(copy.num_empty_slots(), 0);
    }

    #[tokio::test]
    async fn disabling_occupied_slot_publishes_release() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (handle, _task) = spawn_with(
            Arc::new(StateStore::open_in_memory().unwrap()),
            publisher.clone(),
        );
        handle.agent_started(started(2)).await.unwrap();
        handle
            .start_container(StartTaskContainer {
                allocation_id: AllocationId::new("alloc-1"),
                container: Container::new(ContainerId::new("c1"))
                    .with_state(ContainerState::Starting)
                    .with_devices(vec![Device::new(1, DeviceType::Cuda, "T4")]),
            })
            .await
            .unwrap();

        let summary = handle
            .patch_slot(1, SlotPatch { enabled: Some(false), drain: None })
            .await
            .unwrap();

        assert!(!summary.enabled);
        let published = publisher.0.lock().unwrap().clone();
        assert_eq!(
            published,
            vec![ReleaseResources::slot_disabled(AllocationId::new("alloc-1"))]
        );
    }

    #[tokio::test]
    async fn reconnect_with_changed_inventory_is_rejected() {
        let (handle, _task) = spawn_with(
            Arc::new(StateStore::open_in_memory().unwrap()),
            Arc::new(AllocationEventBus::new(8)),
        );
        handle.agent_started(started(2)).await.unwrap();

        handle.agent_started(started(2)).await.unwrap();
        let err = handle.agent_started(started(3)).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn zero_device_agent_cannot_change_pool_on_reconnect() {
        let (handle, _task) = spawn_with(
            Arc::new(StateStore::open_in_memory().unwrap()),
            Arc::new(AllocationEventBus::new(8)),
        );
        let pool = |name: &str| AgentStarted {
            devices: Vec::new(),
            resource_pool_name: name.to_string(),
        };
        handle.agent_started(pool("pool-a")).await.unwrap();

        let err = handle.agent_started(pool("pool-b")).await.unwrap_err();

        assert!(err.is_validation());
        assert_eq!(err.to_string(), "resource pool has changed: pool-a -> pool-b");
        let copy = handle.copy().await.unwrap();
        assert_eq!(copy.resource_pool_name(), "pool-a");
    }

    #[tokio::test]
    async fn reattach_keeps_only_recovered_containers() {
        let (handle, _task) = spawn_with(
            Arc::new(StateStore::open_in_memory().unwrap()),
            Arc::new(AllocationEventBus::new(8)),
        );
        handle.agent_started(started(2)).await.unwrap();
        handle.allocate(1, ContainerId::new("keep")).await.unwrap();
        handle.allocate(1, ContainerId::new("lost")).await.unwrap();

        let acks = vec![
            ContainerReattachAck::recovered(ContainerId::new("keep")),
            ContainerReattachAck::failed(ContainerId::new("lost"), "container gone"),
        ];
        assert!(handle.reattach(acks).await.unwrap());

        let copy = handle.copy().await.unwrap();
        assert_eq!(copy.container_ids(), vec![ContainerId::new("keep")]);
        assert_eq!(copy.num_used_slots(), 1);
    }

    #[tokio::test]
    async fn owner_restore_surfaces_store_errors() {
        let (handle, _task) = spawn_with(
            Arc::new(FailingStore),
            Arc::new(AllocationEventBus::new(8)),
        );
        handle.agent_started(started(1)).await.unwrap();
        handle.allocate(1, ContainerId::new("c1")).await.unwrap();

        let err = handle.restore_container_owners().await.unwrap_err();
        assert!(matches!(err, AgentError::State(_)));
    }

    #[tokio::test]
    async fn removed_agent_stops_its_processor() {
        let store = StateStore::open_in_memory().unwrap();
        let (handle, task) = spawn_with(
            Arc::new(store.clone()),
            Arc::new(AllocationEventBus::new(8)),
        );
        handle.agent_started(started(1)).await.unwrap();

        handle.remove().await.unwrap();
        task.await.unwrap();

        assert!(store.get_agent(&AgentId::new("agent-1")).unwrap().is_none());
        let err = handle.copy().await.unwrap_err();
        assert!(matches!(err, AgentError::ProcessorStopped(_)));
    }
}
