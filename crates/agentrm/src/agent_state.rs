//! AgentState — the per-agent aggregate.
//!
//! Owns every slot of one agent, its zero-slot capacity and the containers
//! running on it. The aggregate performs no I/O: operations mutate in place
//! and hand back the force-release requests their transitions produced.
//! Persisting and publishing are the owning processor's job.
//!
//! The allocation-visible device view is not stored. It is derived from
//! the slots whose `device_added` flag is set, and that flag only moves
//! through [`Slot::update_view`], so the view cannot drift from the slots.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info, warn};
use uuid::Uuid;

use agentrm_core::{
    AgentId, AgentStarted, AllocationId, Container, ContainerId, ContainerStateChanged, Device,
    DeviceId, StartTaskContainer,
};
use agentrm_state::{AgentSnapshot, ContainerSnapshot, SlotSnapshot};

use crate::bus::ReleaseResources;
use crate::error::{AgentError, AgentResult};
use crate::slot::{Slot, SlotEnablement};
use crate::summary::{AgentSummary, SlotSummary, SlotsSummary};

/// Administrative change to one or all slots. `None` leaves a flag as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub enabled: Option<bool>,
    pub drain: Option<bool>,
}

/// Scheduler-side state of one agent.
///
/// `Clone` is the deep copy handed to cross-agent scheduling; see
/// [`AgentState::deep_copy`].
#[derive(Debug, Clone)]
pub struct AgentState {
    id: AgentId,
    instance_uuid: Uuid,
    resource_pool_name: String,
    started: bool,
    enabled: bool,
    draining: bool,
    max_zero_slot_containers: usize,
    slots: BTreeMap<DeviceId, Slot>,
    containers: HashMap<ContainerId, Container>,
    container_owners: HashMap<ContainerId, AllocationId>,
}

impl AgentState {
    /// An enabled agent with no slots yet.
    pub fn new(
        id: AgentId,
        resource_pool_name: impl Into<String>,
        max_zero_slot_containers: usize,
    ) -> Self {
        Self {
            id,
            instance_uuid: Uuid::new_v4(),
            resource_pool_name: resource_pool_name.into(),
            started: false,
            enabled: true,
            draining: false,
            max_zero_slot_containers,
            slots: BTreeMap::new(),
            containers: HashMap::new(),
            container_owners: HashMap::new(),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    pub fn resource_pool_name(&self) -> &str {
        &self.resource_pool_name
    }

    /// Whether the agent has registered an inventory; later starts are reconnects.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn has_slots(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn slot(&self, device_id: DeviceId) -> Option<&Slot> {
        self.slots.get(&device_id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    pub fn container(&self, container_id: &ContainerId) -> Option<&Container> {
        self.containers.get(container_id)
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    /// Tracked container IDs, sorted.
    pub fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self.containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn container_owner(&self, container_id: &ContainerId) -> Option<&AllocationId> {
        self.container_owners.get(container_id)
    }

    /// Devices currently visible to allocation, with their occupant.
    pub fn device_view(&self) -> impl Iterator<Item = (&Device, Option<&ContainerId>)> {
        self.slots
            .values()
            .filter(|slot| slot.enablement().device_added())
            .map(|slot| (slot.device(), slot.occupant()))
    }

    // ── Capacity ───────────────────────────────────────────────────

    /// Total slots: only the used ones while draining, none when disabled.
    ///
    /// Otherwise a visible slot counts when it is occupied or free to
    /// allocate, so a drained idle slot adds nothing and
    /// `num_empty_slots` equals what `allocate` can claim.
    pub fn num_slots(&self) -> usize {
        if self.draining {
            self.num_used_slots()
        } else if !self.enabled {
            0
        } else {
            self.slots
                .values()
                .filter(|slot| slot.enablement().device_added())
                .filter(|slot| slot.occupant().is_some() || slot.is_free())
                .count()
        }
    }

    /// Slots that have been allocated to containers.
    pub fn num_used_slots(&self) -> usize {
        self.device_view()
            .filter(|(_, occupant)| occupant.is_some())
            .count()
    }

    /// Slots that have not been allocated to containers.
    pub fn num_empty_slots(&self) -> usize {
        if self.draining || !self.enabled {
            0
        } else {
            self.num_slots().saturating_sub(self.num_used_slots())
        }
    }

    pub fn num_zero_slots(&self) -> usize {
        if self.draining {
            self.num_used_zero_slots()
        } else if !self.enabled {
            0
        } else {
            self.max_zero_slot_containers
        }
    }

    pub fn num_used_zero_slots(&self) -> usize {
        self.containers.values().filter(|c| c.is_zero_slot()).count()
    }

    pub fn num_empty_zero_slots(&self) -> usize {
        if self.draining || !self.enabled {
            0
        } else {
            self.num_zero_slots().saturating_sub(self.num_used_zero_slots())
        }
    }

    /// No occupied visible slot and no zero-slot container.
    ///
    /// A container evicted from a disabled slot keeps the slot's occupant
    /// until it terminates but no longer counts here.
    pub fn idle(&self) -> bool {
        self.num_used_slots() == 0 && self.num_used_zero_slots() == 0
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Register a container and claim `slots` free devices for it.
    ///
    /// The container record is registered even when the claim fails;
    /// devices are claimed all at once or not at all.
    pub fn allocate(&mut self, slots: usize, container_id: &ContainerId) -> AgentResult<Vec<Device>> {
        self.containers
            .insert(container_id.clone(), Container::new(container_id.clone()));
        if slots == 0 {
            return Ok(Vec::new());
        }

        let chosen: Vec<DeviceId> = self
            .slots
            .values()
            .filter(|slot| slot.is_free())
            .take(slots)
            .map(|slot| slot.device().id)
            .collect();
        if chosen.len() < slots {
            return Err(AgentError::InsufficientDevices {
                requested: slots,
                free: chosen.len(),
            });
        }

        let mut devices = Vec::with_capacity(slots);
        for device_id in chosen {
            if let Some(slot) = self.slots.get_mut(&device_id) {
                slot.set_occupant(Some(container_id.clone()));
                devices.push(slot.device().clone());
            }
        }
        if let Some(container) = self.containers.get_mut(container_id) {
            container.devices = devices.clone();
        }

        debug!(agent_id = %self.id, %container_id, slots, "devices allocated");
        Ok(devices)
    }

    /// Forget a container and free its devices. Returns whether anything changed.
    pub fn deallocate(&mut self, container_id: &ContainerId) -> bool {
        let mut changed = self.containers.remove(container_id).is_some();
        self.container_owners.remove(container_id);
        for slot in self.slots.values_mut() {
            if slot.is_occupied_by(container_id) {
                slot.set_occupant(None);
                changed = true;
            }
        }
        if changed {
            debug!(agent_id = %self.id, %container_id, "container deallocated");
        }
        changed
    }

    /// Point-in-time copy for cross-agent scheduling.
    ///
    /// Decisions made against a copy are provisional: the owning processor
    /// revalidates them when they are committed, and a copy that has gone
    /// stale surfaces as a retryable capacity error.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    // ── Administrative state ───────────────────────────────────────

    /// Enable the agent and end any drain on its slots.
    pub fn enable(&mut self) -> Vec<ReleaseResources> {
        info!(agent_id = %self.id, "enabling agent");
        self.enabled = true;
        self.draining = false;
        self.update_all_slots(|slot| {
            slot.set_agent_enabled(true);
            slot.set_draining(false);
        })
    }

    /// Disable the agent, or drain it when `drain` is set.
    pub fn disable(&mut self, drain: bool) -> Vec<ReleaseResources> {
        if drain {
            info!(agent_id = %self.id, "draining agent");
        } else {
            info!(agent_id = %self.id, "disabling agent");
        }
        self.enabled = false;
        self.draining = drain;
        self.update_all_slots(|slot| {
            slot.set_agent_enabled(false);
            slot.set_draining(drain);
        })
    }

    /// Apply an operator patch to one slot.
    pub fn patch_slot(
        &mut self,
        device_id: DeviceId,
        patch: SlotPatch,
    ) -> AgentResult<(SlotSummary, Vec<ReleaseResources>)> {
        let slot = self
            .slots
            .get_mut(&device_id)
            .ok_or_else(|| AgentError::UnknownSlot {
                device: device_id,
                agent_id: self.id.clone(),
            })?;
        apply_patch(slot, patch);

        let releases = self.update_device_view(device_id).into_iter().collect();
        let summary = self
            .slot_summary(device_id)
            .ok_or_else(|| AgentError::UnknownSlot {
                device: device_id,
                agent_id: self.id.clone(),
            })?;
        Ok((summary, releases))
    }

    /// Apply an operator patch to every slot.
    pub fn patch_all_slots(&mut self, patch: SlotPatch) -> (SlotsSummary, Vec<ReleaseResources>) {
        let releases = self.update_all_slots(|slot| apply_patch(slot, patch));
        let summary = self
            .slots
            .keys()
            .filter_map(|id| self.slot_summary(*id))
            .map(|summary| (summary.id.clone(), summary))
            .collect();
        (summary, releases)
    }

    fn update_all_slots(&mut self, mut change: impl FnMut(&mut Slot)) -> Vec<ReleaseResources> {
        let ids: Vec<DeviceId> = self.slots.keys().copied().collect();
        let mut seen = HashSet::new();
        let mut releases = Vec::new();
        for id in ids {
            if let Some(slot) = self.slots.get_mut(&id) {
                change(slot);
            }
            // A container spanning several slots is released once.
            if let Some(release) = self.update_device_view(id) {
                if seen.insert(release.allocation_id.clone()) {
                    releases.push(release);
                }
            }
        }
        releases
    }

    /// Run the slot transition and translate an eviction into a release.
    fn update_device_view(&mut self, device_id: DeviceId) -> Option<ReleaseResources> {
        let Some(slot) = self.slots.get_mut(&device_id) else {
            warn!(agent_id = %self.id, device = device_id, "update device view: slot not found");
            return None;
        };
        let change = slot.update_view();
        if change.added {
            info!(agent_id = %self.id, device = %slot.device(), "adding device");
        }
        if change.removed {
            info!(agent_id = %self.id, device = %slot.device(), "removing device");
        }

        let evicted = change.evicted?;
        match self.container_owners.get(&evicted) {
            Some(allocation_id) => Some(ReleaseResources::slot_disabled(allocation_id.clone())),
            None => {
                warn!(
                    agent_id = %self.id,
                    container_id = %evicted,
                    "slot disabled under container with no known allocation"
                );
                None
            }
        }
    }

    // ── Transport events ───────────────────────────────────────────

    /// Register the slots of a freshly reported device inventory.
    pub fn agent_started(&mut self, msg: &AgentStarted) {
        self.started = true;
        if !msg.resource_pool_name.is_empty() {
            self.resource_pool_name = msg.resource_pool_name.clone();
        }
        for device in &msg.devices {
            let mut slot = Slot::new(device.clone());
            slot.set_agent_enabled(self.enabled);
            slot.set_draining(self.draining);
            self.slots.insert(device.id, slot);
            self.update_device_view(device.id);
        }
        info!(
            agent_id = %self.id,
            devices = msg.devices.len(),
            resource_pool = %self.resource_pool_name,
            "agent started"
        );
    }

    /// Reject a reconnect whose device inventory differs from the known one.
    pub fn validate_device_inventory(&self, msg: &AgentStarted) -> AgentResult<()> {
        if self.slots.len() != msg.devices.len() {
            return Err(AgentError::DeviceCountChanged {
                known: self.slots.len(),
                reported: msg.devices.len(),
            });
        }
        let reported: HashMap<DeviceId, &Device> =
            msg.devices.iter().map(|d| (d.id, d)).collect();
        for (id, slot) in &self.slots {
            match reported.get(id) {
                Some(device) if *device == slot.device() => {}
                other => {
                    return Err(AgentError::DeviceChanged {
                        known: slot.device().clone(),
                        reported: other.map(|d| (*d).clone()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Reject a reconnect reporting a different resource pool.
    pub fn validate_resource_pool(&self, msg: &AgentStarted) -> AgentResult<()> {
        if self.resource_pool_name != msg.resource_pool_name {
            return Err(AgentError::ResourcePoolChanged {
                known: self.resource_pool_name.clone(),
                reported: msg.resource_pool_name.clone(),
            });
        }
        Ok(())
    }

    /// Track a container lifecycle update reported by the agent.
    pub fn container_state_changed(&mut self, msg: &ContainerStateChanged) {
        let container = &msg.container;
        for device in &container.devices {
            let Some(slot) = self.slots.get_mut(&device.id) else {
                warn!(
                    agent_id = %self.id,
                    device = device.id,
                    container_id = %container.id,
                    "container state changed on unknown device"
                );
                continue;
            };
            if container.is_terminated() {
                if slot.is_occupied_by(&container.id) {
                    slot.set_occupant(None);
                }
            } else {
                slot.set_occupant(Some(container.id.clone()));
            }
        }

        if container.is_terminated() {
            self.containers.remove(&container.id);
            self.container_owners.remove(&container.id);
        } else {
            self.containers.insert(container.id.clone(), container.clone());
        }
        debug!(
            agent_id = %self.id,
            container_id = %container.id,
            state = ?container.state,
            "container state changed"
        );
    }

    /// Claim the devices of a container placed by the scheduler.
    ///
    /// Every device must have an enabled slot that is free or already held
    /// by this same container; otherwise nothing is claimed.
    pub fn start_container(&mut self, msg: &StartTaskContainer) -> AgentResult<()> {
        let container = &msg.container;
        let mut seen = HashSet::new();
        for device in &container.devices {
            self.check_startable(device.id, &container.id, &mut seen)
                .map_err(|source| AgentError::StartContainer {
                    device: device.id,
                    agent_id: self.id.clone(),
                    source: Box::new(source),
                })?;
        }

        for device in &container.devices {
            if let Some(slot) = self.slots.get_mut(&device.id) {
                slot.set_occupant(Some(container.id.clone()));
            }
        }
        self.containers
            .insert(container.id.clone(), container.clone());
        self.container_owners
            .insert(container.id.clone(), msg.allocation_id.clone());

        debug!(
            agent_id = %self.id,
            container_id = %container.id,
            allocation_id = %msg.allocation_id,
            devices = container.devices.len(),
            "container started"
        );
        Ok(())
    }

    fn check_startable(
        &self,
        device_id: DeviceId,
        container_id: &ContainerId,
        seen: &mut HashSet<DeviceId>,
    ) -> AgentResult<()> {
        let slot = self.slots.get(&device_id).ok_or(AgentError::SlotNotFound)?;
        if !slot.enablement().enabled() {
            return Err(AgentError::SlotNotEnabled);
        }
        let taken_by_other = slot.occupant().is_some_and(|c| c != container_id);
        if taken_by_other || !seen.insert(device_id) {
            return Err(AgentError::SlotOccupied);
        }
        Ok(())
    }

    // ── Summaries ──────────────────────────────────────────────────

    pub fn slot_summary(&self, device_id: DeviceId) -> Option<SlotSummary> {
        let slot = self.slots.get(&device_id)?;
        let container = slot
            .occupant()
            .and_then(|id| self.containers.get(id))
            .cloned();
        Some(SlotSummary {
            id: device_id.to_string(),
            device: slot.device().clone(),
            enabled: slot.enablement().enabled(),
            draining: slot.enablement().draining(),
            container,
        })
    }

    /// Summaries of all slots keyed `{base_address}/slots/{id}`.
    pub fn slots_summary(&self, base_address: &str) -> SlotsSummary {
        self.slots
            .keys()
            .filter_map(|id| {
                self.slot_summary(*id)
                    .map(|summary| (format!("{base_address}/slots/{id}"), summary))
            })
            .collect()
    }

    pub fn summary(&self, base_address: &str) -> AgentSummary {
        AgentSummary {
            agent_id: self.id.clone(),
            resource_pool_name: self.resource_pool_name.clone(),
            enabled: self.enabled,
            draining: self.draining,
            num_slots: self.num_slots(),
            num_used_slots: self.num_used_slots(),
            num_empty_slots: self.num_empty_slots(),
            num_zero_slots: self.num_zero_slots(),
            num_used_zero_slots: self.num_used_zero_slots(),
            num_containers: self.containers.len(),
            slots: self.slots_summary(base_address),
        }
    }

    // ── Snapshots & recovery ───────────────────────────────────────

    pub fn snapshot(&self) -> AgentSnapshot {
        let slots = self
            .slots
            .values()
            .map(|slot| {
                let flags = slot.enablement();
                SlotSnapshot {
                    device: slot.device().clone(),
                    device_added: flags.device_added(),
                    agent_enabled: flags.agent_enabled(),
                    user_enabled: flags.user_enabled(),
                    draining: flags.draining(),
                    container_id: slot.occupant().cloned(),
                }
            })
            .collect();

        AgentSnapshot {
            agent_id: self.id.clone(),
            instance_uuid: self.instance_uuid,
            resource_pool_name: self.resource_pool_name.clone(),
            started: self.started,
            enabled: self.enabled,
            draining: self.draining,
            max_zero_slot_containers: self.max_zero_slot_containers,
            slots,
            containers: self.container_ids(),
        }
    }

    /// The durable row of a tracked container.
    pub fn container_snapshot(&self, container_id: &ContainerId) -> Option<ContainerSnapshot> {
        let container = self.containers.get(container_id)?;
        let row = ContainerSnapshot::from_container(container);
        Some(match self.container_owners.get(container_id) {
            Some(allocation_id) => row.with_allocation(allocation_id.clone()),
            None => row,
        })
    }

    /// Rebuild an agent from its snapshot and the rows of its containers.
    ///
    /// The container → allocation map starts empty; see
    /// [`AgentState::restore_container_owners`].
    pub fn from_snapshot(
        snapshot: AgentSnapshot,
        container_rows: Vec<ContainerSnapshot>,
    ) -> AgentResult<Self> {
        let mut slots = BTreeMap::new();
        for s in snapshot.slots {
            let id = s.device.id;
            let enablement =
                SlotEnablement::restore(s.device_added, s.agent_enabled, s.user_enabled, s.draining);
            if slots
                .insert(id, Slot::restore(s.device, enablement, s.container_id))
                .is_some()
            {
                return Err(AgentError::InvalidSnapshot {
                    agent_id: snapshot.agent_id,
                    reason: format!("duplicate slot for device {id}"),
                });
            }
        }

        let mut rows: HashMap<ContainerId, ContainerSnapshot> = container_rows
            .into_iter()
            .map(|row| (row.container_id.clone(), row))
            .collect();
        let mut containers = HashMap::with_capacity(snapshot.containers.len());
        for id in snapshot.containers {
            let container = match rows.remove(&id) {
                Some(row) => row.to_container(),
                None => {
                    warn!(
                        agent_id = %snapshot.agent_id,
                        container_id = %id,
                        "container row missing, rebuilding from slots"
                    );
                    let devices = slots
                        .values()
                        .filter(|slot: &&Slot| slot.is_occupied_by(&id))
                        .map(|slot| slot.device().clone())
                        .collect();
                    Container::new(id.clone()).with_devices(devices)
                }
            };
            containers.insert(id, container);
        }

        Ok(Self {
            id: snapshot.agent_id,
            instance_uuid: snapshot.instance_uuid,
            resource_pool_name: snapshot.resource_pool_name,
            started: snapshot.started || !slots.is_empty(),
            enabled: snapshot.enabled,
            draining: snapshot.draining,
            max_zero_slot_containers: snapshot.max_zero_slot_containers,
            slots,
            containers,
            container_owners: HashMap::new(),
        })
    }

    /// Install the container → allocation map loaded after a restart.
    ///
    /// Entries for containers this agent does not track are ignored.
    /// Returns the number of mappings installed.
    pub fn restore_container_owners(&mut self, owners: HashMap<ContainerId, AllocationId>) -> usize {
        self.container_owners = owners
            .into_iter()
            .filter(|(id, _)| self.containers.contains_key(id))
            .collect();
        debug!(
            agent_id = %self.id,
            restored = self.container_owners.len(),
            tracked = self.containers.len(),
            "restored container to allocation mappings"
        );
        self.container_owners.len()
    }

    /// Drop every occupant, container and owner not in `recovered`.
    ///
    /// Returns whether anything was cleared.
    pub fn clear_unless_recovered(&mut self, recovered: &HashSet<ContainerId>) -> bool {
        let mut updated = false;
        for slot in self.slots.values_mut() {
            let stale = slot.occupant().is_some_and(|id| !recovered.contains(id));
            if stale {
                slot.set_occupant(None);
                updated = true;
            }
        }

        let before = self.containers.len();
        self.containers.retain(|id, _| recovered.contains(id));
        updated |= self.containers.len() != before;

        let before = self.container_owners.len();
        self.container_owners.retain(|id, _| recovered.contains(id));
        updated |= self.container_owners.len() != before;

        if updated {
            info!(
                agent_id = %self.id,
                recovered = recovered.len(),
                remaining = self.containers.len(),
                "cleared containers lost during restart"
            );
        }
        updated
    }
}

fn apply_patch(slot: &mut Slot, patch: SlotPatch) {
    if let Some(enabled) = patch.enabled {
        slot.set_user_enabled(enabled);
    }
    if let Some(drain) = patch.drain {
        slot.set_draining(drain);
    }
}
