//! Slot enablement state machine.
//!
//! A slot's status is never stored directly; it is derived from four
//! independent flags. `device_added` records whether the slot is currently
//! part of the agent's allocation-visible device view and is only ever
//! changed by [`Slot::update_view`].

use agentrm_core::{ContainerId, Device};
use serde::Serialize;

/// Derived status of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Enabled,
    Disabled,
    Draining,
}

/// Enablement flags of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEnablement {
    device_added: bool,
    agent_enabled: bool,
    user_enabled: bool,
    draining: bool,
}

impl Default for SlotEnablement {
    fn default() -> Self {
        Self {
            device_added: false,
            agent_enabled: true,
            user_enabled: true,
            draining: false,
        }
    }
}

impl SlotEnablement {
    /// Rebuild flags persisted by an earlier incarnation.
    pub(crate) fn restore(
        device_added: bool,
        agent_enabled: bool,
        user_enabled: bool,
        draining: bool,
    ) -> Self {
        Self {
            device_added,
            agent_enabled,
            user_enabled,
            draining,
        }
    }

    pub fn enabled(&self) -> bool {
        self.agent_enabled && self.user_enabled
    }

    pub fn device_added(&self) -> bool {
        self.device_added
    }

    pub fn agent_enabled(&self) -> bool {
        self.agent_enabled
    }

    pub fn user_enabled(&self) -> bool {
        self.user_enabled
    }

    pub fn draining(&self) -> bool {
        self.draining
    }

    pub fn status(&self) -> SlotStatus {
        if self.draining {
            SlotStatus::Draining
        } else if self.enabled() {
            SlotStatus::Enabled
        } else {
            SlotStatus::Disabled
        }
    }
}

/// Outcome of running the transition function on a slot.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ViewChange {
    pub added: bool,
    pub removed: bool,
    /// Occupant that must be force-released.
    pub evicted: Option<ContainerId>,
}

/// Runtime record of one device on an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    device: Device,
    enablement: SlotEnablement,
    occupant: Option<ContainerId>,
}

impl Slot {
    /// A newly reported slot, not yet in the device view.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            enablement: SlotEnablement::default(),
            occupant: None,
        }
    }

    pub(crate) fn restore(
        device: Device,
        enablement: SlotEnablement,
        occupant: Option<ContainerId>,
    ) -> Self {
        Self {
            device,
            enablement,
            occupant,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn enablement(&self) -> &SlotEnablement {
        &self.enablement
    }

    pub fn occupant(&self) -> Option<&ContainerId> {
        self.occupant.as_ref()
    }

    pub fn is_occupied_by(&self, container_id: &ContainerId) -> bool {
        self.occupant.as_ref() == Some(container_id)
    }

    /// Visible, enabled, not draining and unoccupied.
    pub fn is_free(&self) -> bool {
        self.enablement.device_added
            && self.enablement.enabled()
            && !self.enablement.draining
            && self.occupant.is_none()
    }

    pub(crate) fn set_occupant(&mut self, occupant: Option<ContainerId>) {
        self.occupant = occupant;
    }

    pub(crate) fn set_agent_enabled(&mut self, enabled: bool) {
        self.enablement.agent_enabled = enabled;
    }

    pub(crate) fn set_user_enabled(&mut self, enabled: bool) {
        self.enablement.user_enabled = enabled;
    }

    pub(crate) fn set_draining(&mut self, draining: bool) {
        self.enablement.draining = draining;
    }

    /// The transition function: reconcile view membership with the flags.
    ///
    /// Becoming enabled adds the device to the view. Becoming disabled
    /// outside a drain removes it and evicts any occupant, even when the
    /// device had already left the view. A drain leaves both untouched.
    pub(crate) fn update_view(&mut self) -> ViewChange {
        let mut change = ViewChange::default();
        let flags = &mut self.enablement;

        if flags.enabled() && !flags.device_added {
            flags.device_added = true;
            change.added = true;
        } else if !flags.enabled() && !flags.draining {
            if flags.device_added {
                flags.device_added = false;
                change.removed = true;
            }
            change.evicted = self.occupant.clone();
        }

        change
    }
}
