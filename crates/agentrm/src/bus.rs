//! Allocation-event bus.
//!
//! Agents publish force-release requests here when disabling a slot evicts
//! its occupant. Publication is fire-and-forget: the agent never waits for
//! the release to happen, and a bus without subscribers drops the event.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use agentrm_core::AllocationId;

/// Reason attached to releases triggered by slot disablement.
pub const SLOT_DISABLED: &str = "slot disabled";

/// Request that an allocation give up its resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResources {
    pub allocation_id: AllocationId,
    pub reason: String,
    pub force_kill: bool,
}

impl ReleaseResources {
    pub fn slot_disabled(allocation_id: AllocationId) -> Self {
        Self {
            allocation_id,
            reason: SLOT_DISABLED.to_string(),
            force_kill: true,
        }
    }
}

/// Sink for release requests.
pub trait ReleasePublisher: Send + Sync {
    fn publish(&self, release: ReleaseResources);
}

/// Broadcast-backed bus; every subscriber sees every release.
#[derive(Clone)]
pub struct AllocationEventBus {
    tx: broadcast::Sender<ReleaseResources>,
}

impl AllocationEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReleaseResources> {
        self.tx.subscribe()
    }
}

impl ReleasePublisher for AllocationEventBus {
    fn publish(&self, release: ReleaseResources) {
        let allocation_id = release.allocation_id.clone();
        match self.tx.send(release) {
            Ok(receivers) => debug!(%allocation_id, receivers, "release published"),
            Err(_) => debug!(%allocation_id, "release dropped, no subscribers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_releases() {
        let bus = AllocationEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ReleaseResources::slot_disabled(AllocationId::new("alloc-1")));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.allocation_id, AllocationId::new("alloc-1"));
        assert_eq!(got.reason, SLOT_DISABLED);
        assert!(got.force_kill);
    }

    #[test]
    fn publishing_without_subscribers_does_not_fail() {
        let bus = AllocationEventBus::new(0);
        bus.publish(ReleaseResources::slot_disabled(AllocationId::new("alloc-1")));
    }
}
