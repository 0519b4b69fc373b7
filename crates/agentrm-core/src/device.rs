//! Compute devices reported by agents.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-agent device index, as reported by the agent.
pub type DeviceId = u32;

/// Kind of compute unit behind a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Cpu,
    Cuda,
    Rocm,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Cuda => "cuda",
            DeviceType::Rocm => "rocm",
        };
        f.write_str(s)
    }
}

/// One physical compute unit on an agent.
///
/// Devices are immutable once reported: a reconnecting agent whose
/// inventory differs in any field must be restarted, not reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceType,
    /// Vendor model string (e.g. "Tesla T4").
    pub brand: String,
    /// Hardware UUID, empty for CPUs.
    #[serde(default)]
    pub uuid: String,
}

impl Device {
    pub fn new(id: DeviceId, kind: DeviceType, brand: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            brand: brand.into(),
            uuid: String::new(),
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} ({})", self.kind, self.id, self.brand)
    }
}
