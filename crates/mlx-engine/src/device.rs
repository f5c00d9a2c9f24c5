//! Devices, streams and process groups.
//!
//! All three are small immutable value types compared by content.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of compute target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cpu" => Some(DeviceKind::Cpu),
            "gpu" => Some(DeviceKind::Gpu),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A (kind, index) pair naming a compute target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub index: usize,
}

impl Device {
    pub const fn new(kind: DeviceKind, index: usize) -> Self {
        Self { kind, index }
    }

    pub const fn cpu() -> Self {
        Self::new(DeviceKind::Cpu, 0)
    }

    pub const fn gpu() -> Self {
        Self::new(DeviceKind::Gpu, 0)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({}, {})", self.kind, self.index)
    }
}

/// An ordered execution queue on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub index: usize,
    pub device: Device,
}

impl Stream {
    pub const fn new(index: usize, device: Device) -> Self {
        Self { index, device }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stream({}, {})", self.device, self.index)
    }
}

/// A distributed process group.
///
/// `id` distinguishes groups produced by successive splits so that two
/// groups with the same rank and size are not confused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Group {
    pub id: u64,
    pub rank: usize,
    pub size: usize,
    pub backend: String,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Group(rank={}, size={}, backend={})",
            self.rank, self.size, self.backend
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_equality() {
        assert_eq!(Device::cpu(), Device::new(DeviceKind::Cpu, 0));
        assert_ne!(Device::cpu(), Device::gpu());
        assert_eq!(DeviceKind::from_name("gpu"), Some(DeviceKind::Gpu));
        assert_eq!(DeviceKind::from_name("tpu"), None);
    }

    #[test]
    fn test_stream_display() {
        let s = Stream::new(3, Device::cpu());
        assert_eq!(s.to_string(), "Stream(Device(cpu, 0), 3)");
    }
}
