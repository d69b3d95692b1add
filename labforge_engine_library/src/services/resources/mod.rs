use labforge_library::utils::port::Port;
use serde::{Deserialize, Serialize};

pub mod allocator;

/// Relative CPU weight, in Docker `cpu_shares` units (1024 == one full core under contention)
pub type CpuShares = u64;
pub type MemSizeBytes = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Resources granted to a single lab container
pub struct ResourceLimits {
    pub cpu_shares: CpuShares,
    pub memory_bytes: MemSizeBytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A leased host port and resource grant, tied to one lab instance
pub struct Allocation {
    pub port: Port,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedResource {
    Cpu,
    Memory,
    Ports,
}
impl std::fmt::Display for ExhaustedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExhaustedResource::Cpu => write!(f, "cpu"),
            ExhaustedResource::Memory => write!(f, "memory"),
            ExhaustedResource::Ports => write!(f, "ports"),
        }
    }
}

#[derive(Debug)]
/// The host has no room for another lab right now; callers should try again later
pub struct CapacityExceededError {
    pub resource: ExhaustedResource,
    pub requested: u64,
    pub available: u64,
}
impl std::fmt::Display for CapacityExceededError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "No capacity for a new lab, {} exhausted (requested {}, available {})",
            self.resource, self.requested, self.available
        )
    }
}
impl std::error::Error for CapacityExceededError {}
