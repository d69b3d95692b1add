use super::{Allocation, CapacityExceededError, CpuShares, ExhaustedResource, MemSizeBytes, ResourceLimits};
use crate::engine_api::engine_config::CapacityConfig;
use anyhow::Result;
use labforge_library::{bail_error, bail_typed, transaction::TransactionId, utils::port::Port};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatorStats {
    pub cpu_shares_used: CpuShares,
    pub cpu_shares_total: CpuShares,
    pub memory_bytes_used: MemSizeBytes,
    pub memory_bytes_total: MemSizeBytes,
    pub ports_leased: usize,
    pub ports_free: usize,
}

struct AllocatorState {
    cpu_used: CpuShares,
    mem_used: MemSizeBytes,
    free_ports: BTreeSet<Port>,
    leased: HashMap<Port, ResourceLimits>,
}

/// Tracks host capacity and hands out [Allocation]s.
/// Every check-and-update happens under a single lock, so reservations are linearizable.
pub struct ResourceAllocator {
    config: Arc<CapacityConfig>,
    state: Mutex<AllocatorState>,
}

impl ResourceAllocator {
    pub fn boxed(config: Arc<CapacityConfig>, tid: &TransactionId) -> Result<Arc<Self>> {
        if config.port_range_start == 0 || config.port_range_start > config.port_range_end {
            bail_error!(tid=tid, start=config.port_range_start, end=config.port_range_end, "Invalid lab port range");
        }
        if config.cpu_shares == 0 || config.memory_bytes == 0 {
            bail_error!(tid=tid, cpu=config.cpu_shares, memory=config.memory_bytes, "Host capacity must be non-zero");
        }
        let free_ports = (config.port_range_start..=config.port_range_end).collect();
        Ok(Arc::new(ResourceAllocator {
            config,
            state: Mutex::new(AllocatorState {
                cpu_used: 0,
                mem_used: 0,
                free_ports,
                leased: HashMap::new(),
            }),
        }))
    }

    fn check_fits(&self, state: &AllocatorState, limits: &ResourceLimits, tid: &TransactionId) -> Result<()> {
        let cpu_avail = self.config.cpu_shares.saturating_sub(state.cpu_used);
        if limits.cpu_shares > cpu_avail {
            bail_typed!(
                CapacityExceededError {
                    resource: ExhaustedResource::Cpu,
                    requested: limits.cpu_shares,
                    available: cpu_avail,
                },
                tid = tid,
                requested = limits.cpu_shares,
                available = cpu_avail,
                "Not enough CPU shares for lab"
            );
        }
        let mem_avail = self.config.memory_bytes.saturating_sub(state.mem_used);
        if limits.memory_bytes > mem_avail {
            bail_typed!(
                CapacityExceededError {
                    resource: ExhaustedResource::Memory,
                    requested: limits.memory_bytes,
                    available: mem_avail,
                },
                tid = tid,
                requested = limits.memory_bytes,
                available = mem_avail,
                "Not enough memory for lab"
            );
        }
        Ok(())
    }

    /// Reserve resources and the lowest free port.
    ///
    /// # Errors
    /// [CapacityExceededError] naming the exhausted dimension. Nothing is reserved on error.
    pub fn reserve(&self, limits: ResourceLimits, tid: &TransactionId) -> Result<Allocation> {
        let mut state = self.state.lock();
        self.check_fits(&state, &limits, tid)?;
        let port = match state.free_ports.pop_first() {
            Some(p) => p,
            None => bail_typed!(
                CapacityExceededError {
                    resource: ExhaustedResource::Ports,
                    requested: 1,
                    available: 0,
                },
                tid = tid,
                leased = state.leased.len(),
                "No free lab ports"
            ),
        };
        state.cpu_used += limits.cpu_shares;
        state.mem_used += limits.memory_bytes;
        state.leased.insert(port, limits);
        debug!(tid=tid, port=port, cpu=limits.cpu_shares, memory=limits.memory_bytes, "Reserved allocation");
        Ok(Allocation { port, limits })
    }

    /// Return an allocation to the pool.
    /// Releasing a port that is not leased is a logged no-op, so double releases never over-credit.
    pub fn release(&self, allocation: &Allocation, tid: &TransactionId) {
        let mut state = self.state.lock();
        match state.leased.remove(&allocation.port) {
            Some(leased) => {
                if leased != allocation.limits {
                    warn!(tid=tid, port=allocation.port, leased=?leased, given=?allocation.limits, "Released limits differ from leased limits, crediting leased amount");
                }
                state.cpu_used = state.cpu_used.saturating_sub(leased.cpu_shares);
                state.mem_used = state.mem_used.saturating_sub(leased.memory_bytes);
                state.free_ports.insert(allocation.port);
                debug!(tid = tid, port = allocation.port, "Released allocation");
            },
            None => warn!(tid = tid, port = allocation.port, "Release of allocation that is not leased"),
        }
    }

    /// Re-lease a specific allocation, used when restoring persisted instances after a restart.
    pub fn restore(&self, allocation: &Allocation, tid: &TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.free_ports.contains(&allocation.port) {
            bail_error!(tid=tid, port=allocation.port, "Cannot restore allocation, port is leased or outside the configured range");
        }
        self.check_fits(&state, &allocation.limits, tid)?;
        state.free_ports.remove(&allocation.port);
        state.cpu_used += allocation.limits.cpu_shares;
        state.mem_used += allocation.limits.memory_bytes;
        state.leased.insert(allocation.port, allocation.limits);
        Ok(())
    }

    pub fn is_leased(&self, port: Port) -> bool {
        self.state.lock().leased.contains_key(&port)
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            cpu_shares_used: state.cpu_used,
            cpu_shares_total: self.config.cpu_shares,
            memory_bytes_used: state.mem_used,
            memory_bytes_total: self.config.memory_bytes,
            ports_leased: state.leased.len(),
            ports_free: state.free_ports.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labforge_library::transaction::TEST_TID;
    use std::collections::HashSet;

    fn svc(cpu: CpuShares, mem: MemSizeBytes, start: Port, end: Port) -> Arc<ResourceAllocator> {
        ResourceAllocator::boxed(
            Arc::new(CapacityConfig {
                cpu_shares: cpu,
                memory_bytes: mem,
                port_range_start: start,
                port_range_end: end,
            }),
            &TEST_TID,
        )
        .unwrap_or_else(|e| panic!("Failed to create allocator: {}", e))
    }

    fn limits(cpu: CpuShares, mem: MemSizeBytes) -> ResourceLimits {
        ResourceLimits {
            cpu_shares: cpu,
            memory_bytes: mem,
        }
    }

    fn exhausted(r: Result<Allocation>) -> ExhaustedResource {
        match r {
            Ok(a) => panic!("Reservation should have failed, got {:?}", a),
            Err(e) => match e.downcast_ref::<CapacityExceededError>() {
                Some(c) => c.resource,
                None => panic!("Wrong error type: {}", e),
            },
        }
    }

    #[test]
    fn lowest_port_first() {
        let a = svc(4096, 4096, 20000, 20010);
        assert_eq!(a.reserve(limits(1, 1), &TEST_TID).unwrap().port, 20000);
        assert_eq!(a.reserve(limits(1, 1), &TEST_TID).unwrap().port, 20001);
    }

    #[test]
    fn port_exhaustion() {
        let a = svc(4096, 4096, 20000, 20001);
        a.reserve(limits(1, 1), &TEST_TID).unwrap();
        a.reserve(limits(1, 1), &TEST_TID).unwrap();
        assert_eq!(exhausted(a.reserve(limits(1, 1), &TEST_TID)), ExhaustedResource::Ports);
    }

    #[test]
    fn cpu_exhaustion_reserves_nothing() {
        let a = svc(1024, 4096, 20000, 20010);
        a.reserve(limits(1000, 1), &TEST_TID).unwrap();
        let before = a.stats();
        assert_eq!(exhausted(a.reserve(limits(100, 1), &TEST_TID)), ExhaustedResource::Cpu);
        assert_eq!(before, a.stats());
    }

    #[test]
    fn memory_exhaustion() {
        let a = svc(4096, 1000, 20000, 20010);
        assert_eq!(exhausted(a.reserve(limits(1, 1001), &TEST_TID)), ExhaustedResource::Memory);
    }

    #[test]
    fn double_release_does_not_over_credit() {
        let a = svc(1024, 1024, 20000, 20010);
        let alloc = a.reserve(limits(512, 512), &TEST_TID).unwrap();
        a.release(&alloc, &TEST_TID);
        a.release(&alloc, &TEST_TID);
        let stats = a.stats();
        assert_eq!(stats.cpu_shares_used, 0);
        assert_eq!(stats.memory_bytes_used, 0);
        assert_eq!(stats.ports_free, 11);
        assert_eq!(stats.ports_leased, 0);
    }

    #[test]
    fn released_port_is_reused() {
        let a = svc(4096, 4096, 20000, 20000);
        let alloc = a.reserve(limits(1, 1), &TEST_TID).unwrap();
        a.release(&alloc, &TEST_TID);
        assert_eq!(a.reserve(limits(1, 1), &TEST_TID).unwrap().port, 20000);
    }

    #[test]
    fn restore_leases_specific_port() {
        let a = svc(4096, 4096, 20000, 20010);
        let alloc = Allocation {
            port: 20005,
            limits: limits(10, 10),
        };
        a.restore(&alloc, &TEST_TID).unwrap();
        assert!(a.is_leased(20005));
        assert!(a.restore(&alloc, &TEST_TID).is_err());
        let out_of_range = Allocation {
            port: 30000,
            limits: limits(10, 10),
        };
        assert!(a.restore(&out_of_range, &TEST_TID).is_err());
    }

    #[test]
    fn invalid_range_rejected() {
        let r = ResourceAllocator::boxed(
            Arc::new(CapacityConfig {
                cpu_shares: 1,
                memory_bytes: 1,
                port_range_start: 100,
                port_range_end: 99,
            }),
            &TEST_TID,
        );
        assert!(r.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_exceed_capacity() {
        let a = svc(1024 * 8, 1 << 30, 20000, 20063);
        let mut handles = vec![];
        for _ in 0..16 {
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                let mut got = vec![];
                for _ in 0..8 {
                    if let Ok(alloc) = a.reserve(limits(256, 1 << 20), &TEST_TID) {
                        got.push(alloc);
                    }
                }
                got
            }));
        }
        let mut ports = HashSet::new();
        let mut cpu = 0;
        for h in handles {
            for alloc in h.await.unwrap() {
                assert!(ports.insert(alloc.port), "duplicate port {}", alloc.port);
                cpu += alloc.limits.cpu_shares;
            }
        }
        more_asserts::assert_le!(cpu, 1024 * 8);
        assert_eq!(ports.len(), 32);
        assert_eq!(a.stats().cpu_shares_used, cpu);
    }
}
