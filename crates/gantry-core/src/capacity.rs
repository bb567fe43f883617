// Copyright (C) 2025 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node capacity evaluation.
//!
//! Nodes advertise raw memory and disk capacity (MiB) plus an
//! overallocation percentage per resource. The effective ceiling is
//! `capacity * (1 + overallocate / 100)`; an overallocation of `-1`
//! disables the ceiling entirely. Usage is the sum of limits of every
//! workload placed on the node, whether or not it is running.

/// Advertised capacity and overallocation policy for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCapacity {
    /// Memory capacity in MiB
    pub memory: i64,
    /// Memory overallocation percentage; `-1` means unlimited
    pub memory_overallocate: i32,
    /// Disk capacity in MiB
    pub disk: i64,
    /// Disk overallocation percentage; `-1` means unlimited
    pub disk_overallocate: i32,
}

/// Summed resource limits of workloads already placed on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Allocated memory in MiB
    pub memory: i64,
    /// Allocated disk in MiB
    pub disk: i64,
}

/// Resources a prospective workload asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Requested memory in MiB
    pub memory: i64,
    /// Requested disk in MiB
    pub disk: i64,
}

/// Remaining room for one resource, or `None` when the overallocation
/// policy removes the ceiling.
pub fn headroom(capacity: i64, overallocate: i32, used: i64) -> Option<i64> {
    if overallocate < 0 {
        return None;
    }
    let ceiling = capacity + capacity * i64::from(overallocate) / 100;
    Some(ceiling - used)
}

impl NodeCapacity {
    /// Whether a request fits alongside the node's current usage. A
    /// resource only constrains placement when its headroom is bounded.
    pub fn fits(&self, usage: ResourceUsage, request: ResourceRequest) -> bool {
        let memory_ok = match headroom(self.memory, self.memory_overallocate, usage.memory) {
            Some(room) => request.memory <= room,
            None => true,
        };
        let disk_ok = match headroom(self.disk, self.disk_overallocate, usage.disk) {
            Some(room) => request.disk <= room,
            None => true,
        };
        memory_ok && disk_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(memory: i64, mem_over: i32, disk: i64, disk_over: i32) -> NodeCapacity {
        NodeCapacity {
            memory,
            memory_overallocate: mem_over,
            disk,
            disk_overallocate: disk_over,
        }
    }

    #[test]
    fn headroom_without_overallocation() {
        assert_eq!(headroom(8192, 0, 6144), Some(2048));
    }

    #[test]
    fn headroom_with_overallocation_percentage() {
        // 20% overallocation raises an 8 GiB node to 9830 MiB.
        assert_eq!(headroom(8192, 20, 0), Some(9830));
    }

    #[test]
    fn negative_overallocation_means_unlimited() {
        assert_eq!(headroom(1, -1, 1_000_000), None);
    }

    #[test]
    fn headroom_can_go_negative_when_overcommitted() {
        assert_eq!(headroom(1024, 0, 2048), Some(-1024));
    }

    #[test]
    fn exact_fit_is_accepted() {
        let cap = node(8192, 0, 10240, 0);
        let usage = ResourceUsage {
            memory: 4096,
            disk: 5120,
        };
        let request = ResourceRequest {
            memory: 4096,
            disk: 5120,
        };
        assert!(cap.fits(usage, request));
    }

    #[test]
    fn one_mib_over_is_rejected() {
        let cap = node(8192, 0, 10240, 0);
        let usage = ResourceUsage {
            memory: 4096,
            disk: 0,
        };
        let request = ResourceRequest {
            memory: 4097,
            disk: 0,
        };
        assert!(!cap.fits(usage, request));
    }

    #[test]
    fn either_exhausted_resource_rejects() {
        let cap = node(8192, 0, 1024, 0);
        let usage = ResourceUsage::default();
        // Memory fits but disk does not.
        let request = ResourceRequest {
            memory: 1024,
            disk: 2048,
        };
        assert!(!cap.fits(usage, request));
    }

    #[test]
    fn unlimited_resource_never_rejects() {
        let cap = node(1, -1, 1, -1);
        let usage = ResourceUsage {
            memory: 1 << 40,
            disk: 1 << 40,
        };
        let request = ResourceRequest {
            memory: 1 << 40,
            disk: 1 << 40,
        };
        assert!(cap.fits(usage, request));
    }

    #[test]
    fn overallocation_admits_past_raw_capacity() {
        let cap = node(1000, 50, 1000, 0);
        let usage = ResourceUsage {
            memory: 1200,
            disk: 0,
        };
        let request = ResourceRequest {
            memory: 300,
            disk: 0,
        };
        // Ceiling is 1500 MiB, so 1200 + 300 fits exactly.
        assert!(cap.fits(usage, request));
        let over = ResourceRequest {
            memory: 301,
            disk: 0,
        };
        assert!(!cap.fits(usage, over));
    }
}
