//! Resource pool and metric types composed into per-site state
//!
//! These arrive from region-scoped collectors and are fanned out onto the
//! sites of the matching region or availability zone by the cache.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capacity and usage totals for the schedulable resource classes of a site
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteResources {
    pub total_vcpus: u64,
    pub total_memory_mb: u64,
    pub used_vcpus: u64,
    pub used_memory_mb: u64,
}

/// Elastic-IP pool for a region
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EipPool {
    pub region: String,
    pub total: u64,
    pub used: u64,
}

impl EipPool {
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

/// Block-storage pool for a region
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumePool {
    pub region: String,
    pub capacity_gb: u64,
    pub used_gb: u64,
}

impl VolumePool {
    pub fn free_gb(&self) -> u64 {
        self.capacity_gb.saturating_sub(self.used_gb)
    }
}

/// Network quality metrics reported for a site
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetMetrics {
    pub latency_ms: f64,
    pub packet_loss_pct: f64,
    pub bandwidth_mbps: f64,
}

/// Overcommit ratios applied to raw capacity when computing allocatable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationRatio {
    pub cpu_ratio: f64,
    pub memory_ratio: f64,
}

impl Default for AllocationRatio {
    fn default() -> Self {
        Self {
            cpu_ratio: 1.0,
            memory_ratio: 1.0,
        }
    }
}

/// Spot capacity for one flavor in an availability zone
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpotResource {
    pub available: u64,
    pub reserved: u64,
}

/// Spot inventory keyed by flavor id
pub type SpotInventory = HashMap<String, SpotResource>;

/// A flavor as published per region by the flavor informer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionFlavor {
    /// Flavor id, shared across regions
    pub id: String,
    /// Region-qualified id, unique per (region, flavor)
    pub region_flavor_id: String,
    pub region: String,
    pub name: String,
    pub vcpus: u64,
    pub memory_mb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_free_saturates() {
        let eip = EipPool {
            region: "kr-north-1".to_string(),
            total: 5,
            used: 8,
        };
        assert_eq!(eip.free(), 0);

        let volume = VolumePool {
            region: "kr-north-1".to_string(),
            capacity_gb: 100,
            used_gb: 30,
        };
        assert_eq!(volume.free_gb(), 70);
    }

    #[test]
    fn test_allocation_ratio_default_is_identity() {
        let ratio = AllocationRatio::default();
        assert_eq!(ratio.cpu_ratio, 1.0);
        assert_eq!(ratio.memory_ratio, 1.0);
    }
}
