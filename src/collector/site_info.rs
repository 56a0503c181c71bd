//! Mutable per-site state consumed by scheduler cycles
//!
//! A `SiteInfo` may exist before its site's metadata arrives: a workload
//! event referencing an unknown site creates the entry so accounting starts
//! immediately, and the later site event fills in region and zone.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::resources::{
    AllocationRatio, EipPool, NetMetrics, SiteResources, SpotInventory, SpotResource, VolumePool,
};
use super::CollectorError;
use crate::models::{Site, Workload};

/// Resource demand accumulated from the workloads placed on a site
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestedResources {
    pub vcpus: u64,
    pub memory_mb: u64,
    pub volume_gb: u64,
    pub eips: u64,
}

/// Per-site cache entry: site metadata, resource state, and the set of
/// workloads currently counted against the site. The `generation` is owned by
/// the cache and bumped on every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteInfo {
    site_id: String,
    site: Option<Site>,

    resources: SiteResources,
    allocation_ratio: AllocationRatio,
    eip_pool: Option<EipPool>,
    volume_pool: Option<VolumePool>,
    qos: Option<NetMetrics>,
    spot: SpotInventory,

    workloads: HashMap<String, Workload>,
    requested: RequestedResources,

    generation: u64,
}

impl SiteInfo {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            ..Self::default()
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn site(&self) -> Option<&Site> {
        self.site.as_ref()
    }

    pub fn set_site(&mut self, site: Site) {
        self.site_id = site.site_id.clone();
        self.site = Some(site);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    // ========================================================================
    // Workload accounting
    // ========================================================================

    /// Count a workload against this site. Replacing an entry for the same
    /// key first releases the old demand, so repeated adds cannot inflate
    /// the totals.
    pub fn add_workload(&mut self, workload: Workload) {
        let key = workload.cache_key().to_string();
        if let Some(previous) = self.workloads.insert(key, workload.clone()) {
            self.release(&previous);
        }
        self.requested.vcpus += workload.resources.vcpus;
        self.requested.memory_mb += workload.resources.memory_mb;
        self.requested.volume_gb += workload.resources.volume_gb;
        if workload.resources.eip {
            self.requested.eips += 1;
        }
    }

    /// Stop counting a workload; errors when the key is unknown to this site
    pub fn remove_workload(&mut self, key: &str) -> Result<Workload, CollectorError> {
        let workload = self
            .workloads
            .remove(key)
            .ok_or_else(|| CollectorError::WorkloadNotOnSite {
                key: key.to_string(),
                site_id: self.site_id.clone(),
            })?;
        self.release(&workload);
        Ok(workload)
    }

    fn release(&mut self, workload: &Workload) {
        self.requested.vcpus = self.requested.vcpus.saturating_sub(workload.resources.vcpus);
        self.requested.memory_mb = self
            .requested
            .memory_mb
            .saturating_sub(workload.resources.memory_mb);
        self.requested.volume_gb = self
            .requested
            .volume_gb
            .saturating_sub(workload.resources.volume_gb);
        if workload.resources.eip {
            self.requested.eips = self.requested.eips.saturating_sub(1);
        }
    }

    pub fn has_workload(&self, key: &str) -> bool {
        self.workloads.contains_key(key)
    }

    pub fn workloads(&self) -> impl Iterator<Item = &Workload> {
        self.workloads.values()
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.len()
    }

    pub fn requested(&self) -> &RequestedResources {
        &self.requested
    }

    // ========================================================================
    // Resource state
    // ========================================================================

    pub fn update_resources(&mut self, resources: SiteResources) {
        self.resources = resources;
    }

    pub fn resources(&self) -> &SiteResources {
        &self.resources
    }

    pub fn update_eip_pool(&mut self, pool: EipPool) {
        self.eip_pool = Some(pool);
    }

    pub fn eip_pool(&self) -> Option<&EipPool> {
        self.eip_pool.as_ref()
    }

    pub fn update_volume_pool(&mut self, pool: VolumePool) {
        self.volume_pool = Some(pool);
    }

    pub fn volume_pool(&self) -> Option<&VolumePool> {
        self.volume_pool.as_ref()
    }

    pub fn update_qos(&mut self, metrics: NetMetrics) {
        self.qos = Some(metrics);
    }

    pub fn qos(&self) -> Option<&NetMetrics> {
        self.qos.as_ref()
    }

    pub fn update_allocation_ratio(&mut self, ratio: AllocationRatio) {
        self.allocation_ratio = ratio;
    }

    pub fn update_spot_resources(&mut self, spot: SpotInventory) {
        self.spot = spot;
    }

    pub fn spot_resource(&self, flavor_id: &str) -> Option<&SpotResource> {
        self.spot.get(flavor_id)
    }

    /// Capacity after overcommit, before subtracting demand
    pub fn allocatable_vcpus(&self) -> u64 {
        (self.resources.total_vcpus as f64 * self.allocation_ratio.cpu_ratio) as u64
    }

    pub fn allocatable_memory_mb(&self) -> u64 {
        (self.resources.total_memory_mb as f64 * self.allocation_ratio.memory_ratio) as u64
    }

    /// Allocatable capacity minus requests from placed and assumed workloads
    pub fn free_vcpus(&self) -> u64 {
        self.allocatable_vcpus()
            .saturating_sub(self.resources.used_vcpus)
            .saturating_sub(self.requested.vcpus)
    }

    pub fn free_memory_mb(&self) -> u64 {
        self.allocatable_memory_mb()
            .saturating_sub(self.resources.used_memory_mb)
            .saturating_sub(self.requested.memory_mb)
    }
}
