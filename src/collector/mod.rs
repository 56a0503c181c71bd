//! Collector cache consumed by scheduler cycles
//!
//! A scheduling cycle needs a coherent view of every site's capacity,
//! pools, and current placements without copying the whole cache each time.
//! This module provides that view:
//!
//! - [`SiteCache`] - concurrency-safe, generationally-versioned cache of
//!   sites and workloads, with background expiry of assumed placements
//! - [`SiteTree`] - region/zone-grouped registry providing the deterministic
//!   traversal order snapshots are built in
//! - [`SiteInfo`] - per-site resource accounting
//! - [`Snapshot`] - point-in-time view refreshed in O(changes) via the
//!   MRU/generation protocol
//! - [`FlavorRegistry`] - passive flavor tables copied into each snapshot
//!
//! # Example
//!
//! ```ignore
//! use haneul::collector::{CollectorConfig, FlavorRegistry, SiteCache, Snapshot};
//!
//! let cache = SiteCache::new(CollectorConfig::default(), Arc::new(FlavorRegistry::new()));
//! cache.add_site(site).await;
//! cache.assume_workload(workload).await?;
//!
//! let mut snapshot = Snapshot::new();
//! cache.update_snapshot(&mut snapshot).await?;
//! for site_info in snapshot.site_info_list() {
//!     // feed the placement policy engine
//! }
//! ```

pub mod cache;
pub mod flavor;
pub mod resources;
pub mod site_info;
pub mod snapshot;
pub mod tree;

pub use cache::{CacheDump, CacheStats, CollectorConfig, SiteCache, WorkloadState};
pub use flavor::FlavorRegistry;
pub use resources::{
    AllocationRatio, EipPool, NetMetrics, RegionFlavor, SiteResources, SpotInventory,
    SpotResource, VolumePool,
};
pub use site_info::{RequestedResources, SiteInfo};
pub use snapshot::Snapshot;
pub use tree::SiteTree;

use thiserror::Error;

/// Errors surfaced by cache operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectorError {
    /// Assume on a key the cache already tracks
    #[error("workload '{key}' is already in the cache, so it cannot be assumed")]
    AlreadyPresent { key: String },

    /// Forget or binding-finish on a key that is not assumed
    #[error("workload '{key}' was not assumed")]
    NotAssumed { key: String },

    /// Authoritative add for a key already in added state
    #[error("workload '{key}' is already in added state")]
    AlreadyAdded { key: String },

    /// Update or remove for a key not in added state
    #[error("workload '{key}' is not in added state")]
    NotAdded { key: String },

    /// Workload event without a placement decision
    #[error("workload '{key}' has no selected site")]
    NoSelectedSite { key: String },

    #[error("site '{site_id}' is not in the cache")]
    SiteNotFound { site_id: String },

    /// A site's accounting does not know the workload being released
    #[error("workload '{key}' is not tracked by site '{site_id}'")]
    WorkloadNotOnSite { key: String, site_id: String },

    /// Snapshot post-condition failed; the caller should retry its cycle
    #[error(
        "snapshot state is not consistent: list={list_len}, tree={tree_len}, \
         map={map_len}, cache={cache_len}"
    )]
    InconsistentSnapshot {
        list_len: usize,
        tree_len: usize,
        map_len: usize,
        cache_len: usize,
    },
}
