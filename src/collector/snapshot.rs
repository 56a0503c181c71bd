//! Point-in-time view of the site cache
//!
//! A snapshot is refreshed in place by [`SiteCache::update_snapshot`]
//! (`crate::collector::SiteCache`): entries whose generation is newer than
//! the snapshot's are re-copied, everything else keeps its existing
//! `Arc<SiteInfo>`. Consumers treat the snapshot as read-only for the length
//! of one scheduling cycle.

use std::collections::HashMap;
use std::sync::Arc;

use super::resources::RegionFlavor;
use super::site_info::SiteInfo;

/// Immutable view over sites plus flavor lookup tables
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Site id → latest copied state
    pub(crate) site_info_map: HashMap<String, Arc<SiteInfo>>,

    /// Sites in the tree's canonical traversal order
    pub(crate) site_info_list: Vec<Arc<SiteInfo>>,

    /// Site id → index into `site_info_list`, so an in-place refresh can
    /// swap a single entry without rebuilding the list
    pub(crate) positions: HashMap<String, usize>,

    /// Highest site generation folded into this snapshot
    pub(crate) generation: u64,

    /// Flavors keyed by region-qualified id
    pub(crate) region_flavor_map: HashMap<String, RegionFlavor>,

    /// Flavors keyed by plain flavor id; first region wins
    pub(crate) flavor_map: HashMap<String, RegionFlavor>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn site_info(&self, site_id: &str) -> Option<&Arc<SiteInfo>> {
        self.site_info_map.get(site_id)
    }

    pub fn site_info_list(&self) -> &[Arc<SiteInfo>] {
        &self.site_info_list
    }

    pub fn len(&self) -> usize {
        self.site_info_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.site_info_list.is_empty()
    }

    pub fn region_flavor(&self, region_flavor_id: &str) -> Option<&RegionFlavor> {
        self.region_flavor_map.get(region_flavor_id)
    }

    pub fn flavor(&self, flavor_id: &str) -> Option<&RegionFlavor> {
        self.flavor_map.get(flavor_id)
    }
}
