//! Generationally-versioned site cache with assumed-workload expiry
//!
//! The cache keeps one [`SiteInfo`] per site in an arena-backed doubly-linked
//! list ordered most-recently-mutated first. Every mutation bumps the touched
//! site's generation from a cache-wide monotonic counter and promotes it to
//! the list head; [`SiteCache::update_snapshot`] exploits this to refresh a
//! consumer's snapshot in O(changes) by walking the list only until it meets
//! a generation the snapshot has already seen.
//!
//! Workloads move through a three-state machine: Assumed (tentatively placed
//! by a scheduler cycle, counted against the site, expirable), Added
//! (store-confirmed), and Absent. An orthogonal `binding_finished` flag keeps
//! the expiry sweep away from placements whose bind call is still in flight.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::flavor::FlavorRegistry;
use super::resources::{
    AllocationRatio, EipPool, NetMetrics, SiteResources, SpotInventory, VolumePool,
};
use super::site_info::SiteInfo;
use super::snapshot::Snapshot;
use super::tree::SiteTree;
use super::CollectorError;
use crate::metrics;
use crate::models::{CloudRegion, Selected, Site, Workload};

/// Configuration for the site cache
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// How long an assumed workload may wait for bind confirmation
    pub ttl: Duration,

    /// Cadence of the expiry sweep
    pub period: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            period: Duration::from_secs(1),
        }
    }
}

/// Tracked state of a workload known to the cache
#[derive(Debug, Clone)]
pub struct WorkloadState {
    pub workload: Workload,
    /// Expiry deadline while the workload is assumed
    pub deadline: Option<DateTime<Utc>>,
    /// Blocks expiry until the bind call has returned
    pub binding_finished: bool,
}

/// Counters describing cache contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub sites: usize,
    pub workloads: usize,
    pub assumed: usize,
    pub generation: u64,
}

/// Debug copy of the cache contents
#[derive(Debug, Clone)]
pub struct CacheDump {
    pub site_infos: HashMap<String, SiteInfo>,
    pub assumed: HashSet<String>,
}

/// Arena slot: site state plus MRU links as stable indices
#[derive(Debug)]
struct SiteNode {
    info: SiteInfo,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct CacheInner {
    nodes: Vec<Option<SiteNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    site_index: HashMap<String, usize>,

    assumed: HashSet<String>,
    workloads: HashMap<String, WorkloadState>,

    region_index: HashMap<String, HashSet<String>>,
    tree: SiteTree,

    /// Cache-wide monotonic generation; equals the head node's generation
    /// whenever the list is non-empty
    generation: u64,
}

impl CacheInner {
    // ------------------------------------------------------------------
    // Arena + MRU list plumbing. Lock is held by every caller.
    // ------------------------------------------------------------------

    fn node(&self, index: usize) -> &SiteNode {
        self.nodes[index].as_ref().expect("dangling arena index")
    }

    fn node_mut(&mut self, index: usize) -> &mut SiteNode {
        self.nodes[index].as_mut().expect("dangling arena index")
    }

    /// Arena index for a site, creating an empty entry when absent
    fn ensure_node(&mut self, site_id: &str) -> usize {
        if let Some(&index) = self.site_index.get(site_id) {
            return index;
        }
        let node = SiteNode {
            info: SiteInfo::new(site_id),
            prev: None,
            next: None,
        };
        let index = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.site_index.insert(site_id.to_string(), index);
        index
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };
        if let Some(prev_index) = prev {
            self.node_mut(prev_index).next = next;
        }
        if let Some(next_index) = next {
            self.node_mut(next_index).prev = prev;
        }
        if self.head == Some(index) {
            self.head = next;
        }
        let node = self.node_mut(index);
        node.prev = None;
        node.next = None;
    }

    fn move_to_head(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        let old_head = self.head;
        if let Some(head_index) = old_head {
            self.node_mut(head_index).prev = Some(index);
        }
        let node = self.node_mut(index);
        node.next = old_head;
        self.head = Some(index);
    }

    /// Advance the cache generation, stamp it on the site, promote to head
    fn bump(&mut self, index: usize) {
        self.generation += 1;
        let generation = self.generation;
        self.node_mut(index).info.set_generation(generation);
        self.move_to_head(index);
    }

    fn evict_node(&mut self, site_id: &str) {
        let Some(index) = self.site_index.remove(site_id) else {
            return;
        };
        self.unlink(index);
        self.nodes[index] = None;
        self.free.push(index);
    }

    // ------------------------------------------------------------------
    // Workload placement
    // ------------------------------------------------------------------

    fn add_workload_to_site(&mut self, workload: &Workload, selected: &Selected) {
        let index = self.ensure_node(&selected.site_id);
        self.node_mut(index).info.add_workload(workload.clone());
        self.bump(index);
    }

    /// Drop a workload from its site. A site that has already been removed
    /// counts as success: its deletion event simply outran the workload's.
    fn remove_workload_from_site(
        &mut self,
        key: &str,
        selected: &Selected,
    ) -> Result<(), CollectorError> {
        let Some(&index) = self.site_index.get(&selected.site_id) else {
            return Ok(());
        };
        self.node_mut(index).info.remove_workload(key)?;
        self.bump(index);
        Ok(())
    }

    fn update_region_index(&mut self, site: &Site) {
        self.region_index
            .entry(site.region.clone())
            .or_default()
            .insert(site.site_id.clone());
    }

    fn delete_region_index(&mut self, site: &Site) {
        if let Some(sites) = self.region_index.get_mut(&site.region) {
            sites.remove(&site.site_id);
            if sites.is_empty() {
                self.region_index.remove(&site.region);
            }
        }
    }

    /// Indices of sites in the given region/zone, metadata-bearing only
    fn zone_members(&self, region: &str, availability_zone: &str) -> Vec<usize> {
        self.site_index
            .values()
            .copied()
            .filter(|&index| {
                self.node(index).info.site().is_some_and(|site| {
                    site.region == region && site.availability_zone == availability_zone
                })
            })
            .collect()
    }

    fn selected_of(workload: &Workload) -> Result<Selected, CollectorError> {
        workload
            .selected
            .clone()
            .ok_or_else(|| CollectorError::NoSelectedSite {
                key: workload.cache_key().to_string(),
            })
    }

    fn refresh_gauges(&self) {
        metrics::set_cache_sites(self.site_index.len());
        metrics::set_assumed_workloads(self.assumed.len());
    }
}

/// Concurrency-safe cache of sites and their resource state, consumed by
/// scheduler cycles through [`Snapshot`]s.
///
/// A single reader-writer lock guards all internal state; mutators never call
/// out to the store, the ring, or the work queue while holding it.
pub struct SiteCache {
    ttl: ChronoDuration,
    period: Duration,
    flavors: Arc<FlavorRegistry>,
    inner: RwLock<CacheInner>,
    // Handle to ourselves for the expiry sweep task.
    self_ref: std::sync::Weak<SiteCache>,
}

impl SiteCache {
    pub fn new(config: CollectorConfig, flavors: Arc<FlavorRegistry>) -> Arc<Self> {
        let ttl = ChronoDuration::from_std(config.ttl)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        Arc::new_cyclic(|self_ref| Self {
            ttl,
            period: config.period,
            flavors,
            inner: RwLock::new(CacheInner::default()),
            self_ref: self_ref.clone(),
        })
    }

    /// Spawn the background expiry sweep; it stops when `stop` fires.
    pub fn run(&self, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let cache = self
            .self_ref
            .upgrade()
            .expect("cache self reference still alive while running");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_ms = cache.period.as_millis() as u64, "expiry sweep started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.cleanup_expired(Utc::now()).await;
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("expiry sweep stopped");
        })
    }

    // ========================================================================
    // Assumed-workload lifecycle
    // ========================================================================

    /// Tentatively place a workload on its selected site. The placement
    /// counts for resource accounting immediately and expires if the bind
    /// confirmation never lands.
    pub async fn assume_workload(&self, workload: Workload) -> Result<(), CollectorError> {
        let selected = CacheInner::selected_of(&workload)?;
        let key = workload.cache_key().to_string();

        let mut inner = self.inner.write().await;
        if inner.workloads.contains_key(&key) {
            return Err(CollectorError::AlreadyPresent { key });
        }

        inner.add_workload_to_site(&workload, &selected);
        inner.workloads.insert(
            key.clone(),
            WorkloadState {
                workload,
                deadline: Some(Utc::now() + self.ttl),
                binding_finished: false,
            },
        );
        inner.assumed.insert(key);
        inner.refresh_gauges();
        Ok(())
    }

    /// Report the outcome of the bind call for an assumed workload. Success
    /// arms the expiry timer afresh; failure forgets the placement.
    pub async fn finish_binding(&self, key: &str, success: bool) -> Result<(), CollectorError> {
        if !success {
            let workload = {
                let inner = self.inner.read().await;
                if !inner.assumed.contains(key) {
                    return Err(CollectorError::NotAssumed {
                        key: key.to_string(),
                    });
                }
                inner
                    .workloads
                    .get(key)
                    .expect("assumed key without workload state")
                    .workload
                    .clone()
            };
            return self.forget_workload(&workload).await;
        }

        let mut inner = self.inner.write().await;
        if !inner.assumed.contains(key) {
            return Err(CollectorError::NotAssumed {
                key: key.to_string(),
            });
        }
        let deadline = Utc::now() + self.ttl;
        let state = inner
            .workloads
            .get_mut(key)
            .expect("assumed key without workload state");
        state.binding_finished = true;
        state.deadline = Some(deadline);
        Ok(())
    }

    /// Drop an assumed placement, returning the site to its prior state
    pub async fn forget_workload(&self, workload: &Workload) -> Result<(), CollectorError> {
        let key = workload.cache_key().to_string();

        let mut inner = self.inner.write().await;
        if !inner.assumed.contains(&key) {
            return Err(CollectorError::NotAssumed { key });
        }

        let assumed_selected = CacheInner::selected_of(
            &inner
                .workloads
                .get(&key)
                .expect("assumed key without workload state")
                .workload,
        )?;
        inner.remove_workload_from_site(&key, &assumed_selected)?;
        inner.assumed.remove(&key);
        inner.workloads.remove(&key);
        inner.refresh_gauges();
        Ok(())
    }

    // ========================================================================
    // Confirmed-workload lifecycle
    // ========================================================================

    /// Authoritative add from the store. Confirms an assumed placement,
    /// relocating it first if the store placed the workload elsewhere, or
    /// re-adds a workload whose assumption already expired.
    pub async fn add_workload(&self, workload: Workload) -> Result<(), CollectorError> {
        let selected = CacheInner::selected_of(&workload)?;
        let key = workload.cache_key().to_string();

        let mut inner = self.inner.write().await;
        let tracked = inner
            .workloads
            .get(&key)
            .map(|state| state.workload.clone());
        match tracked {
            Some(assumed_workload) if inner.assumed.contains(&key) => {
                let assumed_selected = CacheInner::selected_of(&assumed_workload)?;
                if assumed_selected != selected {
                    warn!(
                        key = %key,
                        assumed_site = %assumed_selected.site_id,
                        confirmed_site = %selected.site_id,
                        "workload was assumed on a different site than it was added to"
                    );
                    inner.remove_workload_from_site(&key, &assumed_selected)?;
                    inner.add_workload_to_site(&workload, &selected);
                }
                inner.assumed.remove(&key);
                let state = inner
                    .workloads
                    .get_mut(&key)
                    .expect("checked above");
                state.deadline = None;
                state.workload = workload;
                inner.refresh_gauges();
                Ok(())
            }
            Some(_) => Err(CollectorError::AlreadyAdded { key }),
            None => {
                // The assumption expired before the confirmation arrived.
                inner.add_workload_to_site(&workload, &selected);
                inner.workloads.insert(
                    key,
                    WorkloadState {
                        workload,
                        deadline: None,
                        binding_finished: false,
                    },
                );
                inner.refresh_gauges();
                Ok(())
            }
        }
    }

    /// Store-confirmed update of an added workload
    pub async fn update_workload(
        &self,
        old: &Workload,
        new: Workload,
    ) -> Result<(), CollectorError> {
        let new_selected = CacheInner::selected_of(&new)?;
        let key = old.cache_key().to_string();

        let mut inner = self.inner.write().await;
        if !inner.workloads.contains_key(&key) || inner.assumed.contains(&key) {
            // Assumed workloads have no update events; the add must land first.
            return Err(CollectorError::NotAdded { key });
        }

        let current_selected = CacheInner::selected_of(&inner.workloads[&key].workload)?;
        if current_selected != new_selected {
            error!(
                key = %key,
                current_site = %current_selected.site_id,
                new_site = %new_selected.site_id,
                "workload updated on a different site than previously added; cache may mis-count until reconciled"
            );
        }
        inner.remove_workload_from_site(&key, &current_selected)?;
        inner.add_workload_to_site(&new, &new_selected);
        inner
            .workloads
            .get_mut(&key)
            .expect("checked above")
            .workload = new;
        Ok(())
    }

    /// Store-confirmed removal of an added workload
    pub async fn remove_workload(&self, workload: &Workload) -> Result<(), CollectorError> {
        let key = workload.cache_key().to_string();

        let mut inner = self.inner.write().await;
        if !inner.workloads.contains_key(&key) || inner.assumed.contains(&key) {
            return Err(CollectorError::NotAdded { key });
        }

        let current_selected = CacheInner::selected_of(&inner.workloads[&key].workload)?;
        if let Some(event_selected) = &workload.selected {
            if event_selected.site_id != current_selected.site_id {
                error!(
                    key = %key,
                    cached_site = %current_selected.site_id,
                    event_site = %event_selected.site_id,
                    "removal event names a different site than the cache"
                );
            }
        }
        inner.remove_workload_from_site(&key, &current_selected)?;
        inner.workloads.remove(&key);
        inner.refresh_gauges();
        Ok(())
    }

    pub async fn is_assumed(&self, key: &str) -> bool {
        self.inner.read().await.assumed.contains(key)
    }

    /// Tracked copy of a workload. The workload may reference a site that was
    /// already deleted; that is fine for processing its own update events.
    pub async fn workload(&self, key: &str) -> Option<Workload> {
        self.inner
            .read()
            .await
            .workloads
            .get(key)
            .map(|state| state.workload.clone())
    }

    // ========================================================================
    // Site lifecycle
    // ========================================================================

    pub async fn add_site(&self, site: Site) {
        let mut inner = self.inner.write().await;
        let index = inner.ensure_node(&site.site_id);
        inner.node_mut(index).info.set_site(site.clone());
        inner.tree.add_site(&site);
        inner.update_region_index(&site);
        inner.bump(index);
        inner.refresh_gauges();
    }

    pub async fn update_site(&self, old: &Site, new: Site) {
        let mut inner = self.inner.write().await;
        let index = inner.ensure_node(&new.site_id);
        inner.node_mut(index).info.set_site(new.clone());
        inner.tree.update_site(old, &new);
        inner.delete_region_index(old);
        inner.update_region_index(&new);
        inner.bump(index);
    }

    /// Drop a site. Workload state referencing it stays behind and is
    /// reconciled by the workloads' own lifecycle events.
    pub async fn remove_site(&self, site_id: &str) -> Result<(), CollectorError> {
        let mut inner = self.inner.write().await;
        let &index = inner
            .site_index
            .get(site_id)
            .ok_or_else(|| CollectorError::SiteNotFound {
                site_id: site_id.to_string(),
            })?;

        let site = inner.node(index).info.site().cloned();
        inner.evict_node(site_id);
        if let Some(site) = site {
            inner.tree.remove_site(&site)?;
            inner.delete_region_index(&site);
        }
        inner.refresh_gauges();
        Ok(())
    }

    // ========================================================================
    // Resource state fan-out
    // ========================================================================

    /// Merge an EIP pool into every site of the pool's region
    pub async fn update_eip_pool(&self, pool: EipPool) {
        let mut inner = self.inner.write().await;
        let members: Vec<usize> = inner
            .region_index
            .get(&pool.region)
            .map(|sites| {
                sites
                    .iter()
                    .filter_map(|site_id| inner.site_index.get(site_id).copied())
                    .collect()
            })
            .unwrap_or_default();

        for index in members {
            inner.node_mut(index).info.update_eip_pool(pool.clone());
            inner.bump(index);
        }
    }

    /// Merge a volume pool into every site of the pool's region
    pub async fn update_volume_pool(&self, pool: VolumePool) {
        let mut inner = self.inner.write().await;
        let members: Vec<usize> = inner
            .region_index
            .get(&pool.region)
            .map(|sites| {
                sites
                    .iter()
                    .filter_map(|site_id| inner.site_index.get(site_id).copied())
                    .collect()
            })
            .unwrap_or_default();

        for index in members {
            inner.node_mut(index).info.update_volume_pool(pool.clone());
            inner.bump(index);
        }
    }

    /// Replace one site's capacity totals. Unknown sites are ignored; their
    /// site event has not arrived yet.
    pub async fn update_site_resources(&self, site_id: &str, resources: SiteResources) {
        let mut inner = self.inner.write().await;
        if let Some(&index) = inner.site_index.get(site_id) {
            inner.node_mut(index).info.update_resources(resources);
            inner.bump(index);
        }
    }

    pub async fn update_qos(&self, site_id: &str, metrics: NetMetrics) {
        let mut inner = self.inner.write().await;
        if let Some(&index) = inner.site_index.get(site_id) {
            inner.node_mut(index).info.update_qos(metrics);
            inner.bump(index);
        }
    }

    /// Apply overcommit ratios to every site in the availability zone
    pub async fn update_allocation_ratio(
        &self,
        region: &str,
        availability_zone: &str,
        ratio: AllocationRatio,
    ) {
        let mut inner = self.inner.write().await;
        for index in inner.zone_members(region, availability_zone) {
            inner.node_mut(index).info.update_allocation_ratio(ratio);
            inner.bump(index);
        }
    }

    /// Replace spot inventory for every site in the availability zone
    pub async fn update_spot_resources(
        &self,
        region: &str,
        availability_zone: &str,
        spot: SpotInventory,
    ) {
        let mut inner = self.inner.write().await;
        for index in inner.zone_members(region, availability_zone) {
            inner
                .node_mut(index)
                .info
                .update_spot_resources(spot.clone());
            inner.bump(index);
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Refresh a consumer snapshot in O(changes).
    ///
    /// Walks the MRU list from the head and copies every site whose
    /// generation is newer than the snapshot's; the walk stops at the first
    /// older entry because everything behind it is unchanged. The site list
    /// is rebuilt in tree order only when membership changed. On a failed
    /// post-condition the list is force-rebuilt and an error returned so the
    /// caller retries its cycle.
    pub async fn update_snapshot(&self, snapshot: &mut Snapshot) -> Result<(), CollectorError> {
        let mut inner = self.inner.write().await;
        let snapshot_generation = snapshot.generation;
        let mut any_new = false;
        let mut any_removed = false;

        let mut cursor = inner.head;
        while let Some(index) = cursor {
            let node = inner.node(index);
            if node.info.generation() <= snapshot_generation {
                break;
            }
            cursor = node.next;

            // Entries without site metadata exist only for early workload
            // accounting; they join snapshots once their site event arrives.
            if node.info.site().is_none() {
                continue;
            }

            let site_id = node.info.site_id().to_string();
            let copied = Arc::new(node.info.clone());
            if snapshot.site_info_map.contains_key(&site_id) {
                snapshot.site_info_map.insert(site_id.clone(), Arc::clone(&copied));
                if let Some(&position) = snapshot.positions.get(&site_id) {
                    snapshot.site_info_list[position] = copied;
                }
            } else {
                snapshot.site_info_map.insert(site_id, copied);
                any_new = true;
            }
        }

        if let Some(head) = inner.head {
            snapshot.generation = inner.node(head).info.generation();
        }

        if snapshot.site_info_map.len() > inner.site_index.len() {
            let site_index = &inner.site_index;
            snapshot
                .site_info_map
                .retain(|site_id, _| site_index.contains_key(site_id));
            any_removed = true;
        }

        if any_new || any_removed {
            Self::rebuild_snapshot_list(&mut inner, snapshot);
        }

        if snapshot.site_info_list.len() != inner.tree.num_sites() {
            let failure = CollectorError::InconsistentSnapshot {
                list_len: snapshot.site_info_list.len(),
                tree_len: inner.tree.num_sites(),
                map_len: snapshot.site_info_map.len(),
                cache_len: inner.site_index.len(),
            };
            error!(error = %failure, "snapshot state is not consistent, recovering with a full rebuild");
            Self::rebuild_snapshot_list(&mut inner, snapshot);
            return Err(failure);
        }
        drop(inner);

        // Refresh flavor tables from the informer snapshot.
        let flavors = self.flavors.snapshot();
        snapshot.region_flavor_map = flavors
            .iter()
            .map(|flavor| (flavor.region_flavor_id.clone(), flavor.clone()))
            .collect();
        snapshot.flavor_map.clear();
        for flavor in flavors {
            snapshot
                .flavor_map
                .entry(flavor.id.clone())
                .or_insert(flavor);
        }

        Ok(())
    }

    fn rebuild_snapshot_list(inner: &mut CacheInner, snapshot: &mut Snapshot) {
        snapshot.site_info_list.clear();
        snapshot.positions.clear();
        for _ in 0..inner.tree.num_sites() {
            let Some(site_id) = inner.tree.next() else {
                break;
            };
            match snapshot.site_info_map.get(&site_id) {
                Some(info) => {
                    snapshot
                        .positions
                        .insert(site_id, snapshot.site_info_list.len());
                    snapshot.site_info_list.push(Arc::clone(info));
                }
                None => {
                    error!(site_id = %site_id, "site in tree but not in snapshot map; this should not happen");
                }
            }
        }
    }

    // ========================================================================
    // Read surfaces
    // ========================================================================

    /// Workloads passing the filter, across all sites
    pub async fn filtered_list(&self, filter: impl Fn(&Workload) -> bool) -> Vec<Workload> {
        let inner = self.inner.read().await;
        let capacity = inner
            .site_index
            .values()
            .map(|&index| inner.node(index).info.workload_count())
            .sum();
        let mut workloads = Vec::with_capacity(capacity);
        for &index in inner.site_index.values() {
            for workload in inner.node(index).info.workloads() {
                if filter(workload) {
                    workloads.push(workload.clone());
                }
            }
        }
        workloads
    }

    /// Regions currently represented in the cache with their zones
    pub async fn get_regions(&self) -> HashMap<String, CloudRegion> {
        let inner = self.inner.read().await;
        let mut regions: HashMap<String, CloudRegion> = HashMap::new();
        for &index in inner.site_index.values() {
            if let Some(site) = inner.node(index).info.site() {
                let entry = regions
                    .entry(site.region.clone())
                    .or_insert_with(|| CloudRegion {
                        region: site.region.clone(),
                        availability_zones: Vec::new(),
                    });
                if !entry
                    .availability_zones
                    .contains(&site.availability_zone)
                {
                    entry.availability_zones.push(site.availability_zone.clone());
                }
            }
        }
        regions
    }

    /// Expensive full copy for debugging; not for the scheduling path
    pub async fn dump(&self) -> CacheDump {
        let inner = self.inner.read().await;
        CacheDump {
            site_infos: inner
                .site_index
                .iter()
                .map(|(site_id, &index)| (site_id.clone(), inner.node(index).info.clone()))
                .collect(),
            assumed: inner.assumed.clone(),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        CacheStats {
            sites: inner.site_index.len(),
            workloads: inner.workloads.len(),
            assumed: inner.assumed.len(),
            generation: inner.generation,
        }
    }

    /// Log a one-line JSON summary per site
    pub async fn log_contents(&self) {
        let inner = self.inner.read().await;
        let total = inner.site_index.len();
        for (position, (site_id, &index)) in inner.site_index.iter().enumerate() {
            match serde_json::to_string(&inner.node(index).info) {
                Ok(rendered) => {
                    info!(site_id = %site_id, entry = position + 1, total, "site cache entry: {rendered}")
                }
                Err(err) => warn!(site_id = %site_id, error = %err, "failed to render site info"),
            }
        }
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Expire assumed workloads whose deadline has passed. Takes `now` as an
    /// argument so tests can drive it deterministically.
    async fn cleanup_expired(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.write().await;

        // The assumed set is expected to stay small.
        let keys: Vec<String> = inner.assumed.iter().cloned().collect();
        for key in keys {
            let Some(state) = inner.workloads.get(&key) else {
                error!(
                    key = %key,
                    "assumed key has no workload state; cache is corrupted, skipping"
                );
                debug_assert!(false, "assumed key {key} missing from workload table");
                continue;
            };
            if !state.binding_finished {
                debug!(key = %key, "binding still in progress; not expiring");
                continue;
            }
            let Some(deadline) = state.deadline else {
                continue;
            };
            if now <= deadline {
                continue;
            }

            warn!(
                uid = %state.workload.uid,
                pod = %state.workload.pod_name,
                "assumed workload expired without confirmation"
            );
            let selected = match CacheInner::selected_of(&state.workload) {
                Ok(selected) => selected,
                Err(err) => {
                    error!(key = %key, error = %err, "cannot expire workload");
                    continue;
                }
            };
            if let Err(err) = inner.remove_workload_from_site(&key, &selected) {
                error!(key = %key, error = %err, "expiry failed to release site resources");
                continue;
            }
            inner.assumed.remove(&key);
            inner.workloads.remove(&key);
        }
        inner.refresh_gauges();
    }

    #[cfg(test)]
    pub(crate) async fn expire_at(&self, now: DateTime<Utc>) {
        self.cleanup_expired(now).await;
    }

    /// Walk the MRU list and cross-check it against the site index.
    /// Debug/test surface for the list↔map consistency contract.
    pub async fn mru_site_ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut ids = Vec::with_capacity(inner.site_index.len());
        let mut cursor = inner.head;
        while let Some(index) = cursor {
            let node = inner.node(index);
            ids.push(node.info.site_id().to_string());
            cursor = node.next;
        }
        ids
    }
}
