//! Event-driven reconciler for the cluster↔scheduler binding
//!
//! A pool of workers drains the work queue and converges store state: ring
//! membership follows scheduler lifecycle, every cluster's `home_scheduler`
//! follows the ring, and each scheduler record carries its owned cluster list
//! and aggregate resource union.
//!
//! Failure handling: retryable errors (transient store failures, version
//! conflicts, an empty ring) requeue the item with exponential backoff until
//! `max_retries`, then the item is dropped with a recorded event. Every
//! mutation is idempotent, so a retry after a partial failure converges to
//! the same state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use super::process::ProcessManager;
use super::recorder::{
    EventSink, EventType, REASON_RETRIES_EXHAUSTED, REASON_SYNCED,
};
use super::ring::{HashRing, RingError};
use super::workqueue::WorkQueue;
use super::{EventKind, KeyedEvent, RoutingError};
use crate::metrics;
use crate::models::{Cluster, ClusterRef, ResourceKey, Scheduler, SchedulerStatus};
use crate::store::{ObjectStore, StoreError, WatchEvent};
use crate::utils::BackoffConfig;

/// Configuration for the routing control loop
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Number of worker tasks draining the queue
    pub workers: usize,

    /// Per-item requeue backoff and retry limit
    pub backoff: BackoffConfig,

    /// Cluster fields compared to classify an update as a real change
    pub cluster_update_fields: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            backoff: BackoffConfig::default(),
            cluster_update_fields: vec!["name".to_string(), "state".to_string()],
        }
    }
}

/// Known cluster field names for update classification
pub const CLUSTER_UPDATE_FIELDS: &[&str] =
    &["name", "state", "ip_address", "home_scheduler", "resources"];

/// Counters describing reconciler progress
#[derive(Debug, Clone, Default)]
pub struct RoutingStats {
    /// Items processed to completion
    pub synced: u64,
    /// Items requeued with backoff after a retryable failure
    pub requeued: u64,
    /// Items dropped after exhausting retries
    pub dropped: u64,
    /// Items failed terminally without retry
    pub failed: u64,
}

/// The routing control loop. Construct with [`RoutingController::new`], then
/// call [`run`](RoutingController::run) with a stop signal.
pub struct RoutingController {
    schedulers: Arc<dyn ObjectStore<Scheduler>>,
    clusters: Arc<dyn ObjectStore<Cluster>>,
    ring: RwLock<HashRing>,
    queue: Arc<WorkQueue<KeyedEvent>>,
    processes: Arc<dyn ProcessManager>,
    recorder: Arc<dyn EventSink>,
    config: RoutingConfig,

    // Deleted objects are no longer readable from the store; the watch pump
    // parks their final state here so delete processing can still see the
    // scheduler tag and cluster list. Entries are cleared on success.
    scheduler_tombstones: Mutex<HashMap<ResourceKey, Scheduler>>,
    cluster_tombstones: Mutex<HashMap<ResourceKey, Cluster>>,

    stats: Mutex<RoutingStats>,
}

impl RoutingController {
    pub fn new(
        schedulers: Arc<dyn ObjectStore<Scheduler>>,
        clusters: Arc<dyn ObjectStore<Cluster>>,
        processes: Arc<dyn ProcessManager>,
        recorder: Arc<dyn EventSink>,
        config: RoutingConfig,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(config.backoff.clone());
        Arc::new(Self {
            schedulers,
            clusters,
            ring: RwLock::new(HashRing::new()),
            queue,
            processes,
            recorder,
            config,
            scheduler_tombstones: Mutex::new(HashMap::new()),
            cluster_tombstones: Mutex::new(HashMap::new()),
            stats: Mutex::new(RoutingStats::default()),
        })
    }

    /// Enqueue a lifecycle event directly. The watch pumps use this; tests
    /// can inject events without a store round-trip.
    pub fn enqueue(&self, kind: EventKind, key: ResourceKey) {
        debug!(event = %KeyedEvent::new(kind, key.clone()), "enqueue");
        self.queue.add(KeyedEvent::new(kind, key));
    }

    /// Run pumps and workers until `stop` fires, then drain and join.
    pub async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) {
        info!(workers = self.config.workers, "starting routing controller");

        // Subscribe before the bootstrap list so no event can fall between
        // the list and the start of the streams.
        let scheduler_events = self.schedulers.watch();
        let cluster_events = self.clusters.watch();
        if let Err(err) = self.bootstrap().await {
            warn!(error = %err, "bootstrap listing failed; relying on watch stream");
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            Arc::clone(&self).pump_schedulers(scheduler_events, stop.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self).pump_clusters(cluster_events, stop.clone()),
        ));

        let mut workers = Vec::new();
        for worker_id in 0..self.config.workers.max(1) {
            workers.push(tokio::spawn(Arc::clone(&self).run_worker(worker_id)));
        }

        let mut stop_rx = stop;
        // Wait for the stop signal, then let workers drain their current item.
        while !*stop_rx.borrow() {
            if stop_rx.changed().await.is_err() {
                break;
            }
        }
        info!("stopping routing controller");
        self.queue.shutdown();

        futures::future::join_all(tasks).await;
        futures::future::join_all(workers).await;
    }

    /// Replay current store contents into the queue. The watch stream does
    /// not replay history, so startup state arrives through a list.
    async fn bootstrap(&self) -> Result<(), StoreError> {
        for scheduler in self.schedulers.list().await? {
            self.enqueue(EventKind::CreateScheduler, scheduler.key());
        }
        for cluster in self.clusters.list().await? {
            self.enqueue(EventKind::AddCluster, cluster.key());
        }
        Ok(())
    }

    pub fn stats(&self) -> RoutingStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Current ring owner for a hash key, for invariant checks and tests
    pub async fn lookup_home(&self, hash_key: &str) -> Result<String, RingError> {
        self.ring
            .read()
            .await
            .lookup(hash_key)
            .map(str::to_string)
    }

    pub async fn ring_members(&self) -> Vec<String> {
        self.ring.read().await.members().to_vec()
    }

    // ========================================================================
    // Watch pumps
    // ========================================================================

    async fn pump_schedulers(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<WatchEvent<Scheduler>>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Ok(WatchEvent::Added(scheduler)) => {
                        self.enqueue(EventKind::CreateScheduler, scheduler.key());
                    }
                    Ok(WatchEvent::Modified { old, new }) => {
                        if old.resource_version == new.resource_version {
                            continue;
                        }
                        self.enqueue(EventKind::UpdateScheduler, new.key());
                    }
                    Ok(WatchEvent::Deleted(scheduler)) => {
                        let key = scheduler.key();
                        self.scheduler_tombstones
                            .lock()
                            .expect("tombstone lock poisoned")
                            .insert(key.clone(), scheduler);
                        self.enqueue(EventKind::DeleteScheduler, key);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "scheduler watch lagged; re-listing");
                        if let Ok(schedulers) = self.schedulers.list().await {
                            for scheduler in schedulers {
                                self.enqueue(EventKind::CreateScheduler, scheduler.key());
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn pump_clusters(
        self: Arc<Self>,
        mut events: tokio::sync::broadcast::Receiver<WatchEvent<Cluster>>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Ok(WatchEvent::Added(cluster)) => {
                        self.enqueue(EventKind::AddCluster, cluster.key());
                    }
                    Ok(WatchEvent::Modified { old, new }) => {
                        if !self.cluster_changed(&old, &new) {
                            debug!(cluster = %new.key(), "no effective cluster change; discarding");
                            continue;
                        }
                        self.enqueue(EventKind::UpdateCluster, new.key());
                    }
                    Ok(WatchEvent::Deleted(cluster)) => {
                        let key = cluster.key();
                        self.cluster_tombstones
                            .lock()
                            .expect("tombstone lock poisoned")
                            .insert(key.clone(), cluster);
                        self.enqueue(EventKind::DeleteCluster, key);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "cluster watch lagged; re-listing");
                        if let Ok(clusters) = self.clusters.list().await {
                            for cluster in clusters {
                                self.enqueue(EventKind::AddCluster, cluster.key());
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Classify a cluster update by comparing the configured field list
    fn cluster_changed(&self, old: &Cluster, new: &Cluster) -> bool {
        self.config.cluster_update_fields.iter().any(|field| {
            match field.as_str() {
                "name" => old.name != new.name,
                "state" => old.state != new.state,
                "ip_address" => old.ip_address != new.ip_address,
                "home_scheduler" => old.home_scheduler != new.home_scheduler,
                "resources" => old.resources != new.resources,
                unknown => {
                    debug!(field = unknown, "unknown cluster comparison field");
                    false
                }
            }
        })
    }

    // ========================================================================
    // Worker loop
    // ========================================================================

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "routing worker started");
        while let Some(item) = self.queue.get().await {
            match self.sync(&item).await {
                Ok(()) => {
                    self.queue.forget(&item);
                    self.bump(|stats| stats.synced += 1);
                    metrics::reconcile_observed(item.kind.as_str(), "synced");
                    debug!(event = %item, "synced");
                }
                Err(err) if err.is_retryable() => {
                    if self.config.backoff.allows_retry(self.queue.num_requeues(&item)) {
                        warn!(event = %item, error = %err, "retryable failure; requeueing");
                        self.queue.add_rate_limited(item.clone());
                        self.bump(|stats| stats.requeued += 1);
                        metrics::reconcile_observed(item.kind.as_str(), "requeued");
                    } else {
                        error!(event = %item, error = %err, "retries exhausted; dropping");
                        self.recorder.record(
                            &item.key,
                            EventType::Warning,
                            REASON_RETRIES_EXHAUSTED,
                            &format!("dropped after {} attempts: {err}", self.queue.num_requeues(&item)),
                        );
                        self.queue.forget(&item);
                        self.bump(|stats| stats.dropped += 1);
                        metrics::reconcile_observed(item.kind.as_str(), "dropped");
                    }
                }
                Err(err) => {
                    error!(event = %item, error = %err, "terminal failure");
                    self.queue.forget(&item);
                    self.bump(|stats| stats.failed += 1);
                    metrics::reconcile_observed(item.kind.as_str(), "failed");
                }
            }
            self.queue.done(&item);
        }
        debug!(worker_id, "routing worker stopped");
    }

    fn bump(&self, apply: impl FnOnce(&mut RoutingStats)) {
        apply(&mut self.stats.lock().expect("stats lock poisoned"));
    }

    async fn sync(&self, item: &KeyedEvent) -> Result<(), RoutingError> {
        match item.kind {
            EventKind::CreateScheduler => self.sync_create_scheduler(&item.key).await,
            EventKind::UpdateScheduler => self.sync_update_scheduler(&item.key).await,
            EventKind::DeleteScheduler => self.sync_delete_scheduler(&item.key).await,
            EventKind::AddCluster | EventKind::UpdateCluster => {
                self.sync_home_cluster(&item.key).await
            }
            EventKind::DeleteCluster => self.sync_delete_cluster(&item.key).await,
        }
    }

    // ========================================================================
    // Scheduler lifecycle
    // ========================================================================

    async fn sync_create_scheduler(&self, key: &ResourceKey) -> Result<(), RoutingError> {
        let scheduler = match self.schedulers.get(key).await {
            Ok(scheduler) => scheduler,
            Err(err) if err.is_not_found() => {
                debug!(scheduler = %key, "scheduler gone before create processing");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        {
            let mut ring = self.ring.write().await;
            ring.add(&scheduler.name);
            metrics::set_ring_members(ring.len());
        }

        self.processes.launch(&scheduler.tag).await?;

        if scheduler.status != SchedulerStatus::Active {
            let mut updated = scheduler.clone();
            updated.status = SchedulerStatus::Active;
            self.schedulers.update(updated).await?;
        }

        self.recorder.record(
            key,
            EventType::Normal,
            REASON_SYNCED,
            "scheduler synced successfully",
        );
        Ok(())
    }

    async fn sync_update_scheduler(&self, key: &ResourceKey) -> Result<(), RoutingError> {
        let scheduler = match self.schedulers.get(key).await {
            Ok(scheduler) => scheduler,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        match scheduler.status {
            // A scheduler knocked back to pending is re-driven through the
            // create path; both steps are idempotent.
            SchedulerStatus::Pending => self.sync_create_scheduler(key).await,
            SchedulerStatus::Active => {
                let mut ring = self.ring.write().await;
                ring.add(&scheduler.name);
                metrics::set_ring_members(ring.len());
                Ok(())
            }
            // Deletion flow owns terminating schedulers.
            SchedulerStatus::Terminating => Ok(()),
        }
    }

    /// Re-home every orphaned cluster, then tear the scheduler down.
    ///
    /// Order matters: the name leaves the ring before any new home is
    /// computed, so a concurrent cluster event can never be routed to the
    /// dying scheduler. Each step tolerates re-processing after a partial
    /// failure.
    async fn sync_delete_scheduler(&self, key: &ResourceKey) -> Result<(), RoutingError> {
        let tombstone = self
            .scheduler_tombstones
            .lock()
            .expect("tombstone lock poisoned")
            .get(key)
            .cloned();

        // The tombstone's cluster list can be stale (clusters re-homed onto
        // this scheduler after its record was last written), so merge in a
        // scan for clusters that point at the dying scheduler.
        let mut orphans: Vec<ClusterRef> = tombstone
            .as_ref()
            .map(|scheduler| scheduler.clusters.clone())
            .unwrap_or_default();
        for cluster in self.clusters.list().await? {
            if cluster.home_scheduler == key.name
                && !orphans.iter().any(|c| c.name == cluster.name)
            {
                orphans.push(ClusterRef {
                    name: cluster.name.clone(),
                    namespace: cluster.namespace.clone(),
                    tenant: cluster.tenant.clone(),
                    ip_address: cluster.ip_address.clone(),
                });
            }
        }

        // Remove from the ring first; new homes are computed on the
        // post-removal ring. Removing an absent name is a no-op, which makes
        // retries safe.
        let rehomed: Vec<(ClusterRef, String)> = {
            let mut ring = self.ring.write().await;
            ring.remove(&key.name);
            metrics::set_ring_members(ring.len());
            orphans
                .into_iter()
                .map(|cluster_ref| {
                    let home = match ring.lookup(&cluster_ref.ip_address) {
                        Ok(owner) => owner.to_string(),
                        // Last scheduler going away: clusters become
                        // unassigned until a new one registers.
                        Err(RingError::NoMembers) => String::new(),
                    };
                    (cluster_ref, home)
                })
                .collect()
        };

        for (cluster_ref, new_home) in rehomed {
            let mut cluster = match self.clusters.get(&cluster_ref.key()).await {
                Ok(cluster) => cluster,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            };
            if cluster.home_scheduler == new_home {
                continue;
            }
            if new_home.is_empty() {
                warn!(cluster = %cluster.key(), "no scheduler left; cluster unassigned");
            }
            cluster.home_scheduler = new_home.clone();
            let cluster = self.clusters.update(cluster).await?;

            // Keep the new owner's record consistent with the assignment.
            if !new_home.is_empty() {
                self.attach_to_scheduler(&new_home, &cluster).await?;
            }
        }

        if let Some(scheduler) = &tombstone {
            self.processes.close(&scheduler.tag).await?;
        } else {
            warn!(scheduler = %key, "no tombstone for deleted scheduler; skipping worker close");
        }

        match self.schedulers.delete(key).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        self.scheduler_tombstones
            .lock()
            .expect("tombstone lock poisoned")
            .remove(key);

        self.recorder.record(
            key,
            EventType::Normal,
            REASON_SYNCED,
            "scheduler deleted; owned clusters re-homed",
        );
        Ok(())
    }

    // ========================================================================
    // Cluster homing
    // ========================================================================

    /// Add/Update path: stamp the ring owner on the cluster and keep both the
    /// old and new owner's records consistent. An update whose home did not
    /// change degrades to refreshing the owner's cluster entry.
    async fn sync_home_cluster(&self, key: &ResourceKey) -> Result<(), RoutingError> {
        let cluster = match self.clusters.get(key).await {
            Ok(cluster) => cluster,
            Err(err) if err.is_not_found() => {
                debug!(cluster = %key, "cluster gone before homing");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let home = match self.ring.read().await.lookup(&cluster.ip_address) {
            Ok(owner) => owner.to_string(),
            Err(RingError::NoMembers) => return Err(RoutingError::RingEmpty),
        };

        let cluster = if cluster.home_scheduler != home {
            let previous_home = cluster.home_scheduler.clone();
            let mut updated = cluster;
            updated.home_scheduler = home.clone();
            let updated = self.clusters.update(updated).await?;

            // The ip address is stable, so in practice this only fires when
            // the previous home was removed from the ring; run the
            // delete-side bookkeeping for it regardless.
            if !previous_home.is_empty() {
                self.detach_from_scheduler(&previous_home, &updated).await?;
            }
            updated
        } else {
            cluster
        };

        self.attach_to_scheduler(&home, &cluster).await?;

        self.recorder.record(
            key,
            EventType::Normal,
            REASON_SYNCED,
            "cluster synced successfully",
        );
        Ok(())
    }

    async fn sync_delete_cluster(&self, key: &ResourceKey) -> Result<(), RoutingError> {
        let tombstone = self
            .cluster_tombstones
            .lock()
            .expect("tombstone lock poisoned")
            .get(key)
            .cloned();
        let cluster = match tombstone {
            Some(cluster) => cluster,
            // Delete processed without a tombstone (e.g. after restart):
            // nothing left to unwind.
            None => match self.clusters.get(key).await {
                Ok(cluster) => cluster,
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err.into()),
            },
        };

        if cluster.has_home() {
            self.detach_from_scheduler(&cluster.home_scheduler, &cluster)
                .await?;
        }

        self.cluster_tombstones
            .lock()
            .expect("tombstone lock poisoned")
            .remove(key);

        self.recorder.record(
            key,
            EventType::Normal,
            REASON_SYNCED,
            "cluster removed from its home scheduler",
        );
        Ok(())
    }

    /// Append the cluster to the scheduler's owned list and fold its envelope
    /// into the union. No-op when already attached, so retries do not double
    /// count.
    async fn attach_to_scheduler(
        &self,
        scheduler_name: &str,
        cluster: &Cluster,
    ) -> Result<(), RoutingError> {
        let scheduler_key = ResourceKey::system(scheduler_name);
        let mut scheduler = match self.schedulers.get(&scheduler_key).await {
            Ok(scheduler) => scheduler,
            Err(err) if err.is_not_found() => {
                // Ring membership outlived the record; retry until the view
                // converges.
                return Err(RoutingError::MissingScheduler {
                    name: scheduler_name.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        if scheduler.attach_cluster(cluster) {
            scheduler.union.merge(&cluster.resources);
            self.schedulers.update(scheduler).await?;
        }
        Ok(())
    }

    /// Remove the cluster from the scheduler's owned list and subtract its
    /// envelope. Missing scheduler or already-detached cluster are successes.
    async fn detach_from_scheduler(
        &self,
        scheduler_name: &str,
        cluster: &Cluster,
    ) -> Result<(), RoutingError> {
        let scheduler_key = ResourceKey::system(scheduler_name);
        let mut scheduler = match self.schedulers.get(&scheduler_key).await {
            Ok(scheduler) => scheduler,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if scheduler.detach_cluster(&cluster.name) {
            scheduler.union.subtract(&cluster.resources);
            self.schedulers.update(scheduler).await?;
        }
        Ok(())
    }
}
