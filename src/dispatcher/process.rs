//! Dispatcher fan-out loop
//!
//! One dispatcher process owns a subset of clusters. It watches workloads of
//! those clusters for two transitions: a binding landing (cluster assignment
//! appears) and a deletion. Both feed one bounded channel; a consumer drains
//! it and drives the cluster-local API, caching one bearer token per cluster
//! address.
//!
//! When the dispatcher's own record changes its cluster set, the running
//! workload watcher is stopped and a new one started with the new selector;
//! whatever the old watcher had not yet enqueued is picked up by the new
//! watcher's initial list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::client::{ClusterGateway, GatewayError, Token};
use crate::metrics;
use crate::models::{DispatcherResource, ResourceKey, Workload, WorkloadPhase};
use crate::store::{ObjectStore, StoreError, WatchEvent};

/// Configuration for a dispatcher process
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of the bounded fan-out channel
    pub queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { queue_size: 300 }
    }
}

/// Errors that prevent a dispatcher process from starting
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// One unit of fan-out work
#[derive(Debug, Clone)]
enum DispatchItem {
    Create(Workload),
    Delete(Workload),
}

impl DispatchItem {
    fn workload(&self) -> &Workload {
        match self {
            Self::Create(workload) | Self::Delete(workload) => workload,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Delete(_) => "delete",
        }
    }
}

/// Long-lived fan-out process bound to one dispatcher identity
pub struct DispatcherProcess {
    name: String,
    namespace: String,
    tenant: String,

    dispatchers: Arc<dyn ObjectStore<DispatcherResource>>,
    workloads: Arc<dyn ObjectStore<Workload>>,
    gateway: Arc<dyn ClusterGateway>,
    config: DispatcherConfig,

    queue_tx: mpsc::Sender<DispatchItem>,
    queue_rx: Mutex<Option<mpsc::Receiver<DispatchItem>>>,

    /// Cluster name → cluster-local API address, from the dispatcher record
    cluster_ips: RwLock<HashMap<String, String>>,

    /// Cluster address → cached bearer token. Initialized at construction.
    tokens: Mutex<HashMap<String, Token>>,
}

impl DispatcherProcess {
    /// Build a process for the named dispatcher, loading its current cluster
    /// set from the store.
    pub async fn new(
        key: ResourceKey,
        dispatchers: Arc<dyn ObjectStore<DispatcherResource>>,
        workloads: Arc<dyn ObjectStore<Workload>>,
        gateway: Arc<dyn ClusterGateway>,
        config: DispatcherConfig,
    ) -> Result<Arc<Self>, DispatchError> {
        let record = dispatchers.get(&key).await?;
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_size.max(1));

        let process = Arc::new(Self {
            name: key.name,
            namespace: key.namespace,
            tenant: key.tenant,
            dispatchers,
            workloads,
            gateway,
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            cluster_ips: RwLock::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        });
        process.apply_membership(&record).await;
        Ok(process)
    }

    fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.tenant, &self.namespace, &self.name)
    }

    async fn apply_membership(&self, record: &DispatcherResource) {
        let mut ips = self.cluster_ips.write().await;
        ips.clear();
        for binding in &record.clusters {
            ips.insert(binding.name.clone(), binding.ip.clone());
        }
        info!(
            dispatcher = %self.name,
            clusters = ips.len(),
            "dispatcher cluster membership loaded"
        );
    }

    async fn owned_clusters(&self) -> HashSet<String> {
        self.cluster_ips.read().await.keys().cloned().collect()
    }

    /// Run watchers and the delivery loop until `stop` fires or the
    /// dispatcher record is deleted.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let queue_rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .expect("dispatcher process started twice");

        // The consumer stops on this internal signal so the record-deleted
        // path can wind it down without the external stop ever firing.
        let (consumer_stop_tx, consumer_stop_rx) = watch::channel(false);
        let consumer = tokio::spawn(Arc::clone(&self).consume(queue_rx, consumer_stop_rx));

        // Subscribe first, then reload the record: a membership change landing
        // between construction and this point is reflected in the fresh get,
        // later ones arrive on the stream.
        let mut dispatcher_events = self.dispatchers.watch();
        match self.dispatchers.get(&self.key()).await {
            Ok(record) => self.apply_membership(&record).await,
            Err(err) => warn!(dispatcher = %self.name, error = %err, "failed to reload dispatcher record"),
        }

        // First-generation workload watcher.
        let (mut watcher_stop_tx, watcher_stop_rx) = watch::channel(false);
        let mut watcher = tokio::spawn(
            Arc::clone(&self).watch_workloads(self.owned_clusters().await, watcher_stop_rx),
        );
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = dispatcher_events.recv() => match event {
                    Ok(WatchEvent::Deleted(record)) if record.key() == self.key() => {
                        info!(dispatcher = %self.name, "dispatcher record deleted; shutting down");
                        break;
                    }
                    Ok(WatchEvent::Modified { old, new }) if new.key() == self.key() => {
                        if old.clusters == new.clusters {
                            continue;
                        }
                        info!(dispatcher = %self.name, "cluster set changed; restarting watchers");
                        self.apply_membership(&new).await;

                        // Close the old watcher's stop channel and start a
                        // fresh one against the new selector.
                        let _ = watcher_stop_tx.send(true);
                        let _ = watcher.await;
                        let (new_stop_tx, new_stop_rx) = watch::channel(false);
                        watcher_stop_tx = new_stop_tx;
                        watcher = tokio::spawn(
                            Arc::clone(&self)
                                .watch_workloads(self.owned_clusters().await, new_stop_rx),
                        );
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "dispatcher watch lagged; reloading record");
                        if let Ok(record) = self.dispatchers.get(&self.key()).await {
                            self.apply_membership(&record).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        let _ = watcher_stop_tx.send(true);
        let _ = watcher.await;
        let _ = consumer_stop_tx.send(true);
        let _ = consumer.await;
    }

    // ========================================================================
    // Watchers
    // ========================================================================

    /// Watch bound/deleted workloads of the owned clusters. The initial list
    /// catches workloads that bound while no watcher was running.
    async fn watch_workloads(
        self: Arc<Self>,
        owned: HashSet<String>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut events = self.workloads.watch();

        match self.workloads.list().await {
            Ok(list) => {
                for workload in list {
                    if !owned.contains(&workload.cluster_name) {
                        continue;
                    }
                    if workload.marked_for_deletion() {
                        self.enqueue(DispatchItem::Delete(workload)).await;
                    } else if workload.phase == WorkloadPhase::Bound {
                        self.enqueue(DispatchItem::Create(workload)).await;
                    }
                }
            }
            Err(err) => warn!(error = %err, "initial workload list failed"),
        }

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Ok(WatchEvent::Modified { old, new }) if owned.contains(&new.cluster_name) => {
                        if !old.is_bound() && new.is_bound() {
                            self.enqueue(DispatchItem::Create(new)).await;
                        } else if new.marked_for_deletion() && !old.marked_for_deletion() {
                            self.enqueue(DispatchItem::Delete(new)).await;
                        }
                    }
                    Ok(WatchEvent::Deleted(workload))
                        if owned.contains(&workload.cluster_name) && workload.is_bound() =>
                    {
                        self.enqueue(DispatchItem::Delete(workload)).await;
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "workload watch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!(dispatcher = %self.name, "workload watcher stopped");
    }

    async fn enqueue(&self, item: DispatchItem) {
        if self.queue_tx.send(item).await.is_err() {
            warn!(dispatcher = %self.name, "fan-out channel closed; dropping item");
        }
        metrics::set_dispatch_queue_depth(
            self.config.queue_size.saturating_sub(self.queue_tx.capacity()),
        );
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    async fn consume(
        self: Arc<Self>,
        mut queue_rx: mpsc::Receiver<DispatchItem>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                item = queue_rx.recv() => {
                    let Some(item) = item else { break };
                    metrics::set_dispatch_queue_depth(
                        self.config.queue_size.saturating_sub(self.queue_tx.capacity()),
                    );
                    self.deliver(item).await;
                }
            }
        }
        debug!(dispatcher = %self.name, "delivery loop stopped");
    }

    async fn deliver(&self, item: DispatchItem) {
        let operation = item.operation();
        let workload = item.workload();

        let Some(host) = self
            .cluster_ips
            .read()
            .await
            .get(&workload.cluster_name)
            .cloned()
        else {
            warn!(
                workload = %workload.pod_name,
                cluster = %workload.cluster_name,
                "no address for target cluster; dropping"
            );
            metrics::dispatch_observed(operation, "no_host");
            return;
        };

        let token = match self.get_token(&host).await {
            Ok(token) => token,
            Err(err) => {
                warn!(host = %host, error = %err, "failed to get token for cluster");
                metrics::dispatch_observed(operation, "token_error");
                return;
            }
        };

        match item {
            DispatchItem::Delete(workload) => {
                match self
                    .gateway
                    .delete_instance(&host, &token, &workload.hostname)
                    .await
                {
                    Ok(()) => {
                        debug!(workload = %workload.pod_name, host = %host, "deletion request sent");
                        metrics::dispatch_observed(operation, "ok");
                    }
                    Err(err) => {
                        warn!(workload = %workload.pod_name, error = %err, "failed to delete instance");
                        metrics::dispatch_observed(operation, "error");
                    }
                }
            }
            DispatchItem::Create(workload) => {
                match self.gateway.server_create(&host, &token, &workload.spec).await {
                    Ok(instance_id) => {
                        debug!(workload = %workload.pod_name, host = %host, instance_id = %instance_id, "creation request sent");
                        self.record_creation(&workload, instance_id).await;
                        metrics::dispatch_observed(operation, "ok");
                    }
                    Err(err) => {
                        warn!(workload = %workload.pod_name, error = %err, "failed to create instance");
                        metrics::dispatch_observed(operation, "error");
                    }
                }
            }
        }
    }

    /// Persist the returned instance id and mark the workload running
    async fn record_creation(&self, workload: &Workload, instance_id: String) {
        // Refetch for a current resource version; our copy came off the watch.
        match self.workloads.get(&workload.key()).await {
            Ok(mut fresh) => {
                fresh.hostname = instance_id;
                fresh.phase = WorkloadPhase::Running;
                if let Err(err) = self.workloads.update(fresh).await {
                    warn!(workload = %workload.pod_name, error = %err, "failed to persist instance id");
                }
            }
            Err(err) => {
                warn!(workload = %workload.pod_name, error = %err, "workload gone before status update");
            }
        }
    }

    /// Cached token for a cluster address, refreshed when expired
    async fn get_token(&self, host: &str) -> Result<String, GatewayError> {
        {
            let tokens = self.tokens.lock().await;
            if let Some(token) = tokens.get(host) {
                if !self.gateway.token_expired(token, host) {
                    return Ok(token.value.clone());
                }
            }
        }

        let token = self.gateway.request_token(host).await?;
        let value = token.value.clone();
        self.tokens.lock().await.insert(host.to_string(), token);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClusterBinding;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    /// Gateway double that records calls and mints counted tokens
    #[derive(Default)]
    struct MockGateway {
        creates: std::sync::Mutex<Vec<(String, String)>>,
        deletes: std::sync::Mutex<Vec<(String, String)>>,
        token_requests: AtomicU64,
        instance_counter: AtomicU64,
        token_ttl_secs: i64,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                token_ttl_secs: 3600,
                ..Self::default()
            }
        }

        fn with_token_ttl(ttl_secs: i64) -> Self {
            Self {
                token_ttl_secs: ttl_secs,
                ..Self::default()
            }
        }

        fn creates(&self) -> Vec<(String, String)> {
            self.creates.lock().unwrap().clone()
        }

        fn deletes(&self) -> Vec<(String, String)> {
            self.deletes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClusterGateway for MockGateway {
        async fn server_create(
            &self,
            host: &str,
            _token: &str,
            spec: &serde_json::Value,
        ) -> Result<String, GatewayError> {
            let id = format!(
                "instance-{}",
                self.instance_counter.fetch_add(1, Ordering::SeqCst)
            );
            self.creates
                .lock()
                .unwrap()
                .push((host.to_string(), spec.to_string()));
            Ok(id)
        }

        async fn delete_instance(
            &self,
            host: &str,
            _token: &str,
            hostname: &str,
        ) -> Result<(), GatewayError> {
            self.deletes
                .lock()
                .unwrap()
                .push((host.to_string(), hostname.to_string()));
            Ok(())
        }

        async fn request_token(&self, _host: &str) -> Result<Token, GatewayError> {
            let count = self.token_requests.fetch_add(1, Ordering::SeqCst);
            Ok(Token {
                value: format!("token-{count}"),
                expires_at: Utc::now() + chrono::Duration::seconds(self.token_ttl_secs),
            })
        }

        fn token_expired(&self, token: &Token, _host: &str) -> bool {
            token.expires_at <= Utc::now()
        }
    }

    struct Harness {
        dispatchers: Arc<MemoryStore<DispatcherResource>>,
        workloads: Arc<MemoryStore<Workload>>,
        gateway: Arc<MockGateway>,
        process: Arc<DispatcherProcess>,
        stop_tx: watch::Sender<bool>,
        run: tokio::task::JoinHandle<()>,
    }

    async fn start(gateway: MockGateway, clusters: Vec<(&str, &str)>) -> Harness {
        let dispatchers = Arc::new(MemoryStore::new());
        let workloads = Arc::new(MemoryStore::new());
        let gateway = Arc::new(gateway);

        let mut record = DispatcherResource::new("dispatch-0", "default");
        record.clusters = clusters
            .into_iter()
            .map(|(name, ip)| ClusterBinding {
                name: name.to_string(),
                ip: ip.to_string(),
            })
            .collect();
        let record = dispatchers.create(record).await.unwrap();

        let process = DispatcherProcess::new(
            record.key(),
            Arc::clone(&dispatchers) as Arc<dyn ObjectStore<DispatcherResource>>,
            Arc::clone(&workloads) as Arc<dyn ObjectStore<Workload>>,
            Arc::clone(&gateway) as Arc<dyn ClusterGateway>,
            DispatcherConfig::default(),
        )
        .await
        .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let run = {
            let process = Arc::clone(&process);
            tokio::spawn(async move { process.run(stop_rx).await })
        };

        Harness {
            dispatchers,
            workloads,
            gateway,
            process,
            stop_tx,
            run,
        }
    }

    async fn stop(harness: Harness) {
        harness.stop_tx.send(true).unwrap();
        harness.run.await.unwrap();
    }

    fn bound_workload(uid: &str, cluster: &str) -> Workload {
        let mut workload = Workload::new(uid, format!("pod-{uid}"));
        workload.cluster_name = cluster.to_string();
        workload.phase = WorkloadPhase::Bound;
        workload.spec = serde_json::json!({"image": "nginx"});
        workload
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_binding_transition_creates_instance() {
        let h = start(MockGateway::new(), vec![("c1", "10.0.0.9")]).await;

        // Workload appears unbound, then the binding lands.
        let pending = {
            let mut w = bound_workload("w1", "");
            w.phase = WorkloadPhase::Pending;
            h.workloads.create(w).await.unwrap()
        };
        let mut bound = pending.clone();
        bound.cluster_name = "c1".to_string();
        bound.phase = WorkloadPhase::Bound;
        h.workloads.update(bound).await.unwrap();

        let gateway = Arc::clone(&h.gateway);
        eventually(move || !gateway.creates().is_empty()).await;
        assert_eq!(h.gateway.creates()[0].0, "10.0.0.9");

        // The consumer persists hostname and phase.
        let key = ResourceKey::new("system", "default", "pod-w1");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stored = h.workloads.get(&key).await.unwrap();
            if stored.phase == WorkloadPhase::Running && !stored.hostname.is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "workload status never persisted"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        stop(h).await;
    }

    #[tokio::test]
    async fn test_bound_workload_picked_up_by_initial_list() {
        // The workload is already bound before the process starts.
        let h = start(MockGateway::new(), vec![("c1", "10.0.0.9")]).await;
        h.workloads
            .create(bound_workload("w1", "c1"))
            .await
            .unwrap();

        // Watcher restart (via membership change) triggers a fresh list; but
        // even without it, the initial list at startup raced the create, so
        // drive a restart to make the test deterministic.
        let mut record = h
            .dispatchers
            .get(&ResourceKey::new("system", "default", "dispatch-0"))
            .await
            .unwrap();
        record.clusters.push(ClusterBinding {
            name: "c2".to_string(),
            ip: "10.0.0.10".to_string(),
        });
        h.dispatchers.update(record).await.unwrap();

        let gateway = Arc::clone(&h.gateway);
        eventually(move || !gateway.creates().is_empty()).await;

        stop(h).await;
    }

    #[tokio::test]
    async fn test_deletion_fans_out_delete_instance() {
        let h = start(MockGateway::new(), vec![("c1", "10.0.0.9")]).await;

        let mut workload = bound_workload("w1", "c1");
        workload.phase = WorkloadPhase::Running;
        workload.hostname = "instance-7".to_string();
        let created = h.workloads.create(workload).await.unwrap();

        let mut deleting = created.clone();
        deleting.deletion_timestamp = Some(Utc::now());
        h.workloads.update(deleting).await.unwrap();

        let gateway = Arc::clone(&h.gateway);
        eventually(move || !gateway.deletes().is_empty()).await;
        assert_eq!(
            h.gateway.deletes()[0],
            ("10.0.0.9".to_string(), "instance-7".to_string())
        );

        stop(h).await;
    }

    #[tokio::test]
    async fn test_workloads_of_unowned_clusters_ignored() {
        let h = start(MockGateway::new(), vec![("c1", "10.0.0.9")]).await;

        let pending = {
            let mut w = bound_workload("w1", "");
            w.phase = WorkloadPhase::Pending;
            h.workloads.create(w).await.unwrap()
        };
        let mut bound = pending.clone();
        bound.cluster_name = "other-cluster".to_string();
        bound.phase = WorkloadPhase::Bound;
        h.workloads.update(bound).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.gateway.creates().is_empty());

        stop(h).await;
    }

    #[tokio::test]
    async fn test_token_cached_across_deliveries() {
        let h = start(MockGateway::new(), vec![("c1", "10.0.0.9")]).await;

        for uid in ["w1", "w2"] {
            let pending = {
                let mut w = bound_workload(uid, "");
                w.phase = WorkloadPhase::Pending;
                h.workloads.create(w).await.unwrap()
            };
            let mut bound = pending.clone();
            bound.cluster_name = "c1".to_string();
            bound.phase = WorkloadPhase::Bound;
            h.workloads.update(bound).await.unwrap();
        }

        let gateway = Arc::clone(&h.gateway);
        eventually(move || gateway.creates().len() == 2).await;
        assert_eq!(h.gateway.token_requests.load(Ordering::SeqCst), 1);

        stop(h).await;
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        // Tokens expire immediately, so every delivery requests a new one.
        let h = start(MockGateway::with_token_ttl(-1), vec![("c1", "10.0.0.9")]).await;

        for uid in ["w1", "w2"] {
            let pending = {
                let mut w = bound_workload(uid, "");
                w.phase = WorkloadPhase::Pending;
                h.workloads.create(w).await.unwrap()
            };
            let mut bound = pending.clone();
            bound.cluster_name = "c1".to_string();
            bound.phase = WorkloadPhase::Bound;
            h.workloads.update(bound).await.unwrap();
        }

        let gateway = Arc::clone(&h.gateway);
        eventually(move || gateway.creates().len() == 2).await;
        assert_eq!(h.gateway.token_requests.load(Ordering::SeqCst), 2);

        stop(h).await;
    }

    #[tokio::test]
    async fn test_membership_change_restarts_watcher() {
        let h = start(MockGateway::new(), vec![("c1", "10.0.0.9")]).await;

        // Workload bound to a cluster this dispatcher does not own yet.
        h.workloads
            .create(bound_workload("w1", "c2"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.gateway.creates().is_empty());

        // Hand c2 to this dispatcher; the restarted watcher's list picks the
        // bound workload up.
        let mut record = h
            .dispatchers
            .get(&ResourceKey::new("system", "default", "dispatch-0"))
            .await
            .unwrap();
        record.clusters.push(ClusterBinding {
            name: "c2".to_string(),
            ip: "10.0.0.10".to_string(),
        });
        h.dispatchers.update(record).await.unwrap();

        let gateway = Arc::clone(&h.gateway);
        eventually(move || !gateway.creates().is_empty()).await;
        assert_eq!(h.gateway.creates()[0].0, "10.0.0.10");
        assert!(h.process.owned_clusters().await.contains("c2"));

        stop(h).await;
    }
}
