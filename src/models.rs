// Core data structures shared by the routing, collector, and dispatcher subsystems

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Tenant name under which cluster-scoped resources live.
pub const SYSTEM_TENANT: &str = "system";

/// Default namespace for system-tenant resources.
pub const SYSTEM_NAMESPACE: &str = "default";

// ============================================================================
// Resource Keys
// ============================================================================

/// Identity of a stored object: `tenant/namespace/name`, rendered without the
/// tenant segment when the tenant is "system".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    /// Create a key with an explicit tenant
    pub fn new(
        tenant: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a system-tenant key in the default namespace
    pub fn system(name: impl Into<String>) -> Self {
        Self::new(SYSTEM_TENANT, SYSTEM_NAMESPACE, name)
    }

    /// Parse a `tenant/namespace/name` or `namespace/name` key string
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Some(Self::new(SYSTEM_TENANT, *namespace, *name))
            }
            [tenant, namespace, name]
                if !tenant.is_empty() && !namespace.is_empty() && !name.is_empty() =>
            {
                Some(Self::new(*tenant, *namespace, *name))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tenant == SYSTEM_TENANT {
            write!(f, "{}/{}", self.namespace, self.name)
        } else {
            write!(f, "{}/{}/{}", self.tenant, self.namespace, self.name)
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Lifecycle status of a scheduler shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerStatus {
    /// Declared but its worker process has not been launched yet
    Pending,
    /// Worker process running, member of the routing ring
    Active,
    /// Deletion in progress, clusters being re-homed
    Terminating,
}

impl SchedulerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Terminating => "terminating",
        }
    }
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// Reference to a cluster owned by a scheduler, carrying enough identity to
/// address the cluster record during re-homing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub tenant: String,
    pub ip_address: String,
}

impl ClusterRef {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.tenant, &self.namespace, &self.name)
    }
}

/// A scheduler shard: one worker process owning a subset of clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scheduler {
    pub name: String,

    /// Tag handed to the process manager when launching the worker
    pub tag: String,

    /// Clusters currently homed on this scheduler, in assignment order
    #[serde(default)]
    pub clusters: Vec<ClusterRef>,

    #[serde(default)]
    pub status: SchedulerStatus,

    /// Aggregate resource envelope of all owned clusters
    #[serde(default)]
    pub union: ResourceUnion,

    #[serde(default)]
    pub resource_version: u64,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            clusters: Vec::new(),
            status: SchedulerStatus::Pending,
            union: ResourceUnion::default(),
            resource_version: 0,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::system(&self.name)
    }

    /// Record ownership of a cluster. Replaces any stale entry for the same
    /// name; returns true only when the cluster was not owned before, so
    /// callers can merge the union exactly once.
    pub fn attach_cluster(&mut self, cluster: &Cluster) -> bool {
        let cluster_ref = ClusterRef {
            name: cluster.name.clone(),
            namespace: cluster.namespace.clone(),
            tenant: cluster.tenant.clone(),
            ip_address: cluster.ip_address.clone(),
        };
        match self.clusters.iter_mut().find(|c| c.name == cluster.name) {
            Some(existing) => {
                *existing = cluster_ref;
                false
            }
            None => {
                self.clusters.push(cluster_ref);
                true
            }
        }
    }

    /// Drop ownership of a cluster; returns true if an entry was removed
    pub fn detach_cluster(&mut self, cluster_name: &str) -> bool {
        let before = self.clusters.len();
        self.clusters.retain(|c| c.name != cluster_name);
        self.clusters.len() != before
    }

    pub fn owns_cluster(&self, cluster_name: &str) -> bool {
        self.clusters.iter().any(|c| c.name == cluster_name)
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// A managed grouping of sites exposing a cluster-local API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub tenant: String,

    /// Stable address used as the routing hash key
    pub ip_address: String,

    /// Name of the scheduler currently responsible for this cluster.
    /// Empty before first assignment.
    #[serde(default)]
    pub home_scheduler: String,

    #[serde(default)]
    pub state: String,

    /// Resource envelope contributed to the home scheduler's union
    #[serde(default)]
    pub resources: ResourceUnion,

    #[serde(default)]
    pub resource_version: u64,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        ip_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            tenant: SYSTEM_TENANT.to_string(),
            ip_address: ip_address.into(),
            home_scheduler: String::new(),
            state: String::new(),
            resources: ResourceUnion::default(),
            resource_version: 0,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.tenant, &self.namespace, &self.name)
    }

    pub fn has_home(&self) -> bool {
        !self.home_scheduler.is_empty()
    }
}

// ============================================================================
// Resource Union
// ============================================================================

/// Aggregated resource envelope. On a cluster it describes the cluster's
/// capacity; on a scheduler it is the running union over all owned clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUnion {
    #[serde(default)]
    pub vcpus: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub volumes_gb: u64,
    #[serde(default)]
    pub eips: u64,
    #[serde(default)]
    pub regions: BTreeSet<String>,
    #[serde(default)]
    pub flavors: BTreeSet<String>,
}

impl ResourceUnion {
    /// Fold another envelope into this one
    pub fn merge(&mut self, other: &ResourceUnion) {
        self.vcpus += other.vcpus;
        self.memory_mb += other.memory_mb;
        self.volumes_gb += other.volumes_gb;
        self.eips += other.eips;
        self.regions.extend(other.regions.iter().cloned());
        self.flavors.extend(other.flavors.iter().cloned());
    }

    /// Subtract an envelope previously merged in. Scalar fields saturate at
    /// zero; set fields are rebuilt by the caller when exactness matters.
    pub fn subtract(&mut self, other: &ResourceUnion) {
        self.vcpus = self.vcpus.saturating_sub(other.vcpus);
        self.memory_mb = self.memory_mb.saturating_sub(other.memory_mb);
        self.volumes_gb = self.volumes_gb.saturating_sub(other.volumes_gb);
        self.eips = self.eips.saturating_sub(other.eips);
    }

    pub fn is_empty(&self) -> bool {
        self.vcpus == 0 && self.memory_mb == 0 && self.volumes_gb == 0 && self.eips == 0
    }
}

// ============================================================================
// Sites
// ============================================================================

/// A leaf compute location over which scheduling occurs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: String,
    pub region: String,
    pub availability_zone: String,
}

impl Site {
    pub fn new(
        site_id: impl Into<String>,
        region: impl Into<String>,
        availability_zone: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            region: region.into(),
            availability_zone: availability_zone.into(),
        }
    }

    /// Zone key used for grouping: `region/availability_zone`
    pub fn zone_key(&self) -> String {
        format!("{}/{}", self.region, self.availability_zone)
    }
}

/// A region with the availability zones observed in the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudRegion {
    pub region: String,
    pub availability_zones: Vec<String>,
}

// ============================================================================
// Workloads
// ============================================================================

/// Scheduling outcome carried on a workload: the site it was placed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selected {
    pub site_id: String,
    pub region: String,
    pub availability_zone: String,
    #[serde(default)]
    pub flavor_id: String,
}

/// Per-workload resource demand counted against the selected site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub vcpus: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub volume_gb: u64,
    #[serde(default)]
    pub eip: bool,
}

/// Coarse workload lifecycle as seen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadPhase {
    Pending,
    Bound,
    Running,
    Failed,
}

impl Default for WorkloadPhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// A schedulable unit. The opaque spec is carried through untouched; the
/// control plane only reads identity, placement, and phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub uid: String,
    pub pod_name: String,
    pub namespace: String,
    #[serde(default)]
    pub tenant: String,

    /// Placement decision; absent until a scheduler cycle selects a site
    #[serde(default)]
    pub selected: Option<Selected>,

    /// Target cluster once bound
    #[serde(default)]
    pub cluster_name: String,

    /// Instance id returned by the cluster-local API once created
    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub phase: WorkloadPhase,

    /// Set when the workload is being torn down
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub resources: ResourceRequest,

    /// Opaque spec forwarded to the cluster-local API
    #[serde(default)]
    pub spec: serde_json::Value,

    #[serde(default)]
    pub resource_version: u64,
}

impl Workload {
    pub fn new(uid: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            pod_name: pod_name.into(),
            namespace: SYSTEM_NAMESPACE.to_string(),
            tenant: SYSTEM_TENANT.to_string(),
            selected: None,
            cluster_name: String::new(),
            hostname: String::new(),
            phase: WorkloadPhase::Pending,
            deletion_timestamp: None,
            resources: ResourceRequest::default(),
            spec: serde_json::Value::Null,
            resource_version: 0,
        }
    }

    /// Cache key for the workload table and assumed set
    pub fn cache_key(&self) -> &str {
        &self.uid
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.tenant, &self.namespace, &self.pod_name)
    }

    pub fn is_bound(&self) -> bool {
        !self.cluster_name.is_empty()
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

// ============================================================================
// Dispatchers
// ============================================================================

/// A cluster owned by a dispatcher, with the address of its local API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBinding {
    pub name: String,
    pub ip: String,
}

/// Dispatcher identity and its owned cluster set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherResource {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub tenant: String,

    #[serde(default)]
    pub clusters: Vec<ClusterBinding>,

    #[serde(default)]
    pub resource_version: u64,
}

impl DispatcherResource {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            tenant: SYSTEM_TENANT.to_string(),
            clusters: Vec::new(),
            resource_version: 0,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.tenant, &self.namespace, &self.name)
    }

    pub fn owns_cluster(&self, cluster_name: &str) -> bool {
        self.clusters.iter().any(|c| c.name == cluster_name)
    }
}
