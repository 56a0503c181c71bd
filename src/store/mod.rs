//! Watch-capable object store abstraction
//!
//! The control plane treats its durable store as an event source plus a
//! per-key strongly-consistent read/write surface. The [`ObjectStore`] trait
//! is the seam: the binary wires in [`MemoryStore`]; a deployment against a
//! real API server implements the same trait.
//!
//! Updates are compare-and-swap on `resource_version`; a mismatch surfaces as
//! [`StoreError::Conflict`], which callers treat as transient (refetch and
//! retry with backoff).

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{Cluster, DispatcherResource, ResourceKey, Scheduler, Workload};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store operations
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: ResourceKey },

    #[error("object already exists: {key}")]
    AlreadyExists { key: ResourceKey },

    #[error("version conflict on {key}: stored {stored}, submitted {submitted}")]
    Conflict {
        key: ResourceKey,
        stored: u64,
        submitted: u64,
    },

    #[error("transient store error: {0}")]
    Transient(String),
}

impl StoreError {
    /// Whether a retry with backoff can be expected to succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// An object addressable by [`ResourceKey`] with CAS versioning
pub trait StoredObject: Clone + Send + Sync + 'static {
    fn object_key(&self) -> ResourceKey;
    fn resource_version(&self) -> u64;
    fn set_resource_version(&mut self, version: u64);
}

macro_rules! impl_stored_object {
    ($ty:ty) => {
        impl StoredObject for $ty {
            fn object_key(&self) -> ResourceKey {
                self.key()
            }
            fn resource_version(&self) -> u64 {
                self.resource_version
            }
            fn set_resource_version(&mut self, version: u64) {
                self.resource_version = version;
            }
        }
    };
}

impl_stored_object!(Scheduler);
impl_stored_object!(Cluster);
impl_stored_object!(Workload);
impl_stored_object!(DispatcherResource);

/// An event delivered on a watch stream. Modified events carry both sides of
/// the transition so consumers can diff without a local cache.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(T),
    Modified { old: T, new: T },
    Deleted(T),
}

impl<T> WatchEvent<T> {
    /// The object after the event (the final state for deletes)
    pub fn object(&self) -> &T {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Modified { new, .. } => new,
        }
    }
}

/// Per-resource-kind store surface with watch support
#[async_trait]
pub trait ObjectStore<T: StoredObject>: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> StoreResult<T>;

    /// Insert a new object; assigns its first resource version
    async fn create(&self, obj: T) -> StoreResult<T>;

    /// CAS update keyed on the submitted object's resource version
    async fn update(&self, obj: T) -> StoreResult<T>;

    async fn delete(&self, key: &ResourceKey) -> StoreResult<()>;

    async fn list(&self) -> StoreResult<Vec<T>>;

    /// Subscribe to the event stream. Events sent before the subscription are
    /// not replayed; callers list first when they need a complete view.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}
