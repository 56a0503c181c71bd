//! Cluster-to-scheduler routing core
//!
//! Maintains a consistent mapping from member clusters to a dynamic set of
//! scheduler shards. Store events flow through a de-duplicating
//! [`WorkQueue`] into the [`RoutingController`], which keeps the
//! [`HashRing`] in step with scheduler lifecycle and stamps every cluster's
//! `home_scheduler` with its ring owner.
//!
//! ```text
//!  scheduler/cluster watches ──▶ WorkQueue ──▶ worker pool
//!                                                 │
//!                              HashRing ◀── dispatch ──▶ store updates
//!                                                 │
//!                                          ProcessManager
//! ```
//!
//! After the controller quiesces on any finite event sequence, every cluster's
//! `home_scheduler` equals `ring.lookup(cluster.ip_address)`.

pub mod process;
pub mod reconciler;
pub mod recorder;
pub mod ring;
pub mod workqueue;

pub use process::{ProcessError, ProcessManager, RecordingProcessManager, ShellProcessManager};
pub use reconciler::{RoutingConfig, RoutingController, RoutingStats};
pub use recorder::{EventSink, EventType, LogEventSink, RecordingEventSink};
pub use ring::{HashRing, RingError};
pub use workqueue::WorkQueue;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ResourceKey;
use crate::store::StoreError;

/// The kind of lifecycle event carried on a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CreateScheduler,
    UpdateScheduler,
    DeleteScheduler,
    AddCluster,
    UpdateCluster,
    DeleteCluster,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateScheduler => "create_scheduler",
            Self::UpdateScheduler => "update_scheduler",
            Self::DeleteScheduler => "delete_scheduler",
            Self::AddCluster => "add_cluster",
            Self::UpdateCluster => "update_cluster",
            Self::DeleteCluster => "delete_cluster",
        }
    }
}

/// A work item: one lifecycle event for one object. De-duplication in the
/// queue is on the whole pair, so a create and an update for the same key can
/// coexist while two updates coalesce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyedEvent {
    pub kind: EventKind,
    pub key: ResourceKey,
}

impl KeyedEvent {
    pub fn new(kind: EventKind, key: ResourceKey) -> Self {
        Self { kind, key }
    }
}

impl std::fmt::Display for KeyedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind.as_str(), self.key)
    }
}

/// Errors surfaced while reconciling routing state
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    /// No scheduler is available to home a cluster; clears once one comes up
    #[error("hash ring has no members")]
    RingEmpty,

    /// The ring owns a name whose scheduler record is missing from the store
    #[error("scheduler record '{name}' not found while homing a cluster")]
    MissingScheduler { name: String },
}

impl RoutingError {
    /// Whether requeueing with backoff is the right reaction
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            // Worker scripts are retried; a broken script shows up as
            // exhausted retries on the owning object.
            Self::Process(_) => true,
            Self::RingEmpty => true,
            Self::MissingScheduler { .. } => true,
        }
    }
}
