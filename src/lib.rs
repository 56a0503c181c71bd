//! haneul - Global-Scheduler Control Plane Core
//!
//! A control plane for multi-cluster workload orchestration, built from two
//! tightly-coupled subsystems: a routing core that keeps every member cluster
//! homed on exactly one scheduler shard via consistent hashing, and a
//! collector cache that gives scheduler cycles a coherent, cheaply-refreshed
//! view of every site's resource state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Routing Core                          │
//! │  ┌───────────┐   ┌───────────┐   ┌───────────────────────┐  │
//! │  │ WorkQueue │──▶│ Reconciler│──▶│ HashRing / Processes  │  │
//! │  └─────▲─────┘   └─────┬─────┘   └───────────────────────┘  │
//! │        │               │ store updates (home_scheduler)     │
//! └────────┼───────────────┼─────────────────────────────────────┘
//!          │ watch events  │
//!   ┌──────┴───────────────▼──────┐      ┌────────────────────┐
//!   │     watch-capable store     │─────▶│ Dispatcher fan-out │
//!   └──────┬──────────────────────┘      └────────────────────┘
//!          │ site / workload / pool events
//! ┌────────▼─────────────────────────────────────────────────────┐
//! │                       Collector Cache                        │
//! │   SiteCache ── MRU + generations ──▶ Snapshot ──▶ scheduler  │
//! │       │                                             cycles   │
//! │   expiry sweep (assumed workloads)                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and identity keys
//! - [`store`] - Watch-capable object store abstraction
//! - [`routing`] - Consistent-hash routing core and reconciler
//! - [`collector`] - Site cache, snapshots, and resource accounting
//! - [`dispatcher`] - Fan-out of bound workloads to cluster-local APIs
//! - [`metrics`] - Prometheus metrics
//! - [`error`] - Unified error handling
//!
//! # Example
//!
//! ```no_run
//! use haneul::config::Config;
//! use haneul::routing::{LogEventSink, RecordingProcessManager, RoutingController};
//! use haneul::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let controller = RoutingController::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(RecordingProcessManager::new()),
//!         Arc::new(LogEventSink),
//!         config.routing_config(),
//!     );
//!     let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//!     controller.run(stop_rx).await;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod models;
pub mod routing;
pub mod store;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::collector::{CollectorConfig, FlavorRegistry, SiteCache, Snapshot};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{
        Cluster, ResourceKey, Scheduler, SchedulerStatus, Site, Workload, WorkloadPhase,
    };
    pub use crate::routing::{EventKind, HashRing, RoutingController, WorkQueue};
    pub use crate::store::{MemoryStore, ObjectStore, WatchEvent};
}

// Direct re-exports for convenience
pub use models::{Cluster, ResourceKey, Scheduler, Site, Workload};
