//! Dispatcher fan-out to cluster-local APIs
//!
//! A sibling control loop to the routing core: it consumes the same store
//! event contract, watching for workloads whose binding just landed and
//! workloads being deleted, and forwards them to the owning cluster's local
//! API. See [`DispatcherProcess`] for the loop and [`ClusterGateway`] for the
//! egress seam.

pub mod client;
pub mod process;

pub use client::{ClusterGateway, GatewayError, HttpClusterGateway, Token};
pub use process::{DispatchError, DispatcherConfig, DispatcherProcess};
