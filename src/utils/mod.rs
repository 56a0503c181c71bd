//! Common utilities

pub mod backoff;

pub use backoff::BackoffConfig;
