//! Tessera - Kubernetes operator core for stateful database clusters
//!
//! Tessera watches `DatabaseCluster` resources and keeps their members
//! schedulable. Two pieces live here:
//!
//! - a level-triggered reconcile loop: a deduplicating, rate-limited work
//!   queue drained by a fixed worker pool
//! - the orphaned volume remediator, which marks members for replacement
//!   when the node their local volume is pinned to has disappeared
//!
//! plus the bootstrap gate used by readiness probes on database nodes.
//!
//! # Modules
//!
//! - [`crd`] - The DatabaseCluster custom resource
//! - [`naming`] - Deterministic member, claim and Service names
//! - [`cache`] - Read-only cached view of cluster objects and the watches feeding it
//! - [`client`] - Live Kubernetes calls (node re-list, Service label patch)
//! - [`affinity`] - PersistentVolume node affinity evaluation
//! - [`queue`] - Work queue with per-key backoff
//! - [`controller`] - Worker pool and reconcilers
//! - [`bootstrap`] - Bootstrap completion gate
//! - [`config`] - Controller settings
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod affinity;
pub mod bootstrap;
pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod naming;
pub mod queue;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every patch the operator sends
pub const FIELD_MANAGER: &str = "tessera-controller";
