//! Custom Resource Definitions for Tessera

mod cluster;

pub use cluster::{DatabaseCluster, DatabaseClusterSpec, RackSpec};
