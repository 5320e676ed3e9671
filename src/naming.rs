//! Deterministic names for cluster members and the objects that back them
//!
//! Member names are never stored. Every reconciliation pass recomputes them
//! from (cluster, datacenter, rack, ordinal), so lookups stay idempotent.

use std::fmt;

/// Label key set on the member Service to request replacement
pub const REPLACE_LABEL: &str = "tessera.dev/replace";

/// Label key naming the owning cluster on PVCs and Services
pub const CLUSTER_NAME_LABEL: &str = "tessera.dev/cluster";

/// Volume claim template name used by member StatefulSets
pub const DATA_VOLUME_NAME: &str = "data";

/// Queue key identifying one DatabaseCluster
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    /// Namespace of the cluster
    pub namespace: String,
    /// Name of the cluster
    pub name: String,
}

impl ClusterKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One addressable cluster member
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemberIdentity {
    /// Owning cluster name
    pub cluster: String,
    /// Datacenter name
    pub datacenter: String,
    /// Rack name
    pub rack: String,
    /// Ordinal within the rack
    pub ordinal: u32,
}

impl MemberIdentity {
    /// Member name: `<cluster>-<datacenter>-<rack>-<ordinal>`
    pub fn name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.cluster, self.datacenter, self.rack, self.ordinal
        )
    }

    /// Name of the member's data PVC (`data-<member>`)
    pub fn claim_name(&self) -> String {
        format!("{}-{}", DATA_VOLUME_NAME, self.name())
    }

    /// Name of the Service fronting the member
    pub fn endpoint_name(&self) -> String {
        self.name()
    }
}
