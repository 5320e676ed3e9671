//! DatabaseCluster Custom Resource Definition
//!
//! A DatabaseCluster declares the rack topology of one database datacenter.
//! The operator core only reads it; members themselves are provisioned by a
//! separate controller.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::naming::{ClusterKey, MemberIdentity};

/// Specification for a DatabaseCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tessera.dev",
    version = "v1alpha1",
    kind = "DatabaseCluster",
    plural = "databaseclusters",
    shortname = "dbc",
    namespaced,
    printcolumn = r#"{"name":"Datacenter","type":"string","jsonPath":".spec.datacenter"}"#,
    printcolumn = r#"{"name":"Cleanup","type":"boolean","jsonPath":".spec.automaticOrphanedNodeCleanup"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    /// Datacenter name, part of every member's identity
    pub datacenter: String,

    /// Racks in declaration order
    #[serde(default)]
    pub racks: Vec<RackSpec>,

    /// Replace members whose volumes are pinned to nodes that no longer exist
    #[serde(default)]
    pub automatic_orphaned_node_cleanup: bool,
}

/// A named group of members sharing placement and storage
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RackSpec {
    /// Rack name
    pub name: String,

    /// Desired number of members in this rack
    pub members: u32,
}

impl DatabaseCluster {
    /// Queue key for this cluster
    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// True once the object has a deletion timestamp
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Every member identity the cluster declares, rack by rack, ordinal by ordinal
    pub fn expected_members(&self) -> impl Iterator<Item = MemberIdentity> + '_ {
        let cluster = self.name_any();
        self.spec.racks.iter().flat_map(move |rack| {
            let cluster = cluster.clone();
            (0..rack.members).map(move |ordinal| MemberIdentity {
                cluster: cluster.clone(),
                datacenter: self.spec.datacenter.clone(),
                rack: rack.name.clone(),
                ordinal,
            })
        })
    }
}
