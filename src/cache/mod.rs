//! Read-only view of cached Kubernetes objects
//!
//! The remediator depends only on [`ObjectCache`], never on a concrete store.
//! Production wires it to kube-rs reflector stores ([`ReflectorCache`]); tests
//! use an in-memory fake. The cache is eventually consistent: anything read
//! here may be stale and must be confirmed through
//! [`LiveClient`](crate::client::LiveClient) before a mutation.

pub mod watch;

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Service};
use kube::runtime::reflector::{ObjectRef, Store};

use crate::crd::DatabaseCluster;
use crate::naming::ClusterKey;
use crate::Error;

/// Read access to the cached collections the core consumes
///
/// `Ok(None)` means the object is not in the cache; `Err` means the cache
/// could not answer at all.
pub trait ObjectCache: Send + Sync {
    /// Look up one DatabaseCluster
    fn get_cluster(&self, key: &ClusterKey) -> Result<Option<Arc<DatabaseCluster>>, Error>;

    /// Every cached Node
    fn list_nodes(&self) -> Result<Vec<Arc<Node>>, Error>;

    /// Look up a PersistentVolumeClaim
    fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<PersistentVolumeClaim>>, Error>;

    /// Look up a PersistentVolume (cluster scoped)
    fn get_volume(&self, name: &str) -> Result<Option<Arc<PersistentVolume>>, Error>;

    /// Look up the Service fronting a member
    fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>, Error>;
}

/// [`ObjectCache`] backed by kube-rs reflector stores
#[derive(Clone)]
pub struct ReflectorCache {
    pub(crate) clusters: Store<DatabaseCluster>,
    pub(crate) nodes: Store<Node>,
    pub(crate) volumes: Store<PersistentVolume>,
    pub(crate) claims: Store<PersistentVolumeClaim>,
    pub(crate) endpoints: Store<Service>,
}

impl ReflectorCache {
    /// Wait until every store has completed its initial list
    ///
    /// Workers must not start before this returns, otherwise a member could be
    /// judged against an empty node list.
    pub async fn wait_until_ready(&self) -> Result<(), Error> {
        self.clusters
            .wait_until_ready()
            .await
            .map_err(|_| writer_dropped("DatabaseCluster"))?;
        self.nodes
            .wait_until_ready()
            .await
            .map_err(|_| writer_dropped("Node"))?;
        self.volumes
            .wait_until_ready()
            .await
            .map_err(|_| writer_dropped("PersistentVolume"))?;
        self.claims
            .wait_until_ready()
            .await
            .map_err(|_| writer_dropped("PersistentVolumeClaim"))?;
        self.endpoints
            .wait_until_ready()
            .await
            .map_err(|_| writer_dropped("Service"))?;
        Ok(())
    }
}

fn writer_dropped(kind: &'static str) -> Error {
    Error::cache(kind, "*", "reflector writer dropped before initial sync")
}

impl ObjectCache for ReflectorCache {
    fn get_cluster(&self, key: &ClusterKey) -> Result<Option<Arc<DatabaseCluster>>, Error> {
        Ok(self
            .clusters
            .get(&ObjectRef::new(&key.name).within(&key.namespace)))
    }

    fn list_nodes(&self) -> Result<Vec<Arc<Node>>, Error> {
        Ok(self.nodes.state())
    }

    fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<PersistentVolumeClaim>>, Error> {
        Ok(self.claims.get(&ObjectRef::new(name).within(namespace)))
    }

    fn get_volume(&self, name: &str) -> Result<Option<Arc<PersistentVolume>>, Error> {
        Ok(self.volumes.get(&ObjectRef::new(name)))
    }

    fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>, Error> {
        Ok(self.endpoints.get(&ObjectRef::new(name).within(namespace)))
    }
}
