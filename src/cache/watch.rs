//! Reflector wiring
//!
//! Starts one reflector per cached kind and maps every watch event to the
//! cluster keys it can affect. The returned futures run until the process
//! exits; the watcher's default backoff retries failed watches.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, warn};

use super::ReflectorCache;
use crate::crd::DatabaseCluster;
use crate::naming::{ClusterKey, CLUSTER_NAME_LABEL};
use crate::queue::WorkQueue;

/// Server-side watch timeout in seconds
///
/// Shorter than the client's 30s read timeout so the API server closes the
/// watch first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A running watch; poll it to keep the cache and queue fed
pub type WatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Start reflectors for every cached kind
///
/// Namespaced kinds are limited to `namespace` when set. Nodes and
/// PersistentVolumes are cluster scoped and always watched cluster-wide.
/// PVCs and Services are only watched when they carry [`CLUSTER_NAME_LABEL`].
pub fn start(
    client: &Client,
    namespace: Option<&str>,
    queue: Arc<WorkQueue<ClusterKey>>,
) -> (ReflectorCache, Vec<WatchFuture>) {
    let (clusters, clusters_writer) = reflector::store::<DatabaseCluster>();
    let (nodes, nodes_writer) = reflector::store::<Node>();
    let (volumes, volumes_writer) = reflector::store::<PersistentVolume>();
    let (claims, claims_writer) = reflector::store::<PersistentVolumeClaim>();
    let (endpoints, endpoints_writer) = reflector::store::<Service>();

    let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
    let owned = config.clone().labels(CLUSTER_NAME_LABEL);

    let cluster_stream = watcher(scoped_api::<DatabaseCluster>(client, namespace), config.clone())
        .default_backoff()
        .reflect(clusters_writer);
    let node_stream = watcher(Api::<Node>::all(client.clone()), config.clone())
        .default_backoff()
        .reflect(nodes_writer);
    let volume_stream = watcher(Api::<PersistentVolume>::all(client.clone()), config)
        .default_backoff()
        .reflect(volumes_writer);
    let claim_stream = watcher(
        scoped_api::<PersistentVolumeClaim>(client, namespace),
        owned.clone(),
    )
    .default_backoff()
    .reflect(claims_writer);
    let endpoint_stream = watcher(scoped_api::<Service>(client, namespace), owned)
        .default_backoff()
        .reflect(endpoints_writer);

    let cluster_reader = clusters.clone();
    let futures = vec![
        drive("DatabaseCluster", cluster_stream, queue.clone(), cluster_event_keys),
        drive("Node", node_stream, queue.clone(), move |event| {
            node_event_keys(event, &cluster_reader.state())
        }),
        // PV events carry no cluster reference; the claim watch covers binding.
        drive("PersistentVolume", volume_stream, queue.clone(), |_| Vec::new()),
        drive(
            "PersistentVolumeClaim",
            claim_stream,
            queue.clone(),
            labelled_event_keys::<PersistentVolumeClaim>,
        ),
        drive("Service", endpoint_stream, queue, labelled_event_keys::<Service>),
    ];

    let cache = ReflectorCache {
        clusters,
        nodes,
        volumes,
        claims,
        endpoints,
    };
    (cache, futures)
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn drive<K, S, F>(
    kind: &'static str,
    stream: S,
    queue: Arc<WorkQueue<ClusterKey>>,
    mut keys: F,
) -> WatchFuture
where
    K: Send + 'static,
    S: Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static,
    F: FnMut(&Event<K>) -> Vec<ClusterKey> + Send + 'static,
{
    Box::pin(async move {
        let mut stream = stream.boxed();
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    for key in keys(&event) {
                        debug!(kind, cluster = %key, "watch event enqueued cluster");
                        queue.add(key);
                    }
                }
                Err(e) => warn!(kind, error = %e, "watch failed, retrying with backoff"),
            }
        }
        warn!(kind, "watch stream ended");
    })
}

fn touched<K>(event: &Event<K>) -> Option<&K> {
    match event {
        Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj) => Some(obj),
        Event::Init | Event::InitDone => None,
    }
}

/// A cluster event enqueues that cluster
pub fn cluster_event_keys(event: &Event<DatabaseCluster>) -> Vec<ClusterKey> {
    touched(event).map(DatabaseCluster::key).into_iter().collect()
}

/// A node loss may orphan volumes in any cluster that opted into cleanup
///
/// Only deletions and the end of a re-list can remove nodes, so other node
/// events enqueue nothing.
pub fn node_event_keys(
    event: &Event<Node>,
    clusters: &[Arc<DatabaseCluster>],
) -> Vec<ClusterKey> {
    match event {
        Event::Delete(_) | Event::InitDone => clusters
            .iter()
            .filter(|c| c.spec.automatic_orphaned_node_cleanup)
            .map(|c| c.key())
            .collect(),
        _ => Vec::new(),
    }
}

/// Objects labelled with their owning cluster enqueue that cluster
pub fn labelled_event_keys<K: Resource>(event: &Event<K>) -> Vec<ClusterKey> {
    touched(event).and_then(owner_key).into_iter().collect()
}

fn owner_key<K: Resource>(obj: &K) -> Option<ClusterKey> {
    let cluster = obj.labels().get(CLUSTER_NAME_LABEL)?;
    let namespace = obj.namespace()?;
    Some(ClusterKey::new(namespace, cluster.as_str()))
}
