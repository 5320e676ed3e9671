//! Orphaned volume remediation
//!
//! Local volumes are pinned to the node they were provisioned on. When that
//! node disappears for good, the member can never be scheduled again. For
//! clusters that opt into automatic cleanup, this controller finds such
//! members and labels their Service with [`REPLACE_LABEL`], handing the actual
//! replacement to the member provisioning controller.
//!
//! Detection is two-tier. The cached node list is a cheap filter; a member is
//! only labelled after a live node list confirms the node is really gone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, Service};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{Action, Reconciler};
use crate::affinity;
use crate::cache::ObjectCache;
use crate::client::{bounded, LiveClient};
use crate::config::ControllerConfig;
use crate::error::ErrorCollector;
use crate::naming::{ClusterKey, MemberIdentity, REPLACE_LABEL};
use crate::Error;

/// A member whose claim, volume and Service were all found in the cache
struct ResolvedMember {
    name: String,
    endpoint: Arc<Service>,
    volume: Arc<PersistentVolume>,
}

enum Resolution {
    Resolved(ResolvedMember),
    /// Provisioning has not caught up yet; look again later
    Pending(&'static str),
}

/// Marks members for replacement when their volume's node is gone
pub struct OrphanedVolumeReconciler {
    cache: Arc<dyn ObjectCache>,
    live: Arc<dyn LiveClient>,
    requeue_delay: Duration,
    live_call_timeout: Duration,
}

impl OrphanedVolumeReconciler {
    /// Create a reconciler reading from `cache` and mutating through `live`
    pub fn new(
        cache: Arc<dyn ObjectCache>,
        live: Arc<dyn LiveClient>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            cache,
            live,
            requeue_delay: config.requeue_delay,
            live_call_timeout: config.live_call_timeout,
        }
    }

    /// Reconcile one cluster
    ///
    /// Per-member failures never stop the walk; they are returned together as
    /// one aggregate error once every member has been attempted. Members whose
    /// claim is missing or unbound are not errors and only cause a delayed
    /// requeue.
    #[instrument(skip_all, fields(cluster = %key))]
    pub async fn sync(&self, key: &ClusterKey, cancel: CancellationToken) -> Result<Action, Error> {
        let Some(cluster) = self.cache.get_cluster(key)? else {
            debug!("cluster not found, assuming it was deleted");
            return Ok(Action::await_change());
        };
        if cluster.is_being_deleted() {
            debug!("cluster is being deleted, skipping");
            return Ok(Action::await_change());
        }
        if !cluster.spec.automatic_orphaned_node_cleanup {
            return Ok(Action::await_change());
        }

        let cached_nodes = self.cache.list_nodes()?;
        let mut errs = ErrorCollector::default();
        let mut pending = 0usize;
        let mut candidates = Vec::new();

        for member in cluster.expected_members() {
            let resolved = match self.resolve_member(&key.namespace, &member) {
                Ok(Resolution::Resolved(resolved)) => resolved,
                Ok(Resolution::Pending(reason)) => {
                    debug!(member = %member.name(), reason, "member not ready for evaluation");
                    pending += 1;
                    continue;
                }
                Err(e) => {
                    errs.push(e);
                    continue;
                }
            };

            if has_replace_label(&resolved.endpoint) {
                debug!(member = %resolved.name, "member already marked for replacement");
                continue;
            }

            match affinity::is_orphaned(&resolved.volume, cached_nodes.iter().map(Arc::as_ref)) {
                Ok(true) => candidates.push(resolved),
                Ok(false) => {}
                Err(e) => errs.push(e),
            }
        }

        if !candidates.is_empty() {
            self.remediate(&key.namespace, candidates, &cancel, &mut errs)
                .await;
        }

        errs.into_result(())?;

        if pending > 0 {
            debug!(pending, "requeueing until every member can be evaluated");
            return Ok(Action::requeue(self.requeue_delay));
        }
        Ok(Action::await_change())
    }

    fn resolve_member(
        &self,
        namespace: &str,
        member: &MemberIdentity,
    ) -> Result<Resolution, Error> {
        let claim_name = member.claim_name();
        let Some(claim) = self.cache.get_claim(namespace, &claim_name)? else {
            return Ok(Resolution::Pending("claim not found"));
        };

        let Some(volume_name) = claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.as_deref())
            .filter(|v| !v.is_empty())
        else {
            return Ok(Resolution::Pending("claim not bound"));
        };

        let volume = self
            .cache
            .get_volume(volume_name)?
            .ok_or_else(|| Error::not_found("PersistentVolume", volume_name))?;

        let endpoint_name = member.endpoint_name();
        let Some(endpoint) = self.cache.get_endpoint(namespace, &endpoint_name)? else {
            return Ok(Resolution::Pending("service not found"));
        };

        Ok(Resolution::Resolved(ResolvedMember {
            name: member.name(),
            endpoint,
            volume,
        }))
    }

    /// Confirm each candidate against a live node list, then label it
    async fn remediate(
        &self,
        namespace: &str,
        candidates: Vec<ResolvedMember>,
        cancel: &CancellationToken,
        errs: &mut ErrorCollector,
    ) {
        let live_nodes: Vec<Node> = match bounded(
            cancel,
            self.live_call_timeout,
            "list nodes",
            || self.live.list_nodes(),
        )
        .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                errs.push(e);
                return;
            }
        };

        let labels: BTreeMap<String, String> =
            BTreeMap::from([(REPLACE_LABEL.to_string(), String::new())]);

        for candidate in candidates {
            match affinity::is_orphaned(&candidate.volume, &live_nodes) {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        member = %candidate.name,
                        volume = %candidate.volume.name_any(),
                        "node is present in live list, cache was stale"
                    );
                    continue;
                }
                Err(e) => {
                    errs.push(e);
                    continue;
                }
            }

            info!(
                member = %candidate.name,
                volume = %candidate.volume.name_any(),
                "volume node is gone, marking member for replacement"
            );
            let endpoint = candidate.endpoint.name_any();
            if let Err(e) = bounded(
                cancel,
                self.live_call_timeout,
                "patch service labels",
                || self.live.patch_endpoint_labels(namespace, &endpoint, &labels),
            )
            .await
            {
                let cancelled = matches!(e, Error::Cancelled { .. });
                errs.push(e);
                if cancelled {
                    return;
                }
            }
        }
    }
}

fn has_replace_label(svc: &Service) -> bool {
    svc.labels().contains_key(REPLACE_LABEL)
}

#[async_trait]
impl Reconciler for OrphanedVolumeReconciler {
    type Key = ClusterKey;

    fn name(&self) -> &'static str {
        "orphaned-volume"
    }

    async fn sync(&self, key: &ClusterKey, cancel: CancellationToken) -> Result<Action, Error> {
        OrphanedVolumeReconciler::sync(self, key, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::test_support::{local_pv, node};
    use crate::cache::fake::FakeCache;
    use crate::client::MockLiveClient;
    use crate::crd::{DatabaseCluster, DatabaseClusterSpec, RackSpec};
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use parking_lot::Mutex;

    const NS: &str = "db";
    const REQUEUE: Duration = Duration::from_secs(10);

    type Patches = Arc<Mutex<Vec<(String, String, BTreeMap<String, String>)>>>;

    fn sample_cluster(members: u32, cleanup: bool) -> DatabaseCluster {
        DatabaseCluster {
            metadata: ObjectMeta {
                name: Some("basic".to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: DatabaseClusterSpec {
                datacenter: "dc1".to_string(),
                racks: vec![RackSpec {
                    name: "r1".to_string(),
                    members,
                }],
                automatic_orphaned_node_cleanup: cleanup,
            },
        }
    }

    fn key() -> ClusterKey {
        ClusterKey::new(NS, "basic")
    }

    fn member_name(ordinal: u32) -> String {
        format!("basic-dc1-r1-{ordinal}")
    }

    fn claim(ordinal: u32, volume: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(format!("data-{}", member_name(ordinal))),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: volume.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service(ordinal: u32, marked: bool) -> Service {
        let mut labels = BTreeMap::new();
        if marked {
            labels.insert(REPLACE_LABEL.to_string(), String::new());
        }
        Service {
            metadata: ObjectMeta {
                name: Some(member_name(ordinal)),
                namespace: Some(NS.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Member `ordinal` with a bound claim, a volume pinned to `node_name`
    /// and an unmarked Service
    fn with_member(cache: FakeCache, ordinal: u32, node_name: &str) -> FakeCache {
        let pv = format!("pv-{ordinal}");
        cache
            .with_claim(claim(ordinal, Some(&pv)))
            .with_volume(local_pv(&pv, node_name))
            .with_endpoint(service(ordinal, false))
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            requeue_delay: REQUEUE,
            live_call_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn reconciler(cache: Arc<FakeCache>, live: MockLiveClient) -> OrphanedVolumeReconciler {
        OrphanedVolumeReconciler::new(cache, Arc::new(live), &config())
    }

    /// Live client whose node list is `nodes` and whose patches are recorded
    fn live_with_nodes(nodes: &[&str]) -> (MockLiveClient, Patches) {
        let nodes: Vec<Node> = nodes.iter().map(|n| node(n)).collect();
        let patches: Patches = Arc::default();
        let capture = patches.clone();

        let mut live = MockLiveClient::new();
        live.expect_list_nodes()
            .returning(move || Ok(nodes.clone()));
        live.expect_patch_endpoint_labels()
            .returning(move |ns, name, labels| {
                capture
                    .lock()
                    .push((ns.to_string(), name.to_string(), labels.clone()));
                Ok(())
            });
        (live, patches)
    }

    // ===== Short-circuits =====

    #[tokio::test]
    async fn missing_cluster_is_a_noop() {
        let cache = Arc::new(FakeCache::default());
        let r = reconciler(cache.clone(), MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cache.node_list_count(), 0);
    }

    /// Story: a cluster being torn down must never trigger remediation,
    /// even if its volumes look orphaned.
    #[tokio::test]
    async fn deleted_cluster_lists_no_nodes_and_patches_nothing() {
        let mut cluster = sample_cluster(1, true);
        cluster.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        let cache = Arc::new(with_member(FakeCache::default().with_cluster(cluster), 0, "gone"));
        let r = reconciler(cache.clone(), MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cache.node_list_count(), 0);
    }

    #[tokio::test]
    async fn disabled_cleanup_lists_no_nodes() {
        let cache = Arc::new(with_member(
            FakeCache::default().with_cluster(sample_cluster(1, false)),
            0,
            "gone",
        ));
        let r = reconciler(cache.clone(), MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(cache.node_list_count(), 0);
    }

    // ===== Requeue vs error =====

    /// Story: a member is still being provisioned. That is normal and must
    /// produce a delayed requeue, not a failure with backoff.
    #[tokio::test]
    async fn unbound_claim_requeues_without_error() {
        let cache = FakeCache::default()
            .with_cluster(sample_cluster(2, true))
            .with_node(node("n1"))
            .with_claim(claim(1, None));
        let cache = Arc::new(with_member(cache, 0, "n1"));
        let r = reconciler(cache, MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE));
    }

    #[tokio::test]
    async fn missing_claim_requeues_without_error() {
        let cache = Arc::new(
            FakeCache::default()
                .with_cluster(sample_cluster(1, true))
                .with_node(node("n1")),
        );
        let r = reconciler(cache, MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE));
    }

    #[tokio::test]
    async fn empty_string_volume_name_counts_as_unbound() {
        let cache = Arc::new(
            FakeCache::default()
                .with_cluster(sample_cluster(1, true))
                .with_claim(claim(0, Some(""))),
        );
        let r = reconciler(cache, MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE));
    }

    #[tokio::test]
    async fn missing_service_requeues_without_error() {
        let cache = Arc::new(
            FakeCache::default()
                .with_cluster(sample_cluster(1, true))
                .with_claim(claim(0, Some("pv-0")))
                .with_volume(local_pv("pv-0", "gone")),
        );
        let r = reconciler(cache, MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE));
    }

    #[tokio::test]
    async fn healthy_cluster_needs_no_live_calls() {
        let cache = FakeCache::default()
            .with_cluster(sample_cluster(2, true))
            .with_node(node("n1"))
            .with_node(node("n2"));
        let cache = Arc::new(with_member(with_member(cache, 0, "n1"), 1, "n2"));
        let r = reconciler(cache, MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // ===== Remediation =====

    #[tokio::test]
    async fn confirmed_orphan_is_marked_for_replacement() {
        let cache = FakeCache::default()
            .with_cluster(sample_cluster(2, true))
            .with_node(node("n1"));
        let cache = Arc::new(with_member(with_member(cache, 0, "n1"), 1, "gone"));
        let (live, patches) = live_with_nodes(&["n1"]);
        let r = reconciler(cache, live);

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let patches = patches.lock();
        assert_eq!(patches.len(), 1);
        let (ns, name, labels) = &patches[0];
        assert_eq!(ns, NS);
        assert_eq!(name, &member_name(1));
        assert_eq!(labels.get(REPLACE_LABEL).map(String::as_str), Some(""));
    }

    /// Story: the cache missed a node that was just re-registered. The live
    /// re-check sees it, so nothing is labelled.
    #[tokio::test]
    async fn stale_cache_alone_never_remediates() {
        let cache = FakeCache::default().with_cluster(sample_cluster(1, true));
        let cache = Arc::new(with_member(cache, 0, "n1"));

        let mut live = MockLiveClient::new();
        live.expect_list_nodes()
            .times(1)
            .returning(|| Ok(vec![node("n1")]));
        live.expect_patch_endpoint_labels().never();
        let r = reconciler(cache, live);

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn live_node_list_is_fetched_once_per_sync() {
        let cache = FakeCache::default().with_cluster(sample_cluster(3, true));
        let cache = with_member(cache, 0, "gone-a");
        let cache = with_member(cache, 1, "gone-b");
        let cache = Arc::new(with_member(cache, 2, "gone-c"));

        let mut live = MockLiveClient::new();
        live.expect_list_nodes().times(1).returning(|| Ok(vec![]));
        live.expect_patch_endpoint_labels()
            .times(3)
            .returning(|_, _, _| Ok(()));
        let r = reconciler(cache, live);

        r.sync(&key(), CancellationToken::new()).await.unwrap();
    }

    /// Story: the operator marked a member on the previous pass and the
    /// cache now shows the label. The next pass does nothing.
    #[tokio::test]
    async fn already_marked_member_is_not_patched_again() {
        let cache = FakeCache::default()
            .with_cluster(sample_cluster(1, true))
            .with_claim(claim(0, Some("pv-0")))
            .with_volume(local_pv("pv-0", "gone"))
            .with_endpoint(service(0, true));
        let r = reconciler(Arc::new(cache), MockLiveClient::new());

        let action = r.sync(&key(), CancellationToken::new()).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn repeated_syncs_mark_member_at_most_once() {
        let unmarked = Arc::new(with_member(
            FakeCache::default().with_cluster(sample_cluster(1, true)),
            0,
            "gone",
        ));
        let (live, patches) = live_with_nodes(&[]);
        reconciler(unmarked, live)
            .sync(&key(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(patches.lock().len(), 1);

        // The watch delivers the labelled Service before the next pass.
        let marked = Arc::new(
            FakeCache::default()
                .with_cluster(sample_cluster(1, true))
                .with_claim(claim(0, Some("pv-0")))
                .with_volume(local_pv("pv-0", "gone"))
                .with_endpoint(service(0, true)),
        );
        let (live, second) = live_with_nodes(&[]);
        reconciler(marked, live)
            .sync(&key(), CancellationToken::new())
            .await
            .unwrap();
        assert!(second.lock().is_empty());
    }

    // ===== Partial failure =====

    /// Story: one member's claim cannot be read. The other members are still
    /// evaluated and remediated, and the error names only the broken member.
    #[tokio::test]
    async fn one_failed_member_does_not_block_the_rest() {
        let cache = FakeCache::default().with_cluster(sample_cluster(3, true));
        let cache = with_member(cache, 0, "gone");
        let cache = with_member(cache, 2, "gone");
        let cache = Arc::new(cache.failing_claim(NS, &format!("data-{}", member_name(1))));
        let (live, patches) = live_with_nodes(&[]);
        let r = reconciler(cache, live);

        let err = r.sync(&key(), CancellationToken::new()).await.unwrap_err();
        match &err {
            Error::Aggregate(agg) => assert_eq!(agg.len(), 1),
            other => panic!("expected aggregate error, got {other:?}"),
        }
        assert!(err.to_string().contains(&member_name(1)));

        let patched: Vec<String> = patches.lock().iter().map(|(_, n, _)| n.clone()).collect();
        assert_eq!(patched, vec![member_name(0), member_name(2)]);
    }

    #[tokio::test]
    async fn missing_volume_is_an_error_but_siblings_proceed() {
        let cache = FakeCache::default()
            .with_cluster(sample_cluster(2, true))
            .with_claim(claim(0, Some("pv-missing")))
            .with_endpoint(service(0, false));
        let cache = Arc::new(with_member(cache, 1, "gone"));
        let (live, patches) = live_with_nodes(&[]);
        let r = reconciler(cache, live);

        let err = r.sync(&key(), CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("PersistentVolume pv-missing not found"));
        assert_eq!(patches.lock().len(), 1);
    }

    #[tokio::test]
    async fn patch_failure_is_collected_and_others_are_patched() {
        let cache = FakeCache::default().with_cluster(sample_cluster(2, true));
        let cache = Arc::new(with_member(with_member(cache, 0, "gone"), 1, "gone"));

        let patched: Patches = Arc::default();
        let capture = patched.clone();
        let mut live = MockLiveClient::new();
        live.expect_list_nodes().returning(|| Ok(vec![]));
        live.expect_patch_endpoint_labels()
            .times(2)
            .returning(move |ns, name, labels| {
                if name == member_name(0) {
                    return Err(Error::cache("Service", name.to_string(), "conflict"));
                }
                capture
                    .lock()
                    .push((ns.to_string(), name.to_string(), labels.clone()));
                Ok(())
            });
        let r = reconciler(cache, live);

        let err = r.sync(&key(), CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("conflict"));
        assert_eq!(patched.lock().len(), 1);
    }

    /// Errors take precedence over a pending requeue so backoff applies.
    #[tokio::test]
    async fn errors_win_over_requeue() {
        let cache = FakeCache::default()
            .with_cluster(sample_cluster(2, true))
            .with_claim(claim(0, None));
        let cache = Arc::new(cache.failing_claim(NS, &format!("data-{}", member_name(1))));
        let r = reconciler(cache, MockLiveClient::new());

        assert!(r.sync(&key(), CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn live_list_failure_skips_all_patches() {
        let cache = FakeCache::default().with_cluster(sample_cluster(1, true));
        let cache = Arc::new(with_member(cache, 0, "gone"));

        let mut live = MockLiveClient::new();
        live.expect_list_nodes()
            .returning(|| Err(Error::cache("Node", "*", "apiserver unavailable")));
        live.expect_patch_endpoint_labels().never();
        let r = reconciler(cache, live);

        let err = r.sync(&key(), CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("apiserver unavailable"));
    }

    // ===== Cancellation =====

    #[tokio::test]
    async fn cancelled_sync_issues_no_live_calls() {
        let cache = FakeCache::default().with_cluster(sample_cluster(1, true));
        let cache = Arc::new(with_member(cache, 0, "gone"));

        let mut live = MockLiveClient::new();
        live.expect_list_nodes().never();
        live.expect_patch_endpoint_labels().never();
        let r = reconciler(cache, live);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = r.sync(&key(), cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    /// Story: the controller shuts down while a patch is in flight. No
    /// further patches are issued and the cancellation is reported once.
    #[tokio::test]
    async fn cancellation_stops_remaining_patches() {
        let cache = FakeCache::default().with_cluster(sample_cluster(3, true));
        let cache = with_member(cache, 0, "gone");
        let cache = with_member(cache, 1, "gone");
        let cache = Arc::new(with_member(cache, 2, "gone"));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut live = MockLiveClient::new();
        live.expect_list_nodes().times(1).returning(|| Ok(vec![]));
        live.expect_patch_endpoint_labels()
            .times(1)
            .returning(move |_, _, _| {
                trigger.cancel();
                Ok(())
            });
        let r = reconciler(cache, live);

        let err = r.sync(&key(), cancel).await.unwrap_err();
        match &err {
            Error::Aggregate(agg) => {
                assert_eq!(agg.len(), 1);
                assert!(matches!(agg.errors()[0], Error::Cancelled { .. }));
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconciler_trait_delegates_to_sync() {
        let cache = Arc::new(FakeCache::default());
        let r = reconciler(cache, MockLiveClient::new());
        let action = Reconciler::sync(&r, &key(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(r.name(), "orphaned-volume");
    }
}
