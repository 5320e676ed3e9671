//! Live (uncached) Kubernetes access
//!
//! The core reads almost everything from the reflector cache. The few calls
//! that need freshness or cause side effects go through [`LiveClient`]: the
//! authoritative node re-list before remediation, and the label patch itself.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::{Error, FIELD_MANAGER};

/// Trait abstracting the live API calls made by the remediator
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. Implementations must be safe to share
/// between workers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LiveClient: Send + Sync {
    /// List every Node directly from the API server, bypassing any cache
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Merge the given labels into a Service's metadata
    ///
    /// # Arguments
    ///
    /// * `namespace` - Namespace of the Service
    /// * `name` - Name of the Service
    /// * `labels` - Labels to add or overwrite
    async fn patch_endpoint_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeLiveClient {
    client: Client,
}

impl KubeLiveClient {
    /// Create a new KubeLiveClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LiveClient for KubeLiveClient {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items)
    }

    async fn patch_endpoint_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "labels": labels
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Run a live call bounded by cancellation and a deadline
///
/// `call` is not invoked at all when `cancel` has already fired. Cancellation
/// wins over a call that completes at the same instant, so a cancelled sync
/// never observes a late success.
pub async fn bounded<T, C, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    operation: &str,
    call: C,
) -> Result<T, Error>
where
    C: FnOnce() -> F,
    F: Future<Output = Result<T, Error>>,
{
    if cancel.is_cancelled() {
        return Err(Error::cancelled(operation));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        res = tokio::time::timeout(timeout, call()) => match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
                after: timeout,
            }),
        },
    }
}
