//! dbop kubehub – the observed-state boundary: workload, member and exposure reads,
//! cluster status writes. One trait, a kube-rs implementation and an in-memory one.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result};
use dbop_core::DbCluster;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::{Pod, Service}};
use kube::{api::{Api, ListParams, PostParams}, Client};
use metrics::{counter, histogram};
use tracing::debug;

mod memory;

pub use memory::MemoryPlatform;

/// Platform errors. Conflicts are the only kind callers are expected to retry locally.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Kube(kube::Error),
    #[error("transport: {0}")]
    Transport(String),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PlatformError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, PlatformError::Conflict(_))
    }
}

impl From<kube::Error> for PlatformError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 409 => PlatformError::Conflict(ae.message),
            kube::Error::Api(ae) if ae.code == 404 => PlatformError::NotFound(ae.message),
            other => PlatformError::Kube(other),
        }
    }
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Reads and writes the status core needs from the orchestration platform.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// Workload object of a tier; `None` when it has not been created yet.
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> PlatformResult<Option<StatefulSet>>;

    /// Member processes carrying every label in `labels`.
    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> PlatformResult<Vec<Pod>>;

    /// Exposure object of a tier; `None` when it does not exist.
    async fn get_service(&self, namespace: &str, name: &str) -> PlatformResult<Option<Service>>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> PlatformResult<DbCluster>;

    async fn list_clusters(&self, namespace: &str) -> PlatformResult<Vec<DbCluster>>;

    /// Write the status subresource. The object's `metadata.resourceVersion` must match
    /// the stored one, otherwise [`PlatformError::Conflict`] is returned.
    async fn replace_cluster_status(&self, cluster: &DbCluster) -> PlatformResult<DbCluster>;
}

/// Render a label map as an equality-based selector (`k=v,k=v`).
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Build a kube client from the default config (kubeconfig or in-cluster).
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// [`Platform`] over a live API server.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
}

impl KubeHub {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(get_kube_client().await?))
    }

    fn observe(op: &'static str, t0: Instant) {
        counter!("kubehub_requests_total", 1u64, "op" => op);
        histogram!("kubehub_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
    }
}

#[async_trait::async_trait]
impl Platform for KubeHub {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> PlatformResult<Option<StatefulSet>> {
        let t0 = Instant::now();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let res = api.get_opt(name).await?;
        Self::observe("get_stateful_set", t0);
        debug!(ns = %namespace, name = %name, found = res.is_some(), "kubehub: statefulset");
        Ok(res)
    }

    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> PlatformResult<Vec<Pod>> {
        let t0 = Instant::now();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = selector_string(labels);
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Self::observe("list_pods", t0);
        debug!(ns = %namespace, selector = %selector, count = list.items.len(), "kubehub: pods");
        Ok(list.items)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> PlatformResult<Option<Service>> {
        let t0 = Instant::now();
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let res = api.get_opt(name).await?;
        Self::observe("get_service", t0);
        debug!(ns = %namespace, name = %name, found = res.is_some(), "kubehub: service");
        Ok(res)
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> PlatformResult<DbCluster> {
        let t0 = Instant::now();
        let api: Api<DbCluster> = Api::namespaced(self.client.clone(), namespace);
        let cr = api.get(name).await?;
        Self::observe("get_cluster", t0);
        Ok(cr)
    }

    async fn list_clusters(&self, namespace: &str) -> PlatformResult<Vec<DbCluster>> {
        let t0 = Instant::now();
        let api: Api<DbCluster> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Self::observe("list_clusters", t0);
        Ok(list.items)
    }

    async fn replace_cluster_status(&self, cluster: &DbCluster) -> PlatformResult<DbCluster> {
        let t0 = Instant::now();
        let (namespace, name) = object_key(cluster)?;
        let api: Api<DbCluster> = Api::namespaced(self.client.clone(), &namespace);
        let data = serde_json::to_vec(cluster)?;
        let updated = api.replace_status(&name, &PostParams::default(), data).await?;
        Self::observe("replace_cluster_status", t0);
        debug!(ns = %namespace, name = %name, rv = ?updated.metadata.resource_version, "kubehub: status written");
        Ok(updated)
    }
}

pub(crate) fn object_key(cluster: &DbCluster) -> PlatformResult<(String, String)> {
    let name = cluster.metadata.name.clone().ok_or_else(|| PlatformError::NotFound("cluster missing metadata.name".into()))?;
    let namespace = cluster.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    Ok((namespace, name))
}
