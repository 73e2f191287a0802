//! In-memory [`Platform`] for tests and offline runs.
//!
//! Status writes follow the API server's optimistic-concurrency rule: a write whose
//! resourceVersion is stale is rejected with a conflict.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dbop_core::DbCluster;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::{Pod, Service}};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use crate::{object_key, Platform, PlatformError, PlatformResult};

type Key = (String, String);

#[derive(Default)]
struct State {
    stateful_sets: BTreeMap<Key, StatefulSet>,
    pods: Vec<Pod>,
    services: BTreeMap<Key, Service>,
    clusters: BTreeMap<Key, DbCluster>,
    next_rv: u64,
    /// Concurrent writes to simulate before the next status writes.
    pending_conflicts: usize,
    read_failure: Option<String>,
    status_writes: usize,
    conflicts_served: usize,
}

impl State {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }
}

#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<State>,
    latency: Option<Duration>,
}

fn key(meta: &ObjectMeta) -> Key {
    (meta.namespace.clone().unwrap_or_else(|| "default".to_string()), meta.name.clone().unwrap_or_default())
}

fn labels_match(meta: &ObjectMeta, selector: &BTreeMap<String, String>) -> bool {
    let labels = meta.labels.as_ref();
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

impl MemoryPlatform {
    pub fn new() -> Self { Self::default() }

    /// Delay every call by `latency` (for deadline tests).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lag(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }

    fn check_reads(&self) -> PlatformResult<()> {
        match &self.state().read_failure {
            Some(msg) => Err(PlatformError::Transport(msg.clone())),
            None => Ok(()),
        }
    }

    pub fn add_stateful_set(&self, sts: StatefulSet) {
        self.state().stateful_sets.insert(key(&sts.metadata), sts);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state().pods.push(pod);
    }

    pub fn add_service(&self, svc: Service) {
        self.state().services.insert(key(&svc.metadata), svc);
    }

    /// Store a cluster resource, assigning it a fresh resourceVersion.
    /// Returns the stored copy.
    pub fn add_cluster(&self, mut cr: DbCluster) -> DbCluster {
        let mut st = self.state();
        cr.metadata.resource_version = Some(st.bump_rv());
        st.clusters.insert(key(&cr.metadata), cr.clone());
        cr
    }

    /// Simulate `n` writes by another controller, one right before each of the next
    /// `n` status writes.
    pub fn inject_conflicts(&self, n: usize) {
        self.state().pending_conflicts = n;
    }

    /// Make every read fail with a transport error until cleared with `None`.
    pub fn fail_reads(&self, msg: Option<&str>) {
        self.state().read_failure = msg.map(str::to_string);
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<DbCluster> {
        self.state().clusters.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    /// Number of accepted status writes.
    pub fn status_writes(&self) -> usize { self.state().status_writes }

    /// Number of status writes rejected as conflicts.
    pub fn conflicts_served(&self) -> usize { self.state().conflicts_served }
}

#[async_trait::async_trait]
impl Platform for MemoryPlatform {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> PlatformResult<Option<StatefulSet>> {
        self.lag().await;
        self.check_reads()?;
        Ok(self.state().stateful_sets.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn list_pods(&self, namespace: &str, labels: &BTreeMap<String, String>) -> PlatformResult<Vec<Pod>> {
        self.lag().await;
        self.check_reads()?;
        let st = self.state();
        Ok(st
            .pods
            .iter()
            .filter(|p| p.metadata.namespace.as_deref().unwrap_or("default") == namespace)
            .filter(|p| labels_match(&p.metadata, labels))
            .cloned()
            .collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> PlatformResult<Option<Service>> {
        self.lag().await;
        self.check_reads()?;
        Ok(self.state().services.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> PlatformResult<DbCluster> {
        self.lag().await;
        self.check_reads()?;
        self.state()
            .clusters
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("dbclusters \"{}\" not found in {}", name, namespace)))
    }

    async fn list_clusters(&self, namespace: &str) -> PlatformResult<Vec<DbCluster>> {
        self.lag().await;
        self.check_reads()?;
        Ok(self.state().clusters.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, c)| c.clone()).collect())
    }

    async fn replace_cluster_status(&self, cluster: &DbCluster) -> PlatformResult<DbCluster> {
        self.lag().await;
        let k = object_key(cluster)?;
        let mut st = self.state();
        if st.pending_conflicts > 0 {
            st.pending_conflicts -= 1;
            let rv = st.bump_rv();
            if let Some(stored) = st.clusters.get_mut(&k) {
                stored.metadata.resource_version = Some(rv);
            }
        }
        let stored_rv = match st.clusters.get(&k) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => return Err(PlatformError::NotFound(format!("dbclusters \"{}\" not found in {}", k.1, k.0))),
        };
        if stored_rv != cluster.metadata.resource_version {
            st.conflicts_served += 1;
            debug!(ns = %k.0, name = %k.1, have = ?cluster.metadata.resource_version, want = ?stored_rv, "memory: status conflict");
            return Err(PlatformError::Conflict(format!(
                "Operation cannot be fulfilled on dbclusters \"{}\": the object has been modified",
                k.1
            )));
        }
        let rv = st.bump_rv();
        st.status_writes += 1;
        let stored = st.clusters.get_mut(&k).ok_or_else(|| PlatformError::NotFound(k.1.clone()))?;
        // only the status subresource is written
        stored.status = cluster.status.clone();
        stored.metadata.resource_version = Some(rv);
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbop_core::{DbClusterSpec, PodSpec};

    fn cr() -> DbCluster {
        let mut c = DbCluster::new("c1", DbClusterSpec { pxc: PodSpec::new(3), ..Default::default() });
        c.metadata.namespace = Some("ns".into());
        c
    }

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        let mut p = Pod::default();
        p.metadata.name = Some(name.into());
        p.metadata.namespace = Some("ns".into());
        p.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        p
    }

    #[tokio::test]
    async fn list_pods_filters_by_selector_and_namespace() {
        let mp = MemoryPlatform::new();
        mp.add_pod(pod("a", &[("app", "db"), ("tier", "pxc")]));
        mp.add_pod(pod("b", &[("app", "db"), ("tier", "haproxy")]));
        let mut other = pod("c", &[("app", "db"), ("tier", "pxc")]);
        other.metadata.namespace = Some("elsewhere".into());
        mp.add_pod(other);

        let sel = BTreeMap::from([("app".to_string(), "db".to_string()), ("tier".to_string(), "pxc".to_string())]);
        let got = mp.list_pods("ns", &sel).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn stale_status_write_conflicts() {
        let mp = MemoryPlatform::new();
        let stored = mp.add_cluster(cr());
        let first = mp.replace_cluster_status(&stored).await.unwrap();
        assert_ne!(first.metadata.resource_version, stored.metadata.resource_version);
        let err = mp.replace_cluster_status(&stored).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(mp.status_writes(), 1);
        assert_eq!(mp.conflicts_served(), 1);
    }

    #[tokio::test]
    async fn injected_conflict_bumps_version() {
        let mp = MemoryPlatform::new();
        let stored = mp.add_cluster(cr());
        mp.inject_conflicts(1);
        assert!(mp.replace_cluster_status(&stored).await.unwrap_err().is_conflict());
        let fresh = mp.get_cluster("ns", "c1").await.unwrap();
        assert!(mp.replace_cluster_status(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn read_failures_are_transport_errors() {
        let mp = MemoryPlatform::new();
        mp.fail_reads(Some("connection refused"));
        let err = mp.get_stateful_set("ns", "x").await.unwrap_err();
        assert!(matches!(err, PlatformError::Transport(ref m) if m == "connection refused"));
        mp.fail_reads(None);
        assert!(mp.get_stateful_set("ns", "x").await.unwrap().is_none());
    }
}
