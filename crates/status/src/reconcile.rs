//! One status pass per cluster resource: evaluate tiers, resolve the host,
//! aggregate, extend the condition history and write the status back.
//!
//! Passes for the same resource are serialized by the caller. The only race
//! handled here is another writer touching the resource between our read and
//! our write, resolved by re-reading and retrying on conflict.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dbop_core::{
    AppState, ClusterCondition, ClusterConditionType, Component, DbCluster, DbClusterStatus, Tier,
};
use dbop_kubehub::Platform;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::host::{app_host, internal_host};
use crate::readiness::ReadinessEvaluator;
use crate::{Clock, StatusConfig, StatusError, StatusResult, SystemClock, CONTAINERS_READY_SINCE};

pub struct StatusReconciler {
    platform: Arc<dyn Platform>,
    clock: Arc<dyn Clock>,
    config: StatusConfig,
}

impl StatusReconciler {
    pub fn new(platform: Arc<dyn Platform>, config: StatusConfig) -> Self {
        Self { platform, clock: Arc::new(SystemClock), config }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &StatusConfig { &self.config }

    /// Run one pass bounded by `config.pass_timeout`.
    /// On expiry `cr` is left as it was and [`StatusError::DeadlineExceeded`] is returned.
    pub async fn reconcile_with_deadline(&self, cr: &mut DbCluster, reconcile_err: Option<&anyhow::Error>) -> StatusResult<()> {
        match self.config.pass_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.update_status(cr, reconcile_err)).await {
                Ok(res) => res,
                Err(_) => {
                    counter!("status_pass_deadline_exceeded", 1u64);
                    warn!(cluster = %cr.metadata.name.as_deref().unwrap_or("-"), limit_ms = %limit.as_millis(), "status: pass deadline exceeded");
                    Err(StatusError::DeadlineExceeded(limit))
                }
            },
            None => self.update_status(cr, reconcile_err).await,
        }
    }

    /// Recompute and persist the status of `cr`.
    ///
    /// `reconcile_err` is the outcome of the rest of the reconciliation. When set,
    /// the verdict is forced to Error without looking at any tier. On success `cr`
    /// carries the written status and the new resourceVersion; on failure it is
    /// left untouched.
    pub async fn update_status(&self, cr: &mut DbCluster, reconcile_err: Option<&anyhow::Error>) -> StatusResult<()> {
        let t0 = Instant::now();
        let name = cr.metadata.name.clone().unwrap_or_default();
        let ns = cr.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let now = self.clock.now();
        counter!("status_pass_total", 1u64);
        info!(cluster = %name, ns = %ns, forced_error = reconcile_err.is_some(), "status: pass start");

        let next = match reconcile_err {
            Some(err) => self.forced_error(cr, err, now),
            None => match self.observe(cr, &name, &ns, now).await {
                Ok(next) => next,
                Err(e) => {
                    counter!("status_pass_err", 1u64);
                    return Err(e);
                }
            },
        };

        let written = match self.persist(cr, &ns, &name, &next).await {
            Ok(w) => w,
            Err(e) => {
                counter!("status_pass_err", 1u64);
                return Err(e);
            }
        };
        cr.metadata.resource_version = written.metadata.resource_version;
        let verdict = next.status;
        let host = next.host.clone();
        cr.status = Some(next);

        histogram!("status_pass_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(cluster = %name, ns = %ns, status = %verdict, host = %host, took_ms = %t0.elapsed().as_millis(), "status: pass ok");
        Ok(())
    }

    fn forced_error(&self, cr: &DbCluster, err: &anyhow::Error, now: DateTime<Utc>) -> DbClusterStatus {
        let mut next = cr.status.clone().unwrap_or_default();
        let text = format!("{:#}", err);
        warn!(cluster = %cr.metadata.name.as_deref().unwrap_or("-"), error = %text, "status: reconcile failed; forcing error");
        // an ongoing failure is recorded once; later texts only go to the log
        if next.status != AppState::Error {
            let mut cond = ClusterCondition::new(ClusterConditionType::Error);
            cond.reason = "ErrorReconcile".into();
            cond.message = text.clone();
            cond.last_transition_time = Some(Time(now));
            next.add_condition(cond, self.config.max_conditions);
            next.messages.push(format!("Error: {}", text));
        }
        next.status = AppState::Error;
        next
    }

    async fn observe(&self, cr: &DbCluster, name: &str, ns: &str, now: DateTime<Utc>) -> StatusResult<DbClusterStatus> {
        let prev = cr.status.clone().unwrap_or_default();
        let mut next = DbClusterStatus { conditions: prev.conditions, host: prev.host, ..Default::default() };
        let cr_after_17 = cr.version_at_least(CONTAINERS_READY_SINCE);

        let evaluator = ReadinessEvaluator::new(self.platform.as_ref(), now, self.config.fault_window);
        for tier in Tier::ALL {
            let component = Component::new(tier, name);
            let Some(pod_spec) = component.pod_spec(&cr.spec) else {
                debug!(cluster = %name, component = %tier, "status: tier disabled");
                continue;
            };
            *next.app_mut(tier) = evaluator.app_status(&component, ns, pod_spec, cr_after_17).await?;
        }

        match self.resolve_host(cr, name, ns).await {
            Ok(host) => next.host = host,
            Err(e) if e.is_transitional() => {
                warn!(cluster = %name, error = %e, "status: host not resolved yet");
                next.messages.push(format!("host: {}", e));
            }
            Err(e) => return Err(e),
        }

        let (verdict, mut cond) = next.cluster_status();
        next.status = verdict;
        cond.last_transition_time = Some(Time(now));
        let cond_type = cond.type_;
        if next.add_condition(cond, self.config.max_conditions) {
            info!(cluster = %name, condition = ?cond_type, "status: condition transition");
        }
        next.recount();
        next.observed_generation = cr.metadata.generation;
        Ok(next)
    }

    /// The externally exposed tier is the first enabled of haproxy, proxysql;
    /// without either, clients use the node tier's internal service.
    async fn resolve_host(&self, cr: &DbCluster, name: &str, ns: &str) -> StatusResult<String> {
        for tier in [Tier::HaProxy, Tier::ProxySql] {
            let component = Component::new(tier, name);
            if let Some(pod_spec) = component.pod_spec(&cr.spec) {
                return app_host(self.platform.as_ref(), &component, ns, pod_spec).await;
            }
        }
        Ok(internal_host(&Component::new(Tier::Node, name), ns))
    }

    async fn persist(&self, cr: &DbCluster, ns: &str, name: &str, next: &DbClusterStatus) -> StatusResult<DbCluster> {
        let mut candidate = cr.clone();
        candidate.status = Some(next.clone());
        let mut attempt = 0usize;
        loop {
            match self.platform.replace_cluster_status(&candidate).await {
                Ok(written) => return Ok(written),
                Err(e) if e.is_conflict() => {
                    counter!("status_persist_conflicts", 1u64);
                    if attempt >= self.config.persist_retries {
                        warn!(cluster = %name, attempts = attempt + 1, "status: giving up after conflicts");
                        return Err(StatusError::ConflictRetriesExhausted(self.config.persist_retries));
                    }
                    attempt += 1;
                    debug!(cluster = %name, attempt, error = %e, "status: write conflict; re-reading");
                    candidate = self.platform.get_cluster(ns, name).await?;
                    candidate.status = Some(next.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbop_core::{DbClusterSpec, PodSpec};
    use dbop_kubehub::MemoryPlatform;

    fn cluster() -> DbCluster {
        let mut cr = DbCluster::new("c1", DbClusterSpec { pxc: PodSpec::new(3), ..Default::default() });
        cr.metadata.namespace = Some("db".into());
        cr
    }

    #[tokio::test]
    async fn forced_error_skips_platform_reads() {
        let mp = Arc::new(MemoryPlatform::new());
        let mut cr = mp.add_cluster(cluster());
        mp.fail_reads(Some("reads must not happen"));
        let r = StatusReconciler::new(mp.clone(), StatusConfig::default());
        let err = anyhow::anyhow!("failed to apply statefulset");
        r.update_status(&mut cr, Some(&err)).await.unwrap();
        let status = cr.status.as_ref().unwrap();
        assert_eq!(status.status, AppState::Error);
        assert_eq!(status.messages, vec!["Error: failed to apply statefulset".to_string()]);
        let last = status.last_condition().unwrap();
        assert_eq!(last.type_, ClusterConditionType::Error);
        assert_eq!(last.reason, "ErrorReconcile");
    }

    #[tokio::test]
    async fn repeated_forced_error_does_not_grow_history() {
        let mp = Arc::new(MemoryPlatform::new());
        let mut cr = mp.add_cluster(cluster());
        let r = StatusReconciler::new(mp.clone(), StatusConfig::default());
        let err = anyhow::anyhow!("boom");
        r.update_status(&mut cr, Some(&err)).await.unwrap();
        r.update_status(&mut cr, Some(&err)).await.unwrap();
        let status = cr.status.as_ref().unwrap();
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.messages.len(), 1);
        assert_eq!(mp.status_writes(), 2);
    }

    #[tokio::test]
    async fn varying_forced_errors_are_recorded_once() {
        let mp = Arc::new(MemoryPlatform::new());
        let mut cr = mp.add_cluster(cluster());
        let r = StatusReconciler::new(mp.clone(), StatusConfig::default());
        for i in 0..50 {
            let err = anyhow::anyhow!("apply statefulset: resourceVersion {} conflict", i);
            r.update_status(&mut cr, Some(&err)).await.unwrap();
        }
        let status = cr.status.as_ref().unwrap();
        assert_eq!(status.status, AppState::Error);
        assert_eq!(status.messages, vec!["Error: apply statefulset: resourceVersion 0 conflict".to_string()]);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(mp.status_writes(), 50);
    }

    #[tokio::test]
    async fn forced_error_after_recovery_is_recorded_again() {
        let mp = Arc::new(MemoryPlatform::new());
        let mut cr = mp.add_cluster(cluster());
        let r = StatusReconciler::new(mp.clone(), StatusConfig::default());
        r.update_status(&mut cr, Some(&anyhow::anyhow!("first"))).await.unwrap();
        // a normal pass clears messages and moves the verdict off Error
        r.update_status(&mut cr, None).await.unwrap();
        assert_eq!(cr.status.as_ref().unwrap().status, AppState::Init);
        assert!(cr.status.as_ref().unwrap().messages.is_empty());
        r.update_status(&mut cr, Some(&anyhow::anyhow!("second"))).await.unwrap();
        let status = cr.status.as_ref().unwrap();
        assert_eq!(status.messages, vec!["Error: second".to_string()]);
        let types: Vec<_> = status.conditions.iter().map(|c| c.type_).collect();
        assert_eq!(types, vec![ClusterConditionType::Error, ClusterConditionType::Init, ClusterConditionType::Error]);
    }

    #[tokio::test]
    async fn failed_reads_leave_resource_untouched() {
        let mp = Arc::new(MemoryPlatform::new());
        let mut cr = mp.add_cluster(cluster());
        mp.fail_reads(Some("apiserver unavailable"));
        let r = StatusReconciler::new(mp.clone(), StatusConfig::default());
        let before = cr.clone();
        let err = r.update_status(&mut cr, None).await.unwrap_err();
        assert!(err.to_string().contains("apiserver unavailable"));
        assert_eq!(cr, before);
        assert_eq!(mp.status_writes(), 0);
    }
}
