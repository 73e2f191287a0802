//! Per-tier readiness: how many members are up, and is the tier healthy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dbop_core::{AppState, AppStatus, Component, PodSpec};
use dbop_kubehub::Platform;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tracing::debug;

use crate::fault::persistent_fault;
use crate::StatusResult;

pub const CONTAINERS_READY: &str = "ContainersReady";
pub const POD_READY: &str = "Ready";

/// Evaluates tiers against one instant of observed state.
pub struct ReadinessEvaluator<'a> {
    platform: &'a dyn Platform,
    now: DateTime<Utc>,
    fault_window: Duration,
}

impl<'a> ReadinessEvaluator<'a> {
    pub fn new(platform: &'a dyn Platform, now: DateTime<Utc>, fault_window: Duration) -> Self {
        Self { platform, now, fault_window }
    }

    /// Status of `component` in `namespace` against its desired size.
    ///
    /// A missing workload is a tier that has not been created yet and yields Init.
    /// A persistent scheduling fault yields Error whatever the ready count; otherwise
    /// the tier is Ready once ready members reach the desired size.
    /// `cr_after_17` picks which readiness condition is trusted, see [`member_ready`].
    pub async fn app_status(
        &self,
        component: &Component,
        namespace: &str,
        pod_spec: &PodSpec,
        cr_after_17: bool,
    ) -> StatusResult<AppStatus> {
        let mut status = AppStatus { size: pod_spec.size, ready: 0, status: AppState::Init, message: String::new() };

        let workload = component.workload_name();
        if self.platform.get_stateful_set(namespace, &workload).await?.is_none() {
            debug!(component = %component.tier(), workload = %workload, "readiness: workload not created yet");
            return Ok(status);
        }

        let pods = self.platform.list_pods(namespace, &component.labels()).await?;
        status.ready = pods.iter().filter(|p| member_ready(p, cr_after_17)).count() as i32;
        status.message = waiting_messages(&pods);

        if let Some(fault) = persistent_fault(&pods, self.now, self.fault_window) {
            debug!(component = %component.tier(), pod = %fault.pod, since = %fault.since, "readiness: persistent scheduling fault");
            status.status = AppState::Error;
            status.message = fault.to_string();
            return Ok(status);
        }

        status.status = if status.ready >= status.size { AppState::Ready } else { AppState::Init };
        debug!(component = %component.tier(), ready = status.ready, size = status.size, status = %status.status, "readiness: evaluated");
        Ok(status)
    }
}

fn condition_true(status: &PodStatus, type_: &str) -> Option<bool> {
    status.conditions.as_ref()?.iter().find(|c| c.type_ == type_).map(|c| c.status == "True")
}

/// A member is ready when every reported container is ready and the pod's own
/// aggregate readiness condition is true.
///
/// From schema 1.7 on the aggregate condition is `ContainersReady`. Older
/// resources may run on platforms that do not report it, so they fall back
/// to the pod `Ready` condition when `ContainersReady` is absent.
pub fn member_ready(pod: &Pod, cr_after_17: bool) -> bool {
    let Some(status) = pod.status.as_ref() else { return false };
    let containers_ready = status.container_statuses.as_ref().map(|cs| cs.iter().all(|c| c.ready)).unwrap_or(true);
    let aggregate = match condition_true(status, CONTAINERS_READY) {
        Some(v) => v,
        None if !cr_after_17 => condition_true(status, POD_READY).unwrap_or(false),
        None => false,
    };
    containers_ready && aggregate
}

/// `"<container>: <message>; "` for every container waiting with a message.
fn waiting_messages(pods: &[Pod]) -> String {
    let mut out = String::new();
    for cs in pods.iter().filter_map(|p| p.status.as_ref()?.container_statuses.as_ref()).flatten() {
        let waiting = cs.state.as_ref().and_then(|s| s.waiting.as_ref());
        if let Some(msg) = waiting.and_then(|w| w.message.as_deref()).filter(|m| !m.is_empty()) {
            out.push_str(&format!("{}: {}; ", cs.name, msg));
        }
    }
    out
}
