//! Scheduling fault detection.
//!
//! A pod the scheduler cannot place reports `PodScheduled=False` with reason
//! `Unschedulable`. That is normal for a short while during rollouts, so it only
//! counts once the condition has been in place for longer than the fault window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, PodCondition};

pub const POD_SCHEDULED: &str = "PodScheduled";
pub const REASON_UNSCHEDULABLE: &str = "Unschedulable";

/// A member stuck unschedulable for longer than the fault window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub pod: String,
    pub message: String,
    pub since: DateTime<Utc>,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}: {}", self.pod, REASON_UNSCHEDULABLE)
        } else {
            write!(f, "{}: {}", self.pod, self.message)
        }
    }
}

fn unschedulable_since(cond: &PodCondition) -> Option<DateTime<Utc>> {
    if cond.type_ != POD_SCHEDULED || cond.status == "True" {
        return None;
    }
    if cond.reason.as_deref() != Some(REASON_UNSCHEDULABLE) {
        return None;
    }
    // without a transition time the age is unknown; not actionable
    cond.last_transition_time.as_ref().map(|t| t.0)
}

/// First member whose unschedulable condition is older than `window` at `now`.
pub fn persistent_fault(pods: &[Pod], now: DateTime<Utc>, window: Duration) -> Option<Fault> {
    pods.iter().find_map(|pod| {
        let conditions = pod.status.as_ref()?.conditions.as_ref()?;
        conditions.iter().find_map(|cond| {
            let since = unschedulable_since(cond)?;
            let age = now.signed_duration_since(since).to_std().ok()?;
            (age > window).then(|| Fault {
                pod: pod.metadata.name.clone().unwrap_or_default(),
                message: cond.message.clone().unwrap_or_default(),
                since,
            })
        })
    })
}

pub fn has_persistent_fault(pods: &[Pod], now: DateTime<Utc>, window: Duration) -> bool {
    persistent_fault(pods, now, window).is_some()
}
