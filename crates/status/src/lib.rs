//! dbop status core.
//!
//! Turns observed platform objects (StatefulSets, Pods, Services) into the
//! `DbClusterStatus` recorded on each cluster resource: per-tier readiness,
//! a cluster verdict with a deduplicated condition history, and the address
//! clients should connect to. Every pass reads fresh state; nothing is cached.

#![forbid(unsafe_code)]

use std::time::Duration;

use dbop_kubehub::PlatformError;

pub mod clock;
pub mod config;
pub mod fault;
pub mod host;
pub mod readiness;
pub mod reconcile;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::StatusConfig;
pub use fault::{has_persistent_fault, persistent_fault, Fault};
pub use host::{app_host, internal_host};
pub use readiness::ReadinessEvaluator;
pub use reconcile::StatusReconciler;

/// Schema version from which the `ContainersReady` pod condition is required.
pub const CONTAINERS_READY_SINCE: &str = "1.7.0";

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    /// Lookup or transport failure, passed through as the platform reported it.
    #[error(transparent)]
    Platform(#[from] PlatformError),
    /// The exposure object has no ingress point yet; retry on a later pass.
    #[error("load balancer for service {0} is not provisioned yet")]
    LoadBalancerNotReady(String),
    #[error("status write still conflicting after {0} retries")]
    ConflictRetriesExhausted(usize),
    #[error("status pass exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl StatusError {
    /// Transitional failures are expected while the cluster is being built.
    pub fn is_transitional(&self) -> bool {
        matches!(self, StatusError::LoadBalancerNotReady(_))
    }
}

pub type StatusResult<T> = Result<T, StatusError>;
