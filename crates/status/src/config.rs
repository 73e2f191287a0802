//! Status core tunables, read from `DBOP_*` environment variables.

use std::time::Duration;

use dbop_core::DEFAULT_MAX_CONDITIONS;

/// Default age after which an unschedulable member counts as a persistent fault.
pub const DEFAULT_FAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_PERSIST_RETRIES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusConfig {
    /// Unschedulable conditions younger than this are treated as transient.
    pub fault_window: Duration,
    /// Condition history length (0 = unbounded).
    pub max_conditions: usize,
    /// Extra status-write attempts after an optimistic-concurrency conflict.
    pub persist_retries: usize,
    /// Upper bound for one status pass; `None` leaves it to the caller.
    pub pass_timeout: Option<Duration>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            fault_window: DEFAULT_FAULT_WINDOW,
            max_conditions: DEFAULT_MAX_CONDITIONS,
            persist_retries: DEFAULT_PERSIST_RETRIES,
            pass_timeout: None,
        }
    }
}

impl StatusConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let num = |k: &str| lookup(k).and_then(|s| s.trim().parse::<u64>().ok());
        let d = Self::default();
        Self {
            fault_window: num("DBOP_FAULT_WINDOW_SECS").map(Duration::from_secs).unwrap_or(d.fault_window),
            max_conditions: num("DBOP_MAX_CONDITIONS").map(|v| v as usize).unwrap_or(d.max_conditions),
            persist_retries: num("DBOP_PERSIST_RETRIES").map(|v| v as usize).unwrap_or(d.persist_retries),
            pass_timeout: num("DBOP_PASS_TIMEOUT_SECS").filter(|v| *v > 0).map(Duration::from_secs).or(d.pass_timeout),
        }
    }
}
