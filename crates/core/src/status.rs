use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Tier;

/// Condition history length kept on the resource.
pub const DEFAULT_MAX_CONDITIONS: usize = 20;

/// Health verdict of a tier or of the whole cluster.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum AppState {
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "initializing")]
    Init,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "error")]
    Error,
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppState::Unknown => "unknown",
            AppState::Init => "initializing",
            AppState::Ready => "ready",
            AppState::Error => "error",
        }
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Observed status of one tier. Rebuilt from scratch on every pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub size: i32,
    #[serde(default)]
    pub ready: i32,
    #[serde(default)]
    pub status: AppState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClusterConditionType {
    #[serde(rename = "initializing")]
    Init,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// One entry of the condition history.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ClusterConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl ClusterCondition {
    pub fn new(type_: ClusterConditionType) -> Self {
        Self { type_, status: ConditionStatus::True, reason: String::new(), message: String::new(), last_transition_time: None }
    }
}

/// Persisted aggregate status of a DbCluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DbClusterStatus {
    #[serde(default)]
    pub pxc: AppStatus,
    #[serde(default)]
    pub haproxy: AppStatus,
    #[serde(default)]
    pub proxysql: AppStatus,
    #[serde(default)]
    pub status: AppState,
    /// Sum of ready members over all tiers.
    #[serde(default)]
    pub ready: i32,
    /// Sum of desired members over all tiers.
    #[serde(default)]
    pub size: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DbClusterStatus {
    pub fn app(&self, tier: Tier) -> &AppStatus {
        match tier {
            Tier::Node => &self.pxc,
            Tier::HaProxy => &self.haproxy,
            Tier::ProxySql => &self.proxysql,
        }
    }

    pub fn app_mut(&mut self, tier: Tier) -> &mut AppStatus {
        match tier {
            Tier::Node => &mut self.pxc,
            Tier::HaProxy => &mut self.haproxy,
            Tier::ProxySql => &mut self.proxysql,
        }
    }

    /// Merge tier verdicts into the cluster verdict and the condition describing it.
    ///
    /// Error beats Init, Init beats Ready, and only the node tier can make the
    /// cluster Ready. With nothing evaluated yet the verdict is Unknown and the
    /// condition falls back to Init, there being no unknown condition type.
    pub fn cluster_status(&self) -> (AppState, ClusterCondition) {
        let in_state = |state: AppState| -> Vec<Tier> {
            Tier::ALL.iter().copied().filter(|t| self.app(*t).status == state).collect()
        };

        let errored = in_state(AppState::Error);
        if !errored.is_empty() {
            let mut cond = ClusterCondition::new(ClusterConditionType::Error);
            cond.reason = "ComponentError".into();
            cond.message = errored
                .iter()
                .map(|t| {
                    let msg = self.app(*t).message.trim();
                    if msg.is_empty() { t.name().to_string() } else { format!("{}: {}", t.name(), msg) }
                })
                .collect::<Vec<_>>()
                .join("; ");
            return (AppState::Error, cond);
        }

        let initializing = in_state(AppState::Init);
        if !initializing.is_empty() {
            let mut cond = ClusterCondition::new(ClusterConditionType::Init);
            cond.reason = "ComponentInit".into();
            cond.message = initializing.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ");
            return (AppState::Init, cond);
        }

        if self.pxc.status == AppState::Ready {
            let mut cond = ClusterCondition::new(ClusterConditionType::Ready);
            cond.reason = "AllReady".into();
            return (AppState::Ready, cond);
        }

        (AppState::Unknown, ClusterCondition::new(ClusterConditionType::Init))
    }

    /// Record a condition if its type differs from the latest entry.
    /// Keeps at most `max` entries (0 = unbounded). Returns whether it was appended.
    pub fn add_condition(&mut self, cond: ClusterCondition, max: usize) -> bool {
        if self.conditions.last().map(|last| last.type_ == cond.type_).unwrap_or(false) {
            return false;
        }
        self.conditions.push(cond);
        if max > 0 && self.conditions.len() > max {
            let excess = self.conditions.len() - max;
            self.conditions.drain(..excess);
        }
        true
    }

    pub fn last_condition(&self) -> Option<&ClusterCondition> {
        self.conditions.last()
    }

    /// Recompute the `ready`/`size` totals from the tier statuses.
    pub fn recount(&mut self) {
        self.ready = Tier::ALL.iter().map(|t| self.app(*t).ready).sum();
        self.size = Tier::ALL.iter().map(|t| self.app(*t).size).sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(pxc: AppState, haproxy: AppState, proxysql: AppState) -> DbClusterStatus {
        let mut s = DbClusterStatus::default();
        s.pxc.status = pxc;
        s.haproxy.status = haproxy;
        s.proxysql.status = proxysql;
        s
    }

    #[test]
    fn cluster_status_table() {
        use AppState::*;
        use ClusterConditionType as C;
        let cases = [
            ("unknown", with(Unknown, Unknown, Unknown), Unknown, C::Init),
            ("pxc error", with(Error, Unknown, Unknown), Error, C::Error),
            ("pxc init", with(Init, Unknown, Unknown), Init, C::Init),
            ("pxc ready", with(Ready, Unknown, Unknown), Ready, C::Ready),
            ("haproxy error", with(Unknown, Error, Unknown), Error, C::Error),
            ("haproxy init", with(Unknown, Init, Unknown), Init, C::Init),
            ("haproxy ready", with(Ready, Ready, Unknown), Ready, C::Ready),
            ("proxysql error", with(Unknown, Unknown, Error), Error, C::Error),
            ("proxysql init", with(Unknown, Unknown, Init), Init, C::Init),
            ("proxysql ready", with(Ready, Unknown, Ready), Ready, C::Ready),
            ("aux ready without node", with(Unknown, Ready, Ready), Unknown, C::Init),
        ];
        for (name, status, want_state, want_type) in cases {
            let (state, cond) = status.cluster_status();
            assert_eq!(state, want_state, "{name}: state");
            assert_eq!(cond.type_, want_type, "{name}: condition type");
        }
    }

    #[test]
    fn priority_does_not_depend_on_tier_position() {
        use AppState::*;
        let states = [Error, Init, Ready];
        // every arrangement of one Error among the other verdicts
        for a in states {
            for b in states {
                for c in states {
                    let s = with(a, b, c);
                    let (got, _) = s.cluster_status();
                    let want = if [a, b, c].contains(&Error) {
                        Error
                    } else if [a, b, c].contains(&Init) {
                        Init
                    } else {
                        Ready
                    };
                    assert_eq!(got, want, "{a:?}/{b:?}/{c:?}");
                }
            }
        }
    }

    #[test]
    fn error_condition_names_failing_tiers() {
        let mut s = with(AppState::Error, AppState::Ready, AppState::Error);
        s.pxc.message = "0/3 nodes are available".into();
        let (_, cond) = s.cluster_status();
        assert_eq!(cond.reason, "ComponentError");
        assert_eq!(cond.message, "pxc: 0/3 nodes are available; proxysql");
    }

    #[test]
    fn add_condition_dedups_consecutive_types() {
        let mut s = DbClusterStatus::default();
        assert!(s.add_condition(ClusterCondition::new(ClusterConditionType::Init), 0));
        assert!(!s.add_condition(ClusterCondition::new(ClusterConditionType::Init), 0));
        assert!(s.add_condition(ClusterCondition::new(ClusterConditionType::Ready), 0));
        assert!(s.add_condition(ClusterCondition::new(ClusterConditionType::Init), 0));
        let types: Vec<_> = s.conditions.iter().map(|c| c.type_).collect();
        assert_eq!(types, vec![ClusterConditionType::Init, ClusterConditionType::Ready, ClusterConditionType::Init]);
    }

    #[test]
    fn add_condition_caps_history() {
        let mut s = DbClusterStatus::default();
        let kinds = [ClusterConditionType::Init, ClusterConditionType::Ready, ClusterConditionType::Error];
        for i in 0..10 {
            s.add_condition(ClusterCondition::new(kinds[i % 3]), 4);
        }
        assert_eq!(s.conditions.len(), 4);
        assert_eq!(s.last_condition().map(|c| c.type_), Some(ClusterConditionType::Init));
        for pair in s.conditions.windows(2) {
            assert_ne!(pair[0].type_, pair[1].type_);
        }
    }

    #[test]
    fn recount_sums_tiers() {
        let mut s = DbClusterStatus::default();
        s.pxc = AppStatus { size: 3, ready: 2, ..Default::default() };
        s.haproxy = AppStatus { size: 2, ready: 2, ..Default::default() };
        s.recount();
        assert_eq!((s.ready, s.size), (4, 5));
    }

    #[test]
    fn status_serializes_with_operator_field_names() {
        let mut s = DbClusterStatus::default();
        s.status = AppState::Init;
        s.add_condition(ClusterCondition::new(ClusterConditionType::Init), 0);
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["status"], "initializing");
        assert_eq!(v["conditions"][0]["type"], "initializing");
        assert_eq!(v["conditions"][0]["status"], "True");
        assert_eq!(v["pxc"]["status"], "unknown");
    }
}
