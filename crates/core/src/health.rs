//! Health snapshots and the composition rule.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the sub-check describing the bridge process itself.
pub const BACKEND_CHECK: &str = "backend";

/// Name of the sub-check describing the analysis engine.
pub const AI_SERVICE_CHECK: &str = "aiService";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn is_healthy(self) -> bool {
        matches!(self, HealthState::Healthy)
    }
}

/// One health snapshot, possibly composed of named sub-checks.
///
/// Snapshots are ephemeral: recomputed on every probe, never mutated after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_checks: BTreeMap<String, HealthStatus>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            version: None,
            model_ready: None,
            error: None,
            sub_checks: BTreeMap::new(),
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            version: None,
            model_ready: None,
            error: Some(error.into()),
            sub_checks: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_model_ready(mut self, ready: bool) -> Self {
        self.model_ready = Some(ready);
        self
    }

    /// Compose a status from its sub-checks.
    ///
    /// The top-level status is healthy iff every sub-check is healthy (and
    /// there is at least one). Nothing else feeds into it.
    pub fn composite(sub_checks: BTreeMap<String, HealthStatus>) -> Self {
        let healthy = !sub_checks.is_empty() && sub_checks.values().all(|c| c.status.is_healthy());
        Self {
            status: if healthy {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            version: None,
            model_ready: None,
            error: None,
            sub_checks,
        }
    }

    /// The standard bridge composite: `backend` plus `aiService`.
    pub fn bridge(backend: HealthStatus, ai_service: HealthStatus) -> Self {
        let mut checks = BTreeMap::new();
        checks.insert(BACKEND_CHECK.to_string(), backend);
        checks.insert(AI_SERVICE_CHECK.to_string(), ai_service);
        Self::composite(checks)
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    pub fn sub_check(&self, name: &str) -> Option<&HealthStatus> {
        self.sub_checks.get(name)
    }
}
