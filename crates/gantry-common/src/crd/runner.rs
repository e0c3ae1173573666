//! EphemeralRunner CRD types
//!
//! Defines `EphemeralRunner` — one single-use worker slot. The runner accepts
//! at most one job from the Actions dispatch service, then exits. Its spec is
//! a snapshot of the parent set's `ephemeralRunnerSpec` at creation time; its
//! status is driven by the per-runner controller.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Phase
// =============================================================================

/// Lifecycle phase of an EphemeralRunner
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub enum RunnerPhase {
    /// Runner created but not yet registered with the dispatch service
    #[default]
    Pending,
    /// Runner pod is up; it may be idle or executing a job
    Running,
    /// Runner finished its job and exited cleanly
    Succeeded,
    /// Runner exited with an error; kept for diagnostic attention
    Failed,
}

impl std::fmt::Display for RunnerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Proxy config
// =============================================================================

/// Outbound proxy configuration for a runner and its dispatch traffic
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Proxy for plain HTTP traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<ProxyServerConfig>,

    /// Proxy for HTTPS traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<ProxyServerConfig>,

    /// Hosts that bypass the proxy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub no_proxy: Vec<String>,
}

impl ProxyConfig {
    /// Names of credential secrets referenced by either proxy entry, deduplicated.
    pub fn referenced_secrets(&self) -> Vec<&str> {
        let mut names: Vec<&str> = [self.http.as_ref(), self.https.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|p| p.credential_secret_ref.as_deref())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// A single proxy endpoint, optionally authenticated
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyServerConfig {
    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    pub url: String,

    /// Name of a secret holding `username` and `password` entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret_ref: Option<String>,
}

// =============================================================================
// CRD
// =============================================================================

/// One single-use worker slot managed by an EphemeralRunnerSet.
///
/// Also embedded verbatim in `EphemeralRunnerSetSpec.ephemeralRunnerSpec` as
/// the template every created runner snapshots.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "actions.github.com",
    version = "v1alpha1",
    kind = "EphemeralRunner",
    plural = "ephemeralrunners",
    shortname = "er",
    namespaced,
    status = "EphemeralRunnerStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"RunnerId","type":"integer","jsonPath":".status.runnerId"}"#,
    printcolumn = r#"{"name":"JobRequestId","type":"integer","jsonPath":".status.jobRequestId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralRunnerSpec {
    /// URL identifying the external scope (org/repo/enterprise)
    pub github_config_url: String,

    /// Name of the secret holding the service auth token
    pub github_config_secret: String,

    /// Scale set id assigned by the dispatch service
    pub runner_scale_set_id: i64,

    /// Outbound proxy configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,

    /// Name of the flattened proxy secret the runner pod consumes.
    ///
    /// Set by the EphemeralRunnerSet controller when `proxy` is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_secret_ref: Option<String>,

    /// Pod template passed through to the runner pod
    #[serde(default)]
    pub pod_template_spec: PodTemplateSpec,
}

/// Status of an EphemeralRunner, driven by the per-runner controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralRunnerStatus {
    /// Current phase of the runner lifecycle
    #[serde(default)]
    pub phase: RunnerPhase,

    /// Runner id assigned by the dispatch service; 0 means unconfigured
    #[serde(default)]
    pub runner_id: i64,

    /// Id of the job request the runner is executing; 0 means idle
    #[serde(default)]
    pub job_request_id: i64,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EphemeralRunner {
    /// Current phase, defaulting to Pending when status is unset
    pub fn phase(&self) -> RunnerPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Runner id assigned by the dispatch service, 0 if unconfigured
    pub fn runner_id(&self) -> i64 {
        self.status.as_ref().map(|s| s.runner_id).unwrap_or(0)
    }

    /// True when the runner is actively executing a job
    pub fn has_job(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.job_request_id != 0)
            .unwrap_or(false)
    }

    /// True once the dispatch service assigned a runner id
    pub fn is_configured(&self) -> bool {
        self.runner_id() != 0
    }

    /// True when the runner reached a terminal phase
    pub fn is_done(&self) -> bool {
        matches!(self.phase(), RunnerPhase::Succeeded | RunnerPhase::Failed)
    }
}

// =============================================================================
// Tests
// =============================================================================
