//! EphemeralRunnerSet CRD types
//!
//! Defines `EphemeralRunnerSet` — a desired-count pool of single-use runners.
//! Created and scaled by a parent aggregate; this controller only converges
//! the runner population against `spec.replicas`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::runner::EphemeralRunnerSpec;
use crate::error::Error;

/// Desired-count pool of ephemeral runners
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "actions.github.com",
    version = "v1alpha1",
    kind = "EphemeralRunnerSet",
    plural = "ephemeralrunnersets",
    shortname = "ers",
    namespaced,
    status = "EphemeralRunnerSetStatus",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentReplicas"}"#,
    printcolumn = r#"{"name":"Running","type":"integer","jsonPath":".status.runningEphemeralRunners"}"#,
    printcolumn = r#"{"name":"Failed","type":"integer","jsonPath":".status.failedEphemeralRunners"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralRunnerSetSpec {
    /// Desired number of live runners
    #[serde(default)]
    pub replicas: i32,

    /// Opaque version token set by the parent aggregate.
    ///
    /// Bumping it invalidates runners created under a previous value: the
    /// controller drains stale idle/pending runners and replaces them.
    #[serde(default, rename = "patchID")]
    pub patch_id: i64,

    /// Template snapshotted into every created runner
    pub ephemeral_runner_spec: EphemeralRunnerSpec,
}

impl EphemeralRunnerSetSpec {
    /// Validate the spec, returning a field-scoped error on the first problem.
    pub fn validate(&self, runner_set: &str) -> Result<(), Error> {
        if self.replicas < 0 {
            return Err(Error::validation_for_field(
                runner_set,
                "spec.replicas",
                "must be non-negative",
            ));
        }
        if self.ephemeral_runner_spec.github_config_url.is_empty() {
            return Err(Error::validation_for_field(
                runner_set,
                "spec.ephemeralRunnerSpec.githubConfigUrl",
                "must not be empty",
            ));
        }
        if self.ephemeral_runner_spec.github_config_secret.is_empty() {
            return Err(Error::validation_for_field(
                runner_set,
                "spec.ephemeralRunnerSpec.githubConfigSecret",
                "must not be empty",
            ));
        }
        if self.ephemeral_runner_spec.runner_scale_set_id <= 0 {
            return Err(Error::validation_for_field(
                runner_set,
                "spec.ephemeralRunnerSpec.runnerScaleSetId",
                "must be a positive id assigned by the dispatch service",
            ));
        }
        Ok(())
    }
}

/// Observed counts of the runner population
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralRunnerSetStatus {
    /// Total number of runners currently owned by this set
    #[serde(default)]
    pub current_replicas: i32,

    /// Runners awaiting registration with the dispatch service
    #[serde(default)]
    pub pending_ephemeral_runners: i32,

    /// Runners whose pod is up (idle or executing a job)
    #[serde(default)]
    pub running_ephemeral_runners: i32,

    /// Runners that exited with an error
    #[serde(default)]
    pub failed_ephemeral_runners: i32,
}
