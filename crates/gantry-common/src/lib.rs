//! Common types for Gantry: CRDs, errors, events, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher, RunnerSetEvent};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Key inside the GitHub config secret holding the service auth token
pub const GITHUB_TOKEN_KEY: &str = "github_token";

/// Label stamped on every EphemeralRunner linking it back to its set.
///
/// Used as the list selector when the controller observes its population.
pub const LABEL_RUNNER_SET: &str = "actions.github.com/runner-set";

/// Label marking derived objects as managed by this operator
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] for objects this operator writes
pub const LABEL_MANAGED_BY_GANTRY: &str = "gantry";

/// Annotation carrying the set's patch id at the time a runner was created.
///
/// Runners whose annotation no longer matches the set's current patch id are
/// stale and get drained during reconciliation.
pub const ANNOTATION_PATCH_ID: &str = "actions.github.com/patch-id";

/// Install the default rustls crypto provider (aws-lc-rs).
///
/// Must run before any TLS connection is created, including kube clients.
/// Safe to call multiple times.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
