//! Kubernetes Event recording for the runner-set controller.
//!
//! The controller describes what happened with a typed [`RunnerSetEvent`];
//! the publisher maps it onto a standard Kubernetes Event (type, reason,
//! action, note) visible via `kubectl describe` and `kubectl get events`.
//! Centralizing the mapping keeps reasons and notes consistent across call
//! sites and lets tests assert on the vocabulary instead of string literals.
//!
//! Publishing is **fire-and-forget**: failures are logged as warnings and
//! never propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Something the runner-set controller wants to surface as a Kubernetes Event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunnerSetEvent {
    /// New runners were created to reach the replica target
    ScaledUp {
        /// How many runners were created
        created: usize,
    },
    /// Surplus runners were deregistered and deleted
    ScaledDown {
        /// How many runners were deleted
        deleted: usize,
    },
    /// Runners that finished their job were reaped
    FinishedReaped {
        /// How many finished runners were removed
        reaped: usize,
    },
    /// The spec failed validation; no retry until it changes
    ValidationFailed {
        /// What was wrong with the spec
        message: String,
    },
    /// A referenced secret does not exist yet
    DependencyMissing {
        /// Which dependency was missing
        message: String,
    },
    /// The Actions dispatch service rejected a deregistration
    DispatchFailed {
        /// Name of the runner that could not be deregistered
        runner: String,
        /// What the dispatch service said
        message: String,
    },
    /// Teardown is waiting on runners it must not delete yet
    TeardownBlocked {
        /// How many runners are still executing or unreachable
        waiting: usize,
    },
    /// All runners drained, finalizer removed
    TeardownComplete,
}

impl RunnerSetEvent {
    /// Normal for expected lifecycle progress, Warning for anything stuck
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ScaledUp { .. }
            | Self::ScaledDown { .. }
            | Self::FinishedReaped { .. }
            | Self::TeardownComplete => EventType::Normal,
            Self::ValidationFailed { .. }
            | Self::DependencyMissing { .. }
            | Self::DispatchFailed { .. }
            | Self::TeardownBlocked { .. } => EventType::Warning,
        }
    }

    /// Machine-readable reason, shown in the REASON column
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ScaledUp { .. } => reasons::SCALED_UP,
            Self::ScaledDown { .. } => reasons::SCALED_DOWN,
            Self::FinishedReaped { .. } => reasons::FINISHED_REAPED,
            Self::ValidationFailed { .. } => reasons::VALIDATION_FAILED,
            Self::DependencyMissing { .. } => reasons::DEPENDENCY_MISSING,
            Self::DispatchFailed { .. } => reasons::DISPATCH_FAILED,
            Self::TeardownBlocked { .. } => reasons::TEARDOWN_BLOCKED,
            Self::TeardownComplete => reasons::TEARDOWN_COMPLETE,
        }
    }

    /// What the controller was doing, shown in the ACTION column
    pub fn action(&self) -> &'static str {
        match self {
            Self::ScaledUp { .. } | Self::ScaledDown { .. } | Self::FinishedReaped { .. } => {
                actions::SCALE
            }
            Self::ValidationFailed { .. } | Self::DependencyMissing { .. } => actions::RECONCILE,
            Self::DispatchFailed { .. } => actions::SCALE,
            Self::TeardownBlocked { .. } | Self::TeardownComplete => actions::TEARDOWN,
        }
    }

    /// Human-readable note, shown in the MESSAGE column
    pub fn note(&self) -> Option<String> {
        match self {
            Self::ScaledUp { created } => Some(format!("Created {} runner(s)", created)),
            Self::ScaledDown { deleted } => Some(format!("Deleted {} runner(s)", deleted)),
            Self::FinishedReaped { reaped } => {
                Some(format!("Reaped {} finished runner(s)", reaped))
            }
            Self::ValidationFailed { message } | Self::DependencyMissing { message } => {
                Some(message.clone())
            }
            Self::DispatchFailed { runner, message } => {
                Some(format!("Failed to deregister runner {}: {}", runner, message))
            }
            Self::TeardownBlocked { waiting } => Some(format!(
                "{} runner(s) still executing a job or unreachable",
                waiting
            )),
            Self::TeardownComplete => None,
        }
    }
}

/// Trait for publishing runner-set events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on the given resource.
    async fn publish(&self, resource_ref: &ObjectReference, event: RunnerSetEvent);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "gantry-runnerset-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, resource_ref: &ObjectReference, event: RunnerSetEvent) {
        let reason = event.reason();
        let action = event.action();
        let k8s_event = Event {
            type_: event.event_type(),
            reason: reason.to_string(),
            note: event.note(),
            action: action.to_string(),
            secondary: None,
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), resource_ref.clone());
        if let Err(e) = recorder.publish(k8s_event).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
///
/// All calls are silently ignored — no Kubernetes API interaction.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _resource_ref: &ObjectReference, _event: RunnerSetEvent) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// New runners were created to reach the replica target
    pub const SCALED_UP: &str = "ScaledUp";
    /// Idle or pending runners were removed to reach the replica target
    pub const SCALED_DOWN: &str = "ScaledDown";
    /// Runners that finished their job were reaped
    pub const FINISHED_REAPED: &str = "FinishedReaped";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A referenced secret does not exist yet
    pub const DEPENDENCY_MISSING: &str = "DependencyMissing";
    /// A call to the Actions dispatch service failed
    pub const DISPATCH_FAILED: &str = "DispatchFailed";
    /// Teardown is waiting for in-flight jobs to finish
    pub const TEARDOWN_BLOCKED: &str = "TeardownBlocked";
    /// All runners drained, finalizer removed
    pub const TEARDOWN_COMPLETE: &str = "TeardownComplete";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Scaling the runner population
    pub const SCALE: &str = "Scale";
    /// Finalizer-driven deletion cascade
    pub const TEARDOWN: &str = "Teardown";
}
