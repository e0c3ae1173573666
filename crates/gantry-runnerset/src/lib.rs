//! EphemeralRunnerSet controller
//!
//! Converges a population of single-use `EphemeralRunner` children against a
//! declared replica target, never preempting a runner that is executing a
//! job. Scale-down coordinates with the Actions dispatch service to
//! deregister runners; deletion cascades through a finalizer.
//!
//! The scale decision itself is a pure function of the observed snapshot
//! ([`selector`]); the [`controller`] is a thin shell of I/O around it.

#![deny(missing_docs)]

pub mod controller;
pub mod proxy;
pub mod selector;

pub use controller::{
    error_policy, reconcile, Context, RunnerSetKubeClient, RunnerSetKubeClientImpl,
    EPHEMERAL_RUNNER_SET_FINALIZER,
};
