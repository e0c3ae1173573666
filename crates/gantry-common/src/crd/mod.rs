//! Custom Resource Definitions for Gantry
//!
//! This module contains all CRD definitions used by the Gantry operator.

mod runner;
mod runner_set;

pub use runner::{
    EphemeralRunner, EphemeralRunnerSpec, EphemeralRunnerStatus, ProxyConfig, ProxyServerConfig,
    RunnerPhase,
};
pub use runner_set::{EphemeralRunnerSet, EphemeralRunnerSetSpec, EphemeralRunnerSetStatus};
