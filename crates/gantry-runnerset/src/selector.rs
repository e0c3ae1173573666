//! Scale decision for a runner population
//!
//! Pure functions from the observed runner snapshot and the replica target to
//! a [`ScalePlan`]: how many runners to create, which finished runners to
//! reap, and which to delete. Keeping this free of I/O is the main
//! testability lever — the reconciler just executes the plan.
//!
//! Deletion rules:
//! - A runner executing a job is never deleted.
//! - A failed runner is never deleted (it persists for diagnosis).
//! - Finished runners are always reaped, even when not scaling down.
//! - Scale-down removes unregistered runners before registered idle ones.
//! - Runners created under an outdated patch id are drained and replaced.
//!
//! Ties are broken by name so that repeated passes over the same snapshot
//! pick the same victims.

use gantry_common::crd::{EphemeralRunner, RunnerPhase};
use gantry_common::ANNOTATION_PATCH_ID;
use kube::ResourceExt;

/// Behavioral classification of one runner within the scale decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnerKind {
    /// Actively executing a job; never deletable by scale-down
    RunningJob,
    /// Exited with an error; never deletable by scale-down
    Failed,
    /// Finished its job cleanly; always reaped
    Finished,
    /// Not yet registered with the dispatch service; deletable directly
    Pending,
    /// Registered and idle; deletable after dispatch deregistration
    Idle,
}

/// Classify a runner by job assignment, terminal phase, and registration.
///
/// Registration (a non-zero runner id), not pod phase, decides between
/// Pending and Idle: an unregistered runner has nothing to deregister, a
/// registered one must be removed from the dispatch service first.
pub fn classify(runner: &EphemeralRunner) -> RunnerKind {
    if runner.has_job() {
        return RunnerKind::RunningJob;
    }
    match runner.phase() {
        RunnerPhase::Failed => RunnerKind::Failed,
        RunnerPhase::Succeeded => RunnerKind::Finished,
        _ if !runner.is_configured() => RunnerKind::Pending,
        _ => RunnerKind::Idle,
    }
}

/// One runner picked for removal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteCandidate {
    /// Object name
    pub name: String,
    /// Dispatch-service id; 0 means unregistered, no deregistration needed
    pub runner_id: i64,
}

impl DeleteCandidate {
    fn from_runner(runner: &EphemeralRunner) -> Self {
        Self {
            name: runner.name_any(),
            runner_id: runner.runner_id(),
        }
    }
}

/// Phase counts of the observed population, reported into `.status`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservedCounts {
    /// Total runners owned by the set
    pub total: i32,
    /// Runners in phase Pending
    pub pending: i32,
    /// Runners in phase Running
    pub running: i32,
    /// Runners in phase Failed
    pub failed: i32,
}

/// The decision: what to create, reap, and delete in this pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// Number of new runners to create
    pub to_create: usize,
    /// Finished runners, removed unconditionally (no dispatch call needed)
    pub to_reap: Vec<DeleteCandidate>,
    /// Runners removed to reach the target, unregistered ones first
    pub to_delete: Vec<DeleteCandidate>,
    /// Phase counts of the snapshot the plan was computed from
    pub counts: ObservedCounts,
}

impl ScalePlan {
    /// True when executing the plan would mutate nothing
    pub fn is_noop(&self) -> bool {
        self.to_create == 0 && self.to_reap.is_empty() && self.to_delete.is_empty()
    }
}

/// Compute the scale plan for one observed snapshot.
///
/// The effective count excludes finished runners (they are leaving
/// regardless) and stale ones (drained and replaced). When the deletable pool
/// cannot cover the full overshoot because runners hold jobs or failed, the
/// plan deletes what it can; a later pass retries once those states change.
pub fn plan(runners: &[EphemeralRunner], replicas: i32, patch_id: i64) -> ScalePlan {
    let mut counts = ObservedCounts {
        total: runners.len() as i32,
        ..Default::default()
    };

    let mut running_job = 0usize;
    let mut failed = 0usize;
    let mut finished: Vec<DeleteCandidate> = Vec::new();
    let mut pending: Vec<DeleteCandidate> = Vec::new();
    let mut idle: Vec<DeleteCandidate> = Vec::new();
    let mut stale: Vec<DeleteCandidate> = Vec::new();

    for runner in runners {
        match runner.phase() {
            RunnerPhase::Pending => counts.pending += 1,
            RunnerPhase::Running => counts.running += 1,
            RunnerPhase::Failed => counts.failed += 1,
            RunnerPhase::Succeeded => {}
        }

        match classify(runner) {
            RunnerKind::RunningJob => running_job += 1,
            RunnerKind::Failed => failed += 1,
            RunnerKind::Finished => finished.push(DeleteCandidate::from_runner(runner)),
            kind @ (RunnerKind::Pending | RunnerKind::Idle) => {
                if runner_patch_id(runner) != patch_id {
                    stale.push(DeleteCandidate::from_runner(runner));
                } else if kind == RunnerKind::Pending {
                    pending.push(DeleteCandidate::from_runner(runner));
                } else {
                    idle.push(DeleteCandidate::from_runner(runner));
                }
            }
        }
    }

    finished.sort_by(|a, b| a.name.cmp(&b.name));
    pending.sort_by(|a, b| a.name.cmp(&b.name));
    idle.sort_by(|a, b| a.name.cmp(&b.name));
    stale.sort_by(|a, b| a.name.cmp(&b.name));

    let effective = (running_job + failed + pending.len() + idle.len()) as i32;

    let mut to_delete = stale;
    if effective > replicas {
        let mut overshoot = (effective - replicas) as usize;
        for pool in [pending, idle] {
            let take = overshoot.min(pool.len());
            to_delete.extend(pool.into_iter().take(take));
            overshoot -= take;
            if overshoot == 0 {
                break;
            }
        }
    }

    let to_create = if effective < replicas {
        (replicas - effective) as usize
    } else {
        0
    };

    ScalePlan {
        to_create,
        to_reap: finished,
        to_delete,
        counts,
    }
}

/// Patch id the runner was created under; missing annotation reads as 0
fn runner_patch_id(runner: &EphemeralRunner) -> i64 {
    runner
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_PATCH_ID))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
