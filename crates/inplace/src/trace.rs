//! Structured tracing for the in-place update path.
//!
//! Every event is compiled behind the `tracing` feature; without it the
//! helpers are inline no-ops and the crate carries no logging dependency.

use std::io;
use std::path::Path;
use std::time::Duration;

use crate::admission::AdmissionEstimate;
use crate::apply::{ApplyPhase, ApplyStats};
use crate::fetch::PullFailure;
use crate::key::FileKey;
use crate::lock::{LockMode, LockSet};
use crate::pipeline::UpdateReport;
use crate::plan::DeltaPlan;
use crate::recovery::RecoveryOutcome;

#[cfg(feature = "tracing")]
const ADMISSION_TARGET: &str = "inplace::admission";
#[cfg(feature = "tracing")]
const PLAN_TARGET: &str = "inplace::plan";
#[cfg(feature = "tracing")]
const LOCK_TARGET: &str = "inplace::lock";
#[cfg(feature = "tracing")]
const APPLY_TARGET: &str = "inplace::apply";
#[cfg(feature = "tracing")]
const RECOVERY_TARGET: &str = "inplace::recovery";
#[cfg(feature = "tracing")]
const PIPELINE_TARGET: &str = "inplace::pipeline";

// ============================================================================
// Admission
// ============================================================================

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn admission_accepted(key: &FileKey, estimate: &AdmissionEstimate) {
    tracing::debug!(
        target: ADMISSION_TARGET,
        file = %key,
        appending = estimate.appending,
        replacing = estimate.replacing,
        cost = estimate.estimated_cost,
        budget = estimate.budget,
        "admission: in-place update accepted"
    );
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn admission_accepted(_key: &FileKey, _estimate: &AdmissionEstimate) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn admission_rejected(key: &FileKey, estimate: Option<&AdmissionEstimate>) {
    match estimate {
        Some(estimate) => tracing::debug!(
            target: ADMISSION_TARGET,
            file = %key,
            cost = estimate.estimated_cost,
            budget = estimate.budget,
            "admission: cost exceeds full rewrite"
        ),
        None => tracing::debug!(
            target: ADMISSION_TARGET,
            file = %key,
            "admission: no current file"
        ),
    }
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn admission_rejected(_key: &FileKey, _estimate: Option<&AdmissionEstimate>) {}

// ============================================================================
// Planning
// ============================================================================

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn plan_built(plan: &DeltaPlan) {
    tracing::debug!(
        target: PLAN_TARGET,
        file = %plan.key(),
        copies = plan.copies().len(),
        scratch_reads = plan.scratch_reads(),
        external = plan.external().len(),
        pulls = plan.pulls().len(),
        staged_bytes = plan.staged_bytes(),
        "plan: built"
    );
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn plan_built(_plan: &DeltaPlan) {}

// ============================================================================
// Locking
// ============================================================================

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn lock_wait(key: &FileKey, mode: LockMode) {
    tracing::trace!(target: LOCK_TARGET, file = %key, ?mode, "lock: waiting");
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn lock_wait(_key: &FileKey, _mode: LockMode) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn lock_timeout(key: &FileKey, mode: LockMode, waited: Duration) {
    tracing::info!(
        target: LOCK_TARGET,
        file = %key,
        ?mode,
        waited_ms = waited.as_millis() as u64,
        "lock: timed out"
    );
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn lock_timeout(_key: &FileKey, _mode: LockMode, _waited: Duration) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn lock_acquired(set: &LockSet) {
    tracing::trace!(target: LOCK_TARGET, files = set.len(), "lock: set acquired");
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn lock_acquired(_set: &LockSet) {}

// ============================================================================
// Fetching and applying
// ============================================================================

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn pull_failed(key: &FileKey, dest: usize, failure: &PullFailure) {
    tracing::debug!(target: APPLY_TARGET, file = %key, dest, %failure, "pull: failed");
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn pull_failed(_key: &FileKey, _dest: usize, _failure: &PullFailure) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn external_demoted(key: &FileKey, dests: &[usize]) {
    tracing::debug!(
        target: APPLY_TARGET,
        file = %key,
        ?dests,
        "external: source no longer matches, pulling instead"
    );
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn external_demoted(_key: &FileKey, _dests: &[usize]) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn phase(key: &FileKey, phase: ApplyPhase) {
    tracing::trace!(target: APPLY_TARGET, file = %key, ?phase, "apply: phase");
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn phase(_key: &FileKey, _phase: ApplyPhase) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn committed(key: &FileKey, stats: &ApplyStats) {
    tracing::info!(
        target: APPLY_TARGET,
        file = %key,
        local = stats.local,
        from_scratch = stats.from_scratch,
        external = stats.external,
        pulled = stats.pulled,
        bytes_written = stats.bytes_written,
        "apply: committed"
    );
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn committed(_key: &FileKey, _stats: &ApplyStats) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn rolled_back(key: &FileKey, restored: bool) {
    if restored {
        tracing::warn!(target: APPLY_TARGET, file = %key, "apply: rolled back");
    } else {
        tracing::warn!(target: APPLY_TARGET, file = %key, "apply: rollback failed, marker left");
    }
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn rolled_back(_key: &FileKey, _restored: bool) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn cleanup_failed(path: &Path, error: &io::Error) {
    tracing::warn!(
        target: APPLY_TARGET,
        path = %path.display(),
        %error,
        "apply: journal cleanup failed"
    );
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn cleanup_failed(_path: &Path, _error: &io::Error) {}

// ============================================================================
// Recovery
// ============================================================================

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn recovery(outcome: &RecoveryOutcome) {
    match outcome {
        RecoveryOutcome::Clean => {}
        RecoveryOutcome::RolledBack { key } => {
            tracing::warn!(target: RECOVERY_TARGET, file = %key, "recovery: restored original");
        }
        RecoveryOutcome::AlreadyCommitted { key } => {
            tracing::info!(
                target: RECOVERY_TARGET,
                file = %key,
                "recovery: patch was complete"
            );
        }
        RecoveryOutcome::DiscardedOrphan { path } => {
            tracing::debug!(
                target: RECOVERY_TARGET,
                path = %path.display(),
                "recovery: orphan removed"
            );
        }
    }
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn recovery(_outcome: &RecoveryOutcome) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn recovery_skipped(path: &Path, error: &dyn std::error::Error) {
    tracing::warn!(
        target: RECOVERY_TARGET,
        path = %path.display(),
        %error,
        "recovery: marker skipped"
    );
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn recovery_skipped(_path: &Path, _error: &dyn std::error::Error) {}

// ============================================================================
// Pipeline
// ============================================================================

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn worker_started(worker: usize) {
    tracing::trace!(target: PIPELINE_TARGET, worker, "pipeline: worker started");
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn worker_started(_worker: usize) {}

#[cfg(feature = "tracing")]
#[inline]
pub(crate) fn report(report: &UpdateReport) {
    tracing::debug!(
        target: PIPELINE_TARGET,
        file = %report.key,
        outcome = report.outcome.label(),
        "pipeline: update finished"
    );
}

#[cfg(not(feature = "tracing"))]
#[inline]
pub(crate) fn report(_report: &UpdateReport) {}
