//! Error categorization for in-place updates.
//!
//! Failures fall into a few handling strategies the caller can act on without
//! inspecting every variant:
//!
//! - **Routing**: the file is simply not a candidate; rewrite it in full.
//! - **Retry**: nothing was touched; try again on a later pull pass.
//! - **Fallback**: some blocks could not be obtained; rewrite those in full.
//! - **Recovery**: the destination was touched and a marker is left on disk
//!   for [`recover_file`](crate::recover_file) to resolve.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::apply::ApplyPhase;
use crate::index::IndexError;
use crate::key::FileKey;
use crate::recovery::RecoveryError;

/// Errors raised while admitting, planning, locking, fetching or applying an
/// in-place update.
#[derive(Debug, Error)]
pub enum InPlaceError {
    /// The admission heuristic or the planner declined the file.
    #[error("not eligible for in-place update: {0}")]
    NotEligible(IneligibleReason),

    /// Planning stopped before a complete plan was produced.
    #[error("planning aborted: {0}")]
    PlanningAborted(#[source] PlanningAbortCause),

    /// A required lock could not be acquired within the configured wait.
    #[error("timed out after {waited:?} waiting for lock on {key}")]
    LockTimeout {
        /// File whose lock was still held by another worker.
        key: FileKey,
        /// Time spent waiting for the full lock set.
        waited: Duration,
    },

    /// Failure while preserving rollback data; the destination is untouched.
    #[error("staging failed at {}: {source}", path.display())]
    StagingIo {
        /// Path of the file being read or written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Failure after destination bytes were modified.
    #[error(
        "patching failed at {}: {source}{}",
        path.display(),
        if *rolled_back { " (rolled back)" } else { " (marker left for recovery)" }
    )]
    PatchingIo {
        /// Path of the file being read or written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
        /// Whether the original content was restored in process.
        rolled_back: bool,
    },

    /// One or more network pulls never completed.
    #[error("{} pull request(s) unresolved", blocks.len())]
    PullUnresolved {
        /// Destination block indices that still need data.
        blocks: Vec<usize>,
    },

    /// A block read from a source did not hash to the expected digest.
    #[error(
        "block {block} of {} does not match its expected digest during {phase:?}",
        path.display()
    )]
    DigestMismatch {
        /// File whose data did not match.
        path: PathBuf,
        /// Block index in that file.
        block: usize,
        /// Phase in which the mismatch was detected.
        phase: ApplyPhase,
        /// Whether the original content was restored in process.
        rolled_back: bool,
    },

    /// The destination length differs from the planned current version.
    #[error("destination {} is {actual} bytes, plan expected {expected}", path.display())]
    DestinationChanged {
        /// Destination path.
        path: PathBuf,
        /// Length the plan was computed against.
        expected: u64,
        /// Length found on disk.
        actual: u64,
    },

    /// A stale patch marker could not be resolved.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// Other I/O failure outside the staging and patching phases.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Why a file was routed to a full rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IneligibleReason {
    /// There is no local file to patch.
    #[error("no current file exists")]
    NoCurrentFile,
    /// The working-set estimate exceeds the cost of writing the target fresh.
    #[error("estimated delta cost {estimated} exceeds {budget} blocks")]
    CostExceeded {
        /// `replacing * 2 + appending`.
        estimated: usize,
        /// Target block count.
        budget: usize,
    },
    /// The scratch area needed for rollback exceeds the configured bound.
    #[error("scratch area of {required} bytes exceeds limit of {limit}")]
    ScratchLimit {
        /// Bytes that would have to be staged.
        required: u64,
        /// Configured maximum.
        limit: u64,
    },
    /// The two versions were hashed with different block sizes.
    #[error("block size {current} of current file differs from target block size {target}")]
    BlockSizeMismatch {
        /// Block size of the current version.
        current: u32,
        /// Block size of the target version.
        target: u32,
    },
}

/// Why planning was abandoned.
#[derive(Debug, Error)]
pub enum PlanningAbortCause {
    /// The owning folder or job was cancelled.
    #[error("cancelled")]
    Cancelled,
    /// The block index failed to answer a query.
    #[error("block index query failed: {0}")]
    Index(#[from] IndexError),
}

/// Handling strategy implied by an [`InPlaceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Not a failure; the caller should rewrite the file in full.
    Routing,
    /// Nothing was touched; retry on a later pass.
    Retry,
    /// Rewrite the unresolved blocks in full.
    Fallback,
    /// The destination must be resolved through recovery before reuse.
    Recovery,
}

impl InPlaceError {
    /// Returns the handling strategy for the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotEligible(_) => ErrorCategory::Routing,
            Self::PullUnresolved { .. } => ErrorCategory::Fallback,
            Self::PatchingIo {
                rolled_back: false, ..
            }
            | Self::DigestMismatch {
                phase: ApplyPhase::Patching,
                rolled_back: false,
                ..
            }
            | Self::Recovery(_) => ErrorCategory::Recovery,
            Self::PlanningAborted(_)
            | Self::LockTimeout { .. }
            | Self::StagingIo { .. }
            | Self::PatchingIo { .. }
            | Self::DigestMismatch { .. }
            | Self::DestinationChanged { .. }
            | Self::Io { .. } => ErrorCategory::Retry,
        }
    }

    /// Reports whether a later pass may succeed without operator action.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::NotEligible(_))
    }

    /// Reports whether destination bytes may have been modified.
    #[must_use]
    pub fn touched_destination(&self) -> bool {
        matches!(
            self,
            Self::PatchingIo { .. }
                | Self::DigestMismatch {
                    phase: ApplyPhase::Patching,
                    ..
                }
        )
    }

    pub(crate) fn staging(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::StagingIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<IneligibleReason> for InPlaceError {
    fn from(reason: IneligibleReason) -> Self {
        Self::NotEligible(reason)
    }
}

impl From<PlanningAbortCause> for InPlaceError {
    fn from(cause: PlanningAbortCause) -> Self {
        Self::PlanningAborted(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_destination_state() {
        let routing = InPlaceError::from(IneligibleReason::NoCurrentFile);
        assert_eq!(routing.category(), ErrorCategory::Routing);
        assert!(!routing.is_recoverable());

        let staging = InPlaceError::staging("/tmp/x", io::Error::other("disk"));
        assert_eq!(staging.category(), ErrorCategory::Retry);
        assert!(!staging.touched_destination());

        let rolled_back = InPlaceError::PatchingIo {
            path: PathBuf::from("/tmp/x"),
            source: io::Error::other("disk"),
            rolled_back: true,
        };
        assert_eq!(rolled_back.category(), ErrorCategory::Retry);
        assert!(rolled_back.touched_destination());

        let stranded = InPlaceError::PatchingIo {
            path: PathBuf::from("/tmp/x"),
            source: io::Error::other("disk"),
            rolled_back: false,
        };
        assert_eq!(stranded.category(), ErrorCategory::Recovery);

        let pulls = InPlaceError::PullUnresolved { blocks: vec![3, 7] };
        assert_eq!(pulls.category(), ErrorCategory::Fallback);
        assert_eq!(pulls.to_string(), "2 pull request(s) unresolved");
    }

    #[test]
    fn staging_mismatch_is_retryable() {
        let staging = InPlaceError::DigestMismatch {
            path: PathBuf::from("/tmp/x"),
            block: 2,
            phase: ApplyPhase::Staging,
            rolled_back: false,
        };
        assert_eq!(staging.category(), ErrorCategory::Retry);
        assert!(!staging.touched_destination());

        let patching = InPlaceError::DigestMismatch {
            path: PathBuf::from("/tmp/x"),
            block: 2,
            phase: ApplyPhase::Patching,
            rolled_back: false,
        };
        assert_eq!(patching.category(), ErrorCategory::Recovery);
    }

    #[test]
    fn planning_cause_converts() {
        let error = InPlaceError::from(PlanningAbortCause::Cancelled);
        assert_eq!(error.to_string(), "planning aborted: cancelled");
    }
}
