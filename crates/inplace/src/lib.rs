#![deny(unsafe_code)]

//! In-place update of synchronized files.
//!
//! Given a file that already exists locally and a newer version announced by
//! a peer, this crate decides whether the file can be patched where it lies
//! instead of being rewritten, plans the patch, and applies it without ever
//! leaving the destination in a state from which neither the old nor the new
//! content can be reconstructed.
//!
//! # Flow
//!
//! ```text
//! Pipeline worker
//!   ├─ admission::evaluate      cost gate from block counts
//!   ├─ Planner::plan            intra-file, external and pull commands
//!   ├─ LockTable::acquire       destination exclusive, sources shared
//!   ├─ stale_external_copies    re-check external sources, demote to pulls
//!   ├─ fetch::fetch_all         network pulls, verified by digest
//!   └─ apply::apply_plan        stage → patch → commit (or roll back)
//! ```
//!
//! # Durability
//!
//! Every block the patch will change is copied into a per-file scratch file
//! and described by a JSON marker before the first destination byte is
//! written. Removing the marker is the commit point. A marker found on a later
//! pass is resolved by [`recovery::recover_file`], which restores the original
//! content from scratch.
//!
//! # Lock order
//!
//! Locks are always acquired in ascending [`FileKey`] order (folder, then
//! path). Callers that take these locks outside the pipeline must use the same
//! order through [`LockTable::acquire`].

pub mod admission;
pub mod apply;
mod cancel;
pub mod config;
pub mod error;
pub mod fetch;
pub mod index;
pub mod journal;
mod key;
pub mod lock;
pub mod pipeline;
pub mod plan;
pub mod recovery;
mod state;
pub mod storage;
mod trace;

pub use admission::{AdmissionEstimate, should_update_in_place};
pub use apply::{ApplyPhase, ApplyStats, apply_plan, stale_external_copies};
pub use cancel::CancelToken;
pub use config::InPlaceConfig;
pub use error::{ErrorCategory, IneligibleReason, InPlaceError, PlanningAbortCause};
pub use fetch::{BlockFetcher, LocalFetcher, PullDelivery, PullFailure, PullRequest, PulledBlocks};
pub use index::{BlockIndex, BlockLocation, IndexError, MemoryBlockIndex};
pub use key::{FileKey, FolderId};
pub use lock::{LockGuard, LockMode, LockSet, LockTable};
pub use pipeline::{Dependencies, Pipeline, UpdateJob, UpdateOutcome, UpdateReport, UpdateRequest};
pub use plan::{
    DeltaPlan, ExternalCopy, LocalCopy, PlanViolation, Planner, PullCommand, StagedBlock,
};
pub use recovery::{RecoveryError, RecoveryOutcome, recover_file, recover_folder};
pub use state::PullState;
pub use storage::{BlockFile, FileOpener, Folders};
