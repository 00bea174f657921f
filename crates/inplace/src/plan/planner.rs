//! Builds a [`DeltaPlan`] from a [`PullState`].

use blocks::{BlockDigest, FileVersion};
use rustc_hash::FxHashMap;
#[cfg(feature = "tracing")]
use tracing::instrument;

use super::graph::order_copies;
use super::{DeltaPlan, ExternalCopy, PullCommand, StagedBlock};
use crate::cancel::CancelToken;
use crate::error::{IneligibleReason, InPlaceError, PlanningAbortCause};
use crate::index::{BlockIndex, BlockLocation};
use crate::key::{FileKey, FolderId};
use crate::state::PullState;
use crate::trace;

/// Resolves target blocks to local copies, external copies or pulls.
pub struct Planner<'a> {
    index: &'a dyn BlockIndex,
    candidates: &'a [FolderId],
    cancel: &'a CancelToken,
    max_scratch_bytes: u64,
}

impl<'a> Planner<'a> {
    /// Creates a planner that searches `candidates` in `index` for blocks the
    /// current file does not have.
    #[must_use]
    pub fn new(
        index: &'a dyn BlockIndex,
        candidates: &'a [FolderId],
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            index,
            candidates,
            cancel,
            max_scratch_bytes: u64::MAX,
        }
    }

    /// Bounds the scratch area a plan may require.
    #[must_use]
    pub fn with_max_scratch_bytes(mut self, bytes: u64) -> Self {
        self.max_scratch_bytes = bytes;
        self
    }

    /// Computes the plan for `state` and records its intra-file copy count as
    /// the state's copy total.
    ///
    /// Cancellation is checked before every block-index query. No partial
    /// plan is returned.
    #[cfg_attr(
        feature = "tracing",
        instrument(skip_all, fields(file = %state.key()), name = "plan")
    )]
    pub fn plan(&self, state: &PullState) -> Result<DeltaPlan, InPlaceError> {
        let snapshot = state.snapshot();
        let key = state.key();
        let current = snapshot.current.ok_or(IneligibleReason::NoCurrentFile)?;
        let target = snapshot.target;
        if current.block_size() != target.block_size() {
            return Err(IneligibleReason::BlockSizeMismatch {
                current: current.block_size(),
                target: target.block_size(),
            }
            .into());
        }

        let local = local_positions(&current);
        let mut pairs = Vec::new();
        let mut external = Vec::new();
        let mut pulls = Vec::new();

        for block in target.blocks() {
            let dest = block.index();
            let digest = block.digest();
            if current.block(dest).is_some_and(|cur| cur.digest() == digest) {
                pairs.push((dest, dest));
                continue;
            }
            if let Some(&source) = local.get(&digest) {
                pairs.push((source, dest));
                continue;
            }

            self.cancel.check()?;
            match self.find_external(key, &digest, block.size())? {
                Some(hit) => external.push(ExternalCopy {
                    source_file: hit.file,
                    source: hit.index,
                    offset: hit.offset,
                    dest,
                }),
                None => pulls.push(PullCommand { digest, dest }),
            }
        }
        self.cancel.check()?;

        let copies = order_copies(&pairs);
        let staged = staged_blocks(&current, &pairs);
        let plan = DeltaPlan::new(key.clone(), current, target, copies, external, pulls, staged);

        let required = plan.staged_bytes();
        if required > self.max_scratch_bytes {
            return Err(IneligibleReason::ScratchLimit {
                required,
                limit: self.max_scratch_bytes,
            }
            .into());
        }
        debug_assert_eq!(plan.destinations_partition(), Ok(()));
        debug_assert_eq!(plan.check_ordering(), Ok(()));

        state.set_copy_total(plan.copies().len());
        trace::plan_built(&plan);
        Ok(plan)
    }

    fn find_external(
        &self,
        key: &FileKey,
        digest: &BlockDigest,
        len: u32,
    ) -> Result<Option<BlockLocation>, PlanningAbortCause> {
        for hit in self.index.lookup(digest, self.candidates) {
            let hit = hit?;
            // The current version is authoritative for the file itself.
            if &hit.file == key || hit.len != len {
                continue;
            }
            return Ok(Some(hit));
        }
        Ok(None)
    }
}

/// First index of every digest in the current version.
fn local_positions(current: &FileVersion) -> FxHashMap<BlockDigest, usize> {
    let mut positions = FxHashMap::default();
    for block in current.blocks() {
        positions.entry(block.digest()).or_insert(block.index());
    }
    positions
}

/// Current blocks that the patch changes: overwritten blocks other than
/// identity copies, plus the tail a shrinking file loses.
fn staged_blocks(current: &FileVersion, pairs: &[(usize, usize)]) -> Vec<StagedBlock> {
    let mut unchanged = vec![false; current.block_count()];
    for &(source, dest) in pairs {
        if source == dest {
            unchanged[dest] = true;
        }
    }
    current
        .blocks()
        .iter()
        .filter(|block| !unchanged[block.index()])
        .map(|block| StagedBlock {
            index: block.index(),
            len: block.size(),
            digest: block.digest(),
        })
        .collect()
}
