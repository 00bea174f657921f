//! Staged, crash-safe execution of a [`DeltaPlan`].
//!
//! ```text
//! Planned ─► Locked ─► Staging ─► Patching ─► Committed
//!                         │           │
//!                         └───────────┴─► Aborted
//! ```
//!
//! Staging copies every current block the patch changes into the scratch
//! file and installs the marker; the destination is untouched until both
//! are durable. Patching runs intra-file copies first, in plan order, then
//! external copies grouped by source file, then pulled blocks, and finally
//! sets the target length. Every block is checked against its target digest
//! before it is written. On failure the staged blocks are written back in
//! process; if that also fails the marker stays on disk for
//! [`recover_file`](crate::recover_file).

use std::io;
use std::path::{Path, PathBuf};

use blocks::{BlockDigest, FileVersion};
use rustc_hash::FxHashMap;

use crate::config::InPlaceConfig;
use crate::error::InPlaceError;
use crate::fetch::PulledBlocks;
use crate::journal::{
    self, JournalPaths, MARKER_VERSION, PatchMarker, ScratchReader, ScratchWriter, StagedEntry,
};
use crate::lock::LockGuard;
use crate::plan::DeltaPlan;
use crate::recovery::{self, recover_file};
use crate::storage::{BlockFile, FileOpener};
use crate::trace;

/// Position of an update in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApplyPhase {
    /// A plan exists; nothing is locked.
    Planned,
    /// Every lock of the plan is held.
    Locked,
    /// Rollback data is being written; the destination is untouched.
    Staging,
    /// Destination bytes are being modified.
    Patching,
    /// The marker is gone and the destination holds the target.
    Committed,
    /// The update stopped; the destination holds the original or a marker
    /// describes how to restore it.
    Aborted,
}

/// Work done by one successful apply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Blocks already in place.
    pub identity: usize,
    /// Blocks moved within the file.
    pub local: usize,
    /// Intra-file moves whose source came from scratch.
    pub from_scratch: usize,
    /// Blocks copied from other files.
    pub external: usize,
    /// Blocks written from network pulls.
    pub pulled: usize,
    /// Bytes preserved in scratch.
    pub staged_bytes: u64,
    /// Bytes written to the destination.
    pub bytes_written: u64,
}

/// Applies `plan` to its destination.
///
/// `guard` must hold every lock of [`DeltaPlan::lock_set`] and `pulled` must
/// contain every pull of the plan. A marker left by an earlier attempt is
/// resolved first.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(level = "debug", skip_all, fields(file = %plan.key()))
)]
pub fn apply_plan(
    plan: &DeltaPlan,
    guard: &LockGuard,
    pulled: &PulledBlocks,
    opener: &dyn FileOpener,
    config: &InPlaceConfig,
) -> Result<ApplyStats, InPlaceError> {
    let key = plan.key();
    let dest_path = opener
        .path_of(key)
        .map_err(|error| InPlaceError::io(key.path(), error))?;
    if !guard.covers(&plan.lock_set()) {
        return Err(InPlaceError::io(
            &dest_path,
            io::Error::new(io::ErrorKind::PermissionDenied, "plan locks are not held"),
        ));
    }
    trace::phase(key, ApplyPhase::Locked);

    let missing: Vec<usize> = plan
        .pulls()
        .iter()
        .map(|pull| pull.dest)
        .filter(|&dest| pulled.get(dest).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(InPlaceError::PullUnresolved { blocks: missing });
    }

    recover_file(opener, key, config.fsync)?;

    let mut dest = opener
        .open_destination(key)
        .map_err(|error| InPlaceError::io(&dest_path, error))?;
    let actual = dest.len().map_err(|error| InPlaceError::io(&dest_path, error))?;
    if actual != plan.current().size() {
        return Err(InPlaceError::DestinationChanged {
            path: dest_path,
            expected: plan.current().size(),
            actual,
        });
    }

    let scratch_dir = opener
        .scratch_dir(key.folder())
        .map_err(|error| InPlaceError::staging(&dest_path, error))?;
    let paths = JournalPaths::for_key(&scratch_dir, key);

    trace::phase(key, ApplyPhase::Staging);
    let mut staged = match stage(plan, dest.as_mut(), &paths, &dest_path, config.fsync) {
        Ok(staged) => staged,
        Err(error) => {
            // Nothing was written to the destination; the journal is garbage.
            if let Err(cleanup) = journal::clear(&paths, false) {
                trace::cleanup_failed(&paths.marker, &cleanup);
            }
            trace::phase(key, ApplyPhase::Aborted);
            return Err(error);
        }
    };

    trace::phase(key, ApplyPhase::Patching);
    let mut stats = ApplyStats {
        staged_bytes: plan.staged_bytes(),
        ..ApplyStats::default()
    };
    let patch = Patch {
        plan,
        opener,
        pulled,
        dest_path: &dest_path,
        fsync: config.fsync,
    };
    if let Err(failure) = patch.run(dest.as_mut(), &mut staged, &mut stats) {
        let restored = recovery::restore(
            dest.as_mut(),
            &mut staged.reader,
            &staged.marker,
            &paths.scratch,
            &dest_path,
            config.fsync,
        )
        .is_ok()
            && journal::clear(&paths, config.fsync).is_ok();
        trace::rolled_back(key, restored);
        trace::phase(key, ApplyPhase::Aborted);
        return Err(failure.into_error(restored));
    }

    journal::clear(&paths, config.fsync)
        .map_err(|error| InPlaceError::io(&paths.marker, error))?;
    trace::phase(key, ApplyPhase::Committed);
    trace::committed(key, &stats);
    Ok(stats)
}

/// Returns the destinations of external copies whose source no longer holds
/// the target bytes at the indexed offset.
///
/// Sources are only read, so the caller must hold their shared locks. An
/// unreadable source counts every one of its copies as stale.
pub fn stale_external_copies(plan: &DeltaPlan, opener: &dyn FileOpener) -> Vec<usize> {
    let target = plan.target();
    let mut stale = Vec::new();
    let mut buf = Vec::new();
    for (source_file, copies) in plan.external_by_file() {
        let Ok(mut source) = opener.open_source(source_file) else {
            stale.extend(copies.iter().map(|copy| copy.dest));
            continue;
        };
        for copy in copies {
            let Some(block) = target.block(copy.dest) else {
                stale.push(copy.dest);
                continue;
            };
            buf.resize(block.size() as usize, 0);
            let intact = source.read_at(copy.offset, &mut buf).is_ok()
                && block.digest().matches(&buf);
            if !intact {
                stale.push(copy.dest);
            }
        }
    }
    stale.sort_unstable();
    stale
}

struct Staged {
    marker: PatchMarker,
    reader: ScratchReader,
    scratch_path: PathBuf,
}

fn stage(
    plan: &DeltaPlan,
    dest: &mut dyn BlockFile,
    paths: &JournalPaths,
    dest_path: &Path,
    fsync: bool,
) -> Result<Staged, InPlaceError> {
    let current = plan.current();
    let mismatch = |block| InPlaceError::DigestMismatch {
        path: dest_path.to_path_buf(),
        block,
        phase: ApplyPhase::Staging,
        rolled_back: false,
    };

    let mut buf = Vec::new();
    for copy in plan.copies().iter().filter(|copy| copy.is_identity()) {
        let digest = read_block(dest, current, copy.source, &mut buf)
            .map_err(|error| InPlaceError::staging(dest_path, error))?;
        if !digest.is_some_and(|digest| digest.matches(&buf)) {
            return Err(mismatch(copy.source));
        }
    }

    let mut writer = ScratchWriter::create(&paths.scratch)
        .map_err(|error| InPlaceError::staging(&paths.scratch, error))?;
    let mut entries = Vec::with_capacity(plan.staged().len());
    for block in plan.staged() {
        read_block(dest, current, block.index, &mut buf)
            .map_err(|error| InPlaceError::staging(dest_path, error))?;
        if !block.digest.matches(&buf) {
            return Err(mismatch(block.index));
        }
        let scratch_offset = writer
            .append(&buf)
            .map_err(|error| InPlaceError::staging(&paths.scratch, error))?;
        entries.push(StagedEntry {
            block: block.index,
            scratch_offset,
            len: block.len,
            digest: block.digest,
        });
    }
    let reader = writer
        .finish(fsync)
        .map_err(|error| InPlaceError::staging(&paths.scratch, error))?;

    let marker = PatchMarker {
        version: MARKER_VERSION,
        file: plan.key().clone(),
        block_size: plan.block_size(),
        original_len: current.size(),
        target_len: plan.target().size(),
        staged: entries,
        target: plan.target().digests(),
    };
    journal::write_marker(paths, &marker, fsync)
        .map_err(|error| InPlaceError::staging(&paths.marker, error))?;
    Ok(Staged {
        marker,
        reader,
        scratch_path: paths.scratch.clone(),
    })
}

/// Reads block `index` of `version` into `buf`, returning its digest.
fn read_block(
    file: &mut dyn BlockFile,
    version: &FileVersion,
    index: usize,
    buf: &mut Vec<u8>,
) -> io::Result<Option<BlockDigest>> {
    let Some(block) = version.block(index) else {
        buf.clear();
        return Ok(None);
    };
    buf.resize(block.size() as usize, 0);
    file.read_at(block.offset(), buf)?;
    Ok(Some(block.digest()))
}

enum PatchFailure {
    Io { path: PathBuf, source: io::Error },
    Mismatch { path: PathBuf, block: usize },
}

impl PatchFailure {
    fn into_error(self, rolled_back: bool) -> InPlaceError {
        match self {
            Self::Io { path, source } => InPlaceError::PatchingIo {
                path,
                source,
                rolled_back,
            },
            Self::Mismatch { path, block } => InPlaceError::DigestMismatch {
                path,
                block,
                phase: ApplyPhase::Patching,
                rolled_back,
            },
        }
    }
}

struct Patch<'a> {
    plan: &'a DeltaPlan,
    opener: &'a dyn FileOpener,
    pulled: &'a PulledBlocks,
    dest_path: &'a Path,
    fsync: bool,
}

impl Patch<'_> {
    fn run(
        &self,
        dest: &mut dyn BlockFile,
        staged: &mut Staged,
        stats: &mut ApplyStats,
    ) -> Result<(), PatchFailure> {
        let plan = self.plan;
        let target = plan.target();
        let mut writer = TargetWriter {
            dest,
            target,
            path: self.dest_path,
            bytes_written: 0,
        };

        let entries: FxHashMap<usize, &StagedEntry> = staged
            .marker
            .staged
            .iter()
            .map(|entry| (entry.block, entry))
            .collect();
        let mut buf = Vec::new();
        for copy in plan.copies() {
            if copy.is_identity() {
                stats.identity += 1;
                continue;
            }
            if copy.from_scratch {
                let entry = entries
                    .get(&copy.source)
                    .ok_or_else(|| PatchFailure::Mismatch {
                        path: self.dest_path.to_path_buf(),
                        block: copy.dest,
                    })?;
                buf = staged
                    .reader
                    .read(entry)
                    .map_err(io_failure(&staged.scratch_path))?;
                stats.from_scratch += 1;
            } else {
                read_block(writer.dest, plan.current(), copy.source, &mut buf)
                    .map_err(io_failure(self.dest_path))?;
            }
            writer.write(copy.dest, &buf)?;
            stats.local += 1;
        }

        for (source_file, copies) in plan.external_by_file() {
            let source_path = self
                .opener
                .path_of(source_file)
                .unwrap_or_else(|_| source_file.path().to_path_buf());
            let mut source = self
                .opener
                .open_source(source_file)
                .map_err(io_failure(&source_path))?;
            for copy in copies {
                let len = target.block(copy.dest).map_or(0, |block| block.size());
                buf.resize(len as usize, 0);
                source
                    .read_at(copy.offset, &mut buf)
                    .map_err(io_failure(&source_path))?;
                writer.write(copy.dest, &buf)?;
                stats.external += 1;
            }
        }

        for pull in plan.pulls() {
            let data = self
                .pulled
                .get(pull.dest)
                .ok_or_else(|| PatchFailure::Mismatch {
                    path: self.dest_path.to_path_buf(),
                    block: pull.dest,
                })?;
            writer.write(pull.dest, data)?;
            stats.pulled += 1;
        }

        stats.bytes_written = writer.bytes_written;
        writer
            .dest
            .set_len(target.size())
            .map_err(io_failure(self.dest_path))?;
        if self.fsync {
            writer.dest.sync().map_err(io_failure(self.dest_path))?;
        }
        Ok(())
    }
}

fn io_failure(path: &Path) -> impl FnOnce(io::Error) -> PatchFailure {
    let path = path.to_path_buf();
    move |source| PatchFailure::Io { path, source }
}

/// Writes target blocks after checking them against their digests.
struct TargetWriter<'a> {
    dest: &'a mut dyn BlockFile,
    target: &'a FileVersion,
    path: &'a Path,
    bytes_written: u64,
}

impl TargetWriter<'_> {
    fn write(&mut self, dest: usize, data: &[u8]) -> Result<(), PatchFailure> {
        let mismatch = || PatchFailure::Mismatch {
            path: self.path.to_path_buf(),
            block: dest,
        };
        let block = self.target.block(dest).ok_or_else(mismatch)?;
        if data.len() != block.size() as usize || !block.digest().matches(data) {
            return Err(mismatch());
        }
        self.dest
            .write_at(block.offset(), data)
            .map_err(|source| PatchFailure::Io {
                path: self.path.to_path_buf(),
                source,
            })?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }
}
