//! Resolution of patches interrupted by a crash or an I/O failure.
//!
//! A marker on disk means the destination may be anywhere between its
//! original and its target content. Recovery first checks whether every
//! target block is already in place; if so the patch finished and only the
//! journal is removed. Otherwise the staged blocks are written back and the
//! file is cut to its original length, which reproduces the original bytes
//! exactly because every block the patch could change was staged.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use blocks::FileVersion;
use thiserror::Error;

use crate::journal::{
    self, JournalPaths, MARKER_EXTENSION, MARKER_VERSION, PENDING_EXTENSION, PatchMarker,
    SCRATCH_EXTENSION, ScratchReader,
};
use crate::key::{FileKey, FolderId};
use crate::storage::{BlockFile, FileOpener};
use crate::trace;

/// What recovery did for one journal entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No journal entry existed.
    Clean,
    /// The original content was restored from scratch.
    RolledBack {
        /// Restored file.
        key: FileKey,
    },
    /// The file already held its target content; the journal was removed.
    AlreadyCommitted {
        /// Completed file.
        key: FileKey,
    },
    /// A scratch or pending marker file without a marker was deleted.
    DiscardedOrphan {
        /// Deleted path.
        path: PathBuf,
    },
}

/// Failure to resolve a journal entry. The entry is left in place.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The marker could not be read or decoded.
    #[error("unreadable patch marker {}: {source}", path.display())]
    Marker {
        /// Marker path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The marker was written by an unknown format version.
    #[error("patch marker {} has unsupported version {version}", path.display())]
    UnsupportedVersion {
        /// Marker path.
        path: PathBuf,
        /// Version found in the marker.
        version: u32,
    },
    /// A staged block does not match the digest recorded for it.
    #[error("scratch file {} is corrupt at block {block}", path.display())]
    ScratchCorrupt {
        /// Scratch path.
        path: PathBuf,
        /// Block index of the corrupt entry.
        block: usize,
    },
    /// I/O failure while restoring.
    #[error("recovery I/O error on {}: {source}", path.display())]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl RecoveryError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Resolves the journal entry of `key`, if any.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(level = "debug", skip(opener), fields(file = %key))
)]
pub fn recover_file(
    opener: &dyn FileOpener,
    key: &FileKey,
    fsync: bool,
) -> Result<RecoveryOutcome, RecoveryError> {
    let scratch_dir = opener
        .scratch_dir(key.folder())
        .map_err(|error| RecoveryError::io(key.path(), error))?;
    let paths = JournalPaths::for_key(&scratch_dir, key);

    let outcome = if paths.has_marker() {
        let marker = load_marker(&paths.marker)?;
        resolve(opener, &paths, &marker, fsync)?
    } else if paths.scratch.exists() || paths.pending.exists() {
        journal::clear(&paths, fsync).map_err(|error| RecoveryError::io(&paths.scratch, error))?;
        RecoveryOutcome::DiscardedOrphan {
            path: paths.scratch,
        }
    } else {
        RecoveryOutcome::Clean
    };
    trace::recovery(&outcome);
    Ok(outcome)
}

/// Resolves every journal entry in the scratch directory of `folder`.
///
/// Markers are resolved first; scratch and pending files left without a
/// marker are deleted afterwards. A failing marker does not stop the scan;
/// the first failure is returned once every other entry has been handled.
pub fn recover_folder(
    opener: &dyn FileOpener,
    folder: &FolderId,
    fsync: bool,
) -> Result<Vec<RecoveryOutcome>, RecoveryError> {
    let scratch_dir = opener
        .scratch_dir(folder)
        .map_err(|error| RecoveryError::io(Path::new(folder.as_str()), error))?;
    let mut names = Vec::new();
    let entries =
        fs::read_dir(&scratch_dir).map_err(|error| RecoveryError::io(&scratch_dir, error))?;
    for entry in entries {
        let entry = entry.map_err(|error| RecoveryError::io(&scratch_dir, error))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    names.sort();

    let mut outcomes = Vec::new();
    let mut first_error = None;
    let marker_suffix = format!(".{MARKER_EXTENSION}");
    for stem in names.iter().filter_map(|name| name.strip_suffix(&marker_suffix)) {
        let paths = JournalPaths::for_name(&scratch_dir, stem);
        let resolved = load_marker(&paths.marker)
            .and_then(|marker| resolve(opener, &paths, &marker, fsync));
        match resolved {
            Ok(outcome) => {
                trace::recovery(&outcome);
                outcomes.push(outcome);
            }
            Err(error) => {
                trace::recovery_skipped(&paths.marker, &error);
                first_error.get_or_insert(error);
            }
        }
    }

    let scratch_suffix = format!(".{SCRATCH_EXTENSION}");
    let pending_suffix = format!(".{MARKER_EXTENSION}.{PENDING_EXTENSION}");
    for name in &names {
        let stem = name
            .strip_suffix(&scratch_suffix)
            .or_else(|| name.strip_suffix(&pending_suffix));
        let Some(stem) = stem else {
            continue;
        };
        let path = scratch_dir.join(name);
        if JournalPaths::for_name(&scratch_dir, stem).has_marker() || !path.exists() {
            continue;
        }
        journal::remove_if_exists(&path).map_err(|error| RecoveryError::io(&path, error))?;
        let outcome = RecoveryOutcome::DiscardedOrphan { path };
        trace::recovery(&outcome);
        outcomes.push(outcome);
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(outcomes),
    }
}

fn load_marker(path: &Path) -> Result<PatchMarker, RecoveryError> {
    let marker = journal::read_marker(path).map_err(|source| RecoveryError::Marker {
        path: path.to_path_buf(),
        source,
    })?;
    if marker.version != MARKER_VERSION {
        return Err(RecoveryError::UnsupportedVersion {
            path: path.to_path_buf(),
            version: marker.version,
        });
    }
    Ok(marker)
}

fn resolve(
    opener: &dyn FileOpener,
    paths: &JournalPaths,
    marker: &PatchMarker,
    fsync: bool,
) -> Result<RecoveryOutcome, RecoveryError> {
    let dest_path = opener
        .path_of(&marker.file)
        .unwrap_or_else(|_| marker.file.path().to_path_buf());
    let mut dest = opener
        .open_destination(&marker.file)
        .map_err(|error| RecoveryError::io(&dest_path, error))?;

    let complete = holds_target(dest.as_mut(), marker)
        .map_err(|error| RecoveryError::io(&dest_path, error))?;
    let outcome = if complete {
        RecoveryOutcome::AlreadyCommitted {
            key: marker.file.clone(),
        }
    } else {
        let mut scratch = ScratchReader::open(&paths.scratch)
            .map_err(|error| RecoveryError::io(&paths.scratch, error))?;
        restore(dest.as_mut(), &mut scratch, marker, &paths.scratch, &dest_path, fsync)?;
        RecoveryOutcome::RolledBack {
            key: marker.file.clone(),
        }
    };

    journal::clear(paths, fsync).map_err(|error| RecoveryError::io(&paths.marker, error))?;
    Ok(outcome)
}

/// Writes every staged block back and cuts the file to its original length.
pub(crate) fn restore(
    dest: &mut dyn BlockFile,
    scratch: &mut ScratchReader,
    marker: &PatchMarker,
    scratch_path: &Path,
    dest_path: &Path,
    fsync: bool,
) -> Result<(), RecoveryError> {
    let block_size = u64::from(marker.block_size);
    for entry in &marker.staged {
        let data = scratch
            .read(entry)
            .map_err(|error| RecoveryError::io(scratch_path, error))?;
        if !entry.digest.matches(&data) {
            return Err(RecoveryError::ScratchCorrupt {
                path: scratch_path.to_path_buf(),
                block: entry.block,
            });
        }
        dest.write_at(entry.block as u64 * block_size, &data)
            .map_err(|error| RecoveryError::io(dest_path, error))?;
    }
    dest.set_len(marker.original_len)
        .map_err(|error| RecoveryError::io(dest_path, error))?;
    if fsync {
        dest.sync().map_err(|error| RecoveryError::io(dest_path, error))?;
    }
    Ok(())
}

/// Reports whether the destination already holds every target block.
fn holds_target(dest: &mut dyn BlockFile, marker: &PatchMarker) -> io::Result<bool> {
    if dest.len()? != marker.target_len {
        return Ok(false);
    }
    let Ok(target) =
        FileVersion::from_digests(&marker.target, marker.block_size, marker.target_len)
    else {
        return Ok(false);
    };
    let mut buf = Vec::new();
    for block in target.blocks() {
        buf.resize(block.size() as usize, 0);
        dest.read_at(block.offset(), &mut buf)?;
        if !block.digest().matches(&buf) {
            return Ok(false);
        }
    }
    Ok(true)
}
