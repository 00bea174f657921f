//! Durable record of a patch in progress.
//!
//! Each patched file owns two entries in its folder's scratch directory:
//!
//! ```text
//! <name>.scratch   staged bytes, concatenated in staging order
//! <name>.marker    JSON PatchMarker describing the scratch layout
//! ```
//!
//! `<name>` is the hex SHA-256 of the file key, so names stay short and never
//! collide with user paths. The marker is written to `<name>.marker.tmp` and
//! renamed into place after the scratch file is synced. It is removed first on
//! commit, which makes its removal the commit point; a scratch file without a
//! marker is garbage.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use blocks::BlockDigest;
use serde::{Deserialize, Serialize};

use crate::key::FileKey;

/// Version of the marker format written by this crate.
pub const MARKER_VERSION: u32 = 1;

/// Extension of committed marker files.
pub const MARKER_EXTENSION: &str = "marker";

/// Extension of scratch files.
pub const SCRATCH_EXTENSION: &str = "scratch";

/// Extension of markers that were never renamed into place.
pub const PENDING_EXTENSION: &str = "tmp";

/// Description of one staged block inside the scratch file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEntry {
    /// Block index in the destination's original layout.
    pub block: usize,
    /// Byte offset of the staged copy inside the scratch file.
    pub scratch_offset: u64,
    /// Length of the staged copy.
    pub len: u32,
    /// Digest of the staged bytes.
    pub digest: BlockDigest,
}

/// Everything needed to restore a destination without in-memory state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMarker {
    /// Marker format version.
    pub version: u32,
    /// File being patched.
    pub file: FileKey,
    /// Block size shared by both versions.
    pub block_size: u32,
    /// Destination length before patching.
    pub original_len: u64,
    /// Destination length after patching.
    pub target_len: u64,
    /// Staged blocks, in scratch order.
    pub staged: Vec<StagedEntry>,
    /// Target digests, in block order.
    pub target: Vec<BlockDigest>,
}

/// Locations of the journal entries belonging to one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalPaths {
    /// Marker file path.
    pub marker: PathBuf,
    /// Scratch file path.
    pub scratch: PathBuf,
    /// Pre-rename marker path.
    pub pending: PathBuf,
}

impl JournalPaths {
    /// Computes the entries for `key` inside `scratch_dir`.
    #[must_use]
    pub fn for_key(scratch_dir: &Path, key: &FileKey) -> Self {
        let mut identity = Vec::new();
        identity.extend_from_slice(key.folder().as_str().as_bytes());
        identity.push(0);
        identity.extend_from_slice(key.path().as_os_str().as_encoded_bytes());
        let name = BlockDigest::of(&identity).to_hex();
        Self::for_name(scratch_dir, &name)
    }

    /// Computes the entries for the journal stem `name`.
    #[must_use]
    pub fn for_name(scratch_dir: &Path, name: &str) -> Self {
        Self {
            marker: scratch_dir.join(format!("{name}.{MARKER_EXTENSION}")),
            scratch: scratch_dir.join(format!("{name}.{SCRATCH_EXTENSION}")),
            pending: scratch_dir.join(format!("{name}.{MARKER_EXTENSION}.{PENDING_EXTENSION}")),
        }
    }

    /// Reports whether a committed marker exists.
    #[must_use]
    pub fn has_marker(&self) -> bool {
        self.marker.exists()
    }
}

/// Appends staged blocks to the scratch file.
pub(crate) struct ScratchWriter {
    file: File,
    offset: u64,
}

impl ScratchWriter {
    pub(crate) fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, offset: 0 })
    }

    /// Appends `data`, returning its offset.
    pub(crate) fn append(&mut self, data: &[u8]) -> io::Result<u64> {
        let offset = self.offset;
        self.file.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(offset)
    }

    pub(crate) fn finish(self, fsync: bool) -> io::Result<ScratchReader> {
        if fsync {
            self.file.sync_all()?;
        }
        Ok(ScratchReader { file: self.file })
    }
}

/// Random access to staged bytes.
pub(crate) struct ScratchReader {
    file: File,
}

impl ScratchReader {
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    pub(crate) fn read(&mut self, entry: &StagedEntry) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; entry.len as usize];
        self.file.seek(SeekFrom::Start(entry.scratch_offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Durably installs `marker` at `paths.marker`.
pub(crate) fn write_marker(
    paths: &JournalPaths,
    marker: &PatchMarker,
    fsync: bool,
) -> io::Result<()> {
    let encoded = serde_json::to_vec(marker).map_err(io::Error::other)?;
    {
        let mut pending = File::create(&paths.pending)?;
        pending.write_all(&encoded)?;
        if fsync {
            pending.sync_all()?;
        }
    }
    fs::rename(&paths.pending, &paths.marker)?;
    if fsync {
        sync_parent(&paths.marker)?;
    }
    Ok(())
}

/// Reads the marker at `path`.
pub fn read_marker(path: &Path) -> io::Result<PatchMarker> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}

/// Removes the journal entries: marker first, then scratch.
pub(crate) fn clear(paths: &JournalPaths, fsync: bool) -> io::Result<()> {
    remove_if_exists(&paths.marker)?;
    if fsync {
        sync_parent(&paths.marker)?;
    }
    remove_if_exists(&paths.scratch)?;
    remove_if_exists(&paths.pending)
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

// Directory handles cannot be fsynced here; renames are durable once the
// containing volume flushes.
#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}
