//! File identities and their total order.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Identifier of a synchronized folder.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderId(String);

impl FolderId {
    /// Creates a folder identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FolderId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A file inside a folder, addressed by its folder-relative path.
///
/// The derived `Ord` compares the folder first and the path second. It is
/// the lock order of the whole subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    folder: FolderId,
    path: PathBuf,
}

impl FileKey {
    /// Creates a key for `path` inside `folder`.
    pub fn new(folder: impl Into<FolderId>, path: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            path: path.into(),
        }
    }

    /// Returns the owning folder.
    #[must_use]
    pub const fn folder(&self) -> &FolderId {
        &self.folder
    }

    /// Returns the folder-relative path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.folder, self.path.display())
    }
}
