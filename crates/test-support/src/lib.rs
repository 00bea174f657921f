#![deny(unsafe_code)]

//! Shared fixtures for the workspace's integration tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;

/// A temporary directory used as a synchronized folder root.
#[derive(Debug)]
pub struct FolderTree {
    dir: TempDir,
}

impl FolderTree {
    /// Creates an empty tree.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the absolute path of `relative`.
    #[must_use]
    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Writes `data` to `relative`, creating parent directories.
    pub fn write(&self, relative: &str, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Reads `relative`.
    pub fn read(&self, relative: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(relative))
    }

    /// Lists the file names inside `relative`, sorted. A missing directory
    /// lists as empty.
    pub fn list(&self, relative: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        match fs::read_dir(self.path(relative)) {
            Ok(entries) => {
                for entry in entries {
                    names.push(entry?.file_name().to_string_lossy().into_owned());
                }
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error),
        }
        names.sort();
        Ok(names)
    }
}

/// Returns `len` deterministic bytes derived from `tag`.
///
/// Distinct tags give distinct content, so blocks built from different tags
/// never share a digest.
#[must_use]
pub fn block_bytes(tag: u8, len: usize) -> Vec<u8> {
    let mut state = u32::from(tag).wrapping_mul(0x9E37_79B9) ^ 0x85EB_CA6B;
    let mut out = Vec::with_capacity(len);
    out.push(tag);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        out.push(state as u8);
    }
    out.truncate(len);
    out
}

/// Concatenates one block of `block_size` bytes per tag.
#[must_use]
pub fn blocks_of(tags: &[u8], block_size: usize) -> Vec<u8> {
    tags.iter()
        .flat_map(|&tag| block_bytes(tag, block_size))
        .collect()
}

/// Countdown of permitted operations shared between a test and a fault
/// injector.
#[derive(Clone, Debug)]
pub struct WriteBudget {
    remaining: Arc<AtomicUsize>,
}

impl WriteBudget {
    /// Permits `writes` operations before failing.
    #[must_use]
    pub fn new(writes: usize) -> Self {
        Self {
            remaining: Arc::new(AtomicUsize::new(writes)),
        }
    }

    /// Never fails.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Consumes one permit; returns an error once the budget is spent.
    pub fn spend(&self) -> io::Result<()> {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .map(|_| ())
            .map_err(|_| io::Error::other("injected write failure"))
    }

    /// Reports whether any permit is left.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_bytes_are_deterministic_and_distinct() {
        assert_eq!(block_bytes(3, 64), block_bytes(3, 64));
        assert_ne!(block_bytes(3, 64), block_bytes(4, 64));
        assert_eq!(block_bytes(9, 5).len(), 5);
        assert!(block_bytes(9, 0).is_empty());
    }

    #[test]
    fn budget_fails_after_permits_are_spent() {
        let budget = WriteBudget::new(2);
        assert!(budget.spend().is_ok());
        assert!(budget.clone().spend().is_ok());
        assert!(budget.exhausted());
        assert!(budget.spend().is_err());
    }

    #[test]
    fn tree_writes_nested_files() {
        let tree = FolderTree::new().expect("tree");
        tree.write("a/b/c.bin", b"xyz").expect("write");
        assert_eq!(tree.read("a/b/c.bin").expect("read"), b"xyz");
        assert_eq!(tree.list("a/b").expect("list"), ["c.bin"]);
        assert!(tree.list("missing").expect("list").is_empty());
    }
}
