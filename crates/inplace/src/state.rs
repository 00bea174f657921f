//! Per-file pull state shared between admission and planning.

use std::sync::{Mutex, MutexGuard, PoisonError};

use blocks::FileVersion;
use rustc_hash::FxHashSet;

use crate::key::FileKey;

/// State of one file selected for update.
///
/// The current and target versions and the running copy count sit behind a
/// mutex. All access goes through methods that hold the lock only for their
/// own duration, so no caller can leave it locked on an error path.
#[derive(Debug)]
pub struct PullState {
    key: FileKey,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    current: Option<FileVersion>,
    target: FileVersion,
    copy_total: usize,
}

/// Consistent copy of a [`PullState`] taken under its lock.
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub(crate) current: Option<FileVersion>,
    pub(crate) target: FileVersion,
}

impl PullState {
    /// Creates the state for `key`; `current` is `None` when the file does not
    /// exist locally.
    #[must_use]
    pub fn new(key: FileKey, current: Option<FileVersion>, target: FileVersion) -> Self {
        Self {
            key,
            inner: Mutex::new(Inner {
                current,
                target,
                copy_total: 0,
            }),
        }
    }

    /// Returns the file this state describes.
    #[must_use]
    pub const fn key(&self) -> &FileKey {
        &self.key
    }

    /// Reports whether a current version exists.
    #[must_use]
    pub fn has_current(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Returns the number of target blocks known to be satisfiable from the
    /// current file.
    #[must_use]
    pub fn copy_total(&self) -> usize {
        self.lock().copy_total
    }

    /// Records the number of target blocks satisfiable from the current file.
    pub fn set_copy_total(&self, copy_total: usize) {
        self.lock().copy_total = copy_total;
    }

    /// Counts target blocks whose digest occurs among the current blocks and
    /// stores the count as the copy total.
    ///
    /// This is the partial planning pass the admission heuristic relies on.
    /// It reads only the two block lists.
    pub fn count_local_matches(&self) -> usize {
        let mut inner = self.lock();
        let count = match &inner.current {
            None => 0,
            Some(current) => {
                let present: FxHashSet<_> =
                    current.blocks().iter().map(|block| block.digest()).collect();
                inner
                    .target
                    .blocks()
                    .iter()
                    .filter(|block| present.contains(&block.digest()))
                    .count()
            }
        };
        inner.copy_total = count;
        count
    }

    /// Replaces the current version, for example after a rescan.
    pub fn set_current(&self, current: Option<FileVersion>) {
        let mut inner = self.lock();
        inner.current = current;
        inner.copy_total = 0;
    }

    /// Returns the block counts `(current, target)` and the copy total read
    /// under one lock acquisition.
    pub(crate) fn counts(&self) -> (Option<usize>, usize, usize) {
        let inner = self.lock();
        (
            inner.current.as_ref().map(FileVersion::block_count),
            inner.target.block_count(),
            inner.copy_total,
        )
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            current: inner.current.clone(),
            target: inner.target.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(data: &[u8]) -> FileVersion {
        FileVersion::from_bytes(data, 1).expect("hash")
    }

    #[test]
    fn count_local_matches_records_copy_total() {
        let state = PullState::new(
            FileKey::new("f", "x"),
            Some(version(b"abcd")),
            version(b"acbe"),
        );
        assert_eq!(state.copy_total(), 0);
        assert_eq!(state.count_local_matches(), 3);
        assert_eq!(state.copy_total(), 3);
        assert_eq!(state.counts(), (Some(4), 4, 3));
    }

    #[test]
    fn missing_current_matches_nothing() {
        let state = PullState::new(FileKey::new("f", "x"), None, version(b"abc"));
        assert!(!state.has_current());
        assert_eq!(state.count_local_matches(), 0);
    }

    #[test]
    fn set_current_resets_copy_total() {
        let state = PullState::new(
            FileKey::new("f", "x"),
            Some(version(b"ab")),
            version(b"ab"),
        );
        state.count_local_matches();
        state.set_current(None);
        assert_eq!(state.copy_total(), 0);
        assert!(!state.has_current());
    }
}
