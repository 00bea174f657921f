#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blocks::FileVersion;
use inplace::{
    BlockFile, CancelToken, Dependencies, FileKey, FileOpener, FolderId, Folders, InPlaceConfig,
    LocalFetcher, LockTable, MemoryBlockIndex, PullState, UpdateJob, UpdateRequest,
};
use test_support::{FolderTree, WriteBudget};

pub const BLOCK: u32 = 8;

pub fn config() -> InPlaceConfig {
    InPlaceConfig::default()
        .with_fsync(false)
        .with_block_size(BLOCK)
        .with_lock_timeout(Duration::from_secs(5))
        .with_pull_timeout(Duration::from_secs(5))
}

pub fn version(data: &[u8]) -> FileVersion {
    FileVersion::from_bytes(data, BLOCK).expect("hash")
}

pub fn on_disk(tree: &FolderTree, relative: &str) -> FileVersion {
    FileVersion::from_path(&tree.path(relative), BLOCK).expect("hash file")
}

pub fn folders(tree: &FolderTree) -> Folders {
    Folders::default().with_folder("f", tree.root())
}

pub fn request(key: &FileKey, current: &[u8], target: &[u8]) -> UpdateRequest {
    let state = PullState::new(key.clone(), Some(version(current)), version(target));
    UpdateRequest::new(Arc::new(state), CancelToken::new())
}

pub fn job(
    opener: Arc<dyn FileOpener>,
    index: MemoryBlockIndex,
    fetcher: LocalFetcher,
) -> UpdateJob {
    UpdateJob::new(
        config(),
        Dependencies {
            index: Arc::new(index),
            fetcher: Arc::new(fetcher),
            opener,
            locks: LockTable::new(),
            candidates: vec![FolderId::new("f")],
        },
    )
}

/// How a [`FaultyFile`] spends its budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Every write after the budget is spent fails, rollback included.
    Crash,
    /// Only the first write past the budget fails.
    Once,
}

/// Destination wrapper that fails writes once its budget is spent.
pub struct FaultyFile {
    inner: Box<dyn BlockFile>,
    budget: WriteBudget,
    fault: Fault,
    tripped: bool,
}

impl FaultyFile {
    fn charge(&mut self) -> io::Result<()> {
        if self.fault == Fault::Once && self.tripped {
            return Ok(());
        }
        self.budget.spend().inspect_err(|_| self.tripped = true)
    }
}

impl BlockFile for FaultyFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.charge()?;
        self.inner.write_at(offset, data)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.charge()?;
        self.inner.set_len(len)
    }

    fn len(&mut self) -> io::Result<u64> {
        self.inner.len()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.inner.sync()
    }
}

/// Opener whose destinations fail after `budget` writes.
pub struct FaultyOpener {
    pub folders: Folders,
    pub budget: WriteBudget,
    pub fault: Fault,
}

impl FaultyOpener {
    pub fn new(folders: Folders, writes: usize, fault: Fault) -> Self {
        Self {
            folders,
            budget: WriteBudget::new(writes),
            fault,
        }
    }
}

impl FileOpener for FaultyOpener {
    fn open_destination(&self, key: &FileKey) -> io::Result<Box<dyn BlockFile>> {
        Ok(Box::new(FaultyFile {
            inner: self.folders.open_destination(key)?,
            budget: self.budget.clone(),
            fault: self.fault,
            tripped: false,
        }))
    }

    fn open_source(&self, key: &FileKey) -> io::Result<Box<dyn BlockFile>> {
        self.folders.open_source(key)
    }

    fn path_of(&self, key: &FileKey) -> io::Result<PathBuf> {
        self.folders.path_of(key)
    }

    fn scratch_dir(&self, folder: &FolderId) -> io::Result<PathBuf> {
        self.folders.scratch_dir(folder)
    }
}

/// Plans and applies `target` over `current` without the admission gate.
pub fn apply_direct(
    opener: &dyn FileOpener,
    key: &FileKey,
    current: &FileVersion,
    target: &[u8],
) -> Result<inplace::ApplyStats, inplace::InPlaceError> {
    let state = PullState::new(key.clone(), Some(current.clone()), version(target));
    let index = MemoryBlockIndex::new();
    let cancel = CancelToken::new();
    let plan = inplace::Planner::new(&index, &[], &cancel).plan(&state)?;
    let locks = LockTable::new();
    let guard = locks.acquire(&plan.lock_set(), Duration::from_secs(1))?;
    let fetcher = LocalFetcher::from_bytes(target, BLOCK);
    let pulled = inplace::fetch::fetch_all(&fetcher, &plan, Duration::from_secs(1))?;
    inplace::apply_plan(&plan, &guard, &pulled, opener, &config())
}
