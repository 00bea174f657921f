//! Byte-level file access used by the apply engine.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};

use crate::config::DEFAULT_SCRATCH_DIR;
use crate::key::{FileKey, FolderId};

/// Positional read/write access to one file.
pub trait BlockFile: Send {
    /// Fills `buf` from `offset`; short files are an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    /// Writes all of `data` at `offset`, extending the file if needed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
    /// Truncates or extends the file to `len` bytes.
    fn set_len(&mut self, len: u64) -> io::Result<()>;
    /// Returns the current length in bytes.
    fn len(&mut self) -> io::Result<u64>;
    /// Flushes data and metadata to stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

impl BlockFile for File {
    #[cfg(unix)]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        FileExt::read_exact_at(self, buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    #[cfg(unix)]
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        FileExt::write_all_at(self, data, offset)
    }

    #[cfg(not(unix))]
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Opens the files an update touches.
pub trait FileOpener: Send + Sync {
    /// Opens the destination for reading and writing.
    fn open_destination(&self, key: &FileKey) -> io::Result<Box<dyn BlockFile>>;
    /// Opens an external copy source read-only.
    fn open_source(&self, key: &FileKey) -> io::Result<Box<dyn BlockFile>>;
    /// Returns the absolute path of `key`.
    fn path_of(&self, key: &FileKey) -> io::Result<PathBuf>;
    /// Returns the scratch directory for `folder`, creating it if needed.
    fn scratch_dir(&self, folder: &FolderId) -> io::Result<PathBuf>;
}

/// Maps folder identifiers to root directories on the local filesystem.
#[derive(Clone, Debug)]
pub struct Folders {
    roots: BTreeMap<FolderId, PathBuf>,
    scratch_dir_name: String,
}

impl Default for Folders {
    fn default() -> Self {
        Self::new(DEFAULT_SCRATCH_DIR)
    }
}

impl Folders {
    /// Creates an empty registry whose scratch directories are named
    /// `scratch_dir_name`.
    pub fn new(scratch_dir_name: impl Into<String>) -> Self {
        Self {
            roots: BTreeMap::new(),
            scratch_dir_name: scratch_dir_name.into(),
        }
    }

    /// Registers `root` as the directory of `folder`.
    #[must_use]
    pub fn with_folder(mut self, folder: impl Into<FolderId>, root: impl Into<PathBuf>) -> Self {
        self.insert(folder, root);
        self
    }

    /// Registers `root` as the directory of `folder`.
    pub fn insert(&mut self, folder: impl Into<FolderId>, root: impl Into<PathBuf>) {
        self.roots.insert(folder.into(), root.into());
    }

    /// Returns the root directory of `folder`.
    #[must_use]
    pub fn root(&self, folder: &FolderId) -> Option<&Path> {
        self.roots.get(folder).map(PathBuf::as_path)
    }

    /// Returns every registered folder in lock order.
    pub fn folder_ids(&self) -> impl Iterator<Item = &FolderId> {
        self.roots.keys()
    }

    /// Resolves `key` to a path under its folder root.
    ///
    /// Absolute paths and paths that climb out of the root are rejected, as
    /// is any path into the scratch directory.
    pub fn resolve(&self, key: &FileKey) -> io::Result<PathBuf> {
        let root = self.root(key.folder()).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown folder {}", key.folder()),
            )
        })?;
        let mut first = true;
        for component in key.path().components() {
            match component {
                Component::Normal(part) => {
                    if first && part == self.scratch_dir_name.as_str() {
                        return Err(invalid_path(key));
                    }
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid_path(key));
                }
            }
            first = false;
        }
        if key.path().as_os_str().is_empty() {
            return Err(invalid_path(key));
        }
        Ok(root.join(key.path()))
    }
}

fn invalid_path(key: &FileKey) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("path {} escapes its folder", key),
    )
}

impl FileOpener for Folders {
    fn open_destination(&self, key: &FileKey) -> io::Result<Box<dyn BlockFile>> {
        let path = self.resolve(key)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Box::new(file))
    }

    fn open_source(&self, key: &FileKey) -> io::Result<Box<dyn BlockFile>> {
        let path = self.resolve(key)?;
        Ok(Box::new(File::open(path)?))
    }

    fn path_of(&self, key: &FileKey) -> io::Result<PathBuf> {
        self.resolve(key)
    }

    fn scratch_dir(&self, folder: &FolderId) -> io::Result<PathBuf> {
        let root = self.root(folder).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown folder {folder}"))
        })?;
        let dir = root.join(&self.scratch_dir_name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
