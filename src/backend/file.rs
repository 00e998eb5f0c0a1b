//! Plain-file backend for overflow tiers.

use super::{SegmentFile, TierBackend, lock_file, remove_if_exists, try_lock_file};
use crate::dirs::DirPool;
use crate::error::TierResult;
use crate::tier::Tier;
use memmap2::{Mmap, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Segment files stored as regular files across a [`DirPool`].
#[derive(Debug)]
pub struct FileBackend {
    tier: Tier,
    pool: DirPool,
}

impl FileBackend {
    /// Create a backend serving `tier` from the roots of `pool`.
    pub fn new(tier: Tier, pool: DirPool) -> Self {
        Self { tier, pool }
    }

    /// The directory pool.
    pub fn pool(&self) -> &DirPool {
        &self.pool
    }
}

impl TierBackend for FileBackend {
    fn tier(&self) -> Tier {
        self.tier
    }

    fn open(
        &self,
        relative: &Path,
        size: u64,
        preallocate: bool,
        mutable: bool,
    ) -> TierResult<Arc<dyn SegmentFile>> {
        let path = self.pool.to_absolute(relative)?;
        let file = if mutable {
            let existed = path.exists();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            if !existed && preallocate && size > 0 {
                file.set_len(size)?;
            }
            file
        } else {
            File::open(&path)?
        };
        Ok(Arc::new(FileSegment { path, file }))
    }

    fn exists(&self, relative: &Path) -> bool {
        self.pool.contains_relative(relative)
    }

    fn allocation_size(&self, size: u64) -> u64 {
        size
    }

    fn remove(&self, relative: &Path) -> io::Result<bool> {
        match self.pool.resolve(relative) {
            Some(idx) => remove_if_exists(&self.pool.dirs()[idx].join(relative)),
            None => Ok(false),
        }
    }

    fn relativize(&self, path: &Path) -> Option<PathBuf> {
        self.pool.relativize(path)
    }
}

/// An open regular file.
#[derive(Debug)]
pub struct FileSegment {
    path: PathBuf,
    file: File,
}

impl SegmentFile for FileSegment {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        if size < self.size()? {
            self.file.set_len(size)?;
        }
        Ok(())
    }

    fn force(&self, metadata: bool) -> io::Result<()> {
        if metadata {
            self.file.sync_all()
        } else {
            self.file.sync_data()
        }
    }

    fn occupied_size(&self) -> io::Result<u64> {
        self.size()
    }

    fn map(&self, offset: u64, len: usize) -> io::Result<Mmap> {
        // SAFETY: segment files are only modified through this crate, which
        // never shrinks a file that is still mapped by a reader it knows of.
        unsafe { MmapOptions::new().offset(offset).len(len).map(&self.file) }
    }

    fn lock(&self, shared: bool) -> io::Result<()> {
        lock_file(&self.file, shared)
    }

    fn try_lock(&self, shared: bool) -> io::Result<bool> {
        try_lock_file(&self.file, shared)
    }

    fn unlock(&self) -> io::Result<()> {
        self.file.unlock()
    }

    fn delete(&self) -> io::Result<()> {
        remove_if_exists(&self.path).map(|_| ())
    }
}
