//! Per-tier storage backends.
//!
//! A [`TierBackend`] allocates, locates and removes segment files within one
//! tier. The handles it returns implement [`SegmentFile`], the single
//! capability interface the tiered channel drives regardless of tier:
//!
//! - [`file::FileBackend`]: plain files spread over a [`DirPool`](crate::dirs::DirPool)
//! - [`mapped::MappedBackend`]: fixed-capacity memory-mapped files for the home tier

pub mod file;
pub mod mapped;

use crate::error::{TierError, TierResult};
use crate::tier::Tier;
use memmap2::Mmap;
use std::fs::{File, TryLockError};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use file::{FileBackend, FileSegment};
pub use mapped::{MappedBackend, MappedSegment};

const TRANSFER_BUFFER: usize = 64 * 1024;

/// An open segment file in one tier.
///
/// All I/O is positional; the channel above owns the file position.
pub trait SegmentFile: Send + Sync + std::fmt::Debug {
    /// Absolute path of the backing file.
    fn path(&self) -> &Path;

    /// Read into `buf` at `offset`. Returns 0 at end of data.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Logical size in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Shrink to `size`. Larger sizes are ignored.
    fn truncate(&self, size: u64) -> io::Result<()>;

    /// Flush written data, and file metadata when `metadata` is set.
    fn force(&self, metadata: bool) -> io::Result<()>;

    /// Bytes this file holds on its device. May exceed [`size`](Self::size).
    fn occupied_size(&self) -> io::Result<u64>;

    /// Read-only mapping of `len` bytes starting at logical `offset`.
    fn map(&self, offset: u64, len: usize) -> io::Result<Mmap>;

    /// Acquire a whole-file advisory lock, blocking.
    fn lock(&self, shared: bool) -> io::Result<()>;

    /// Try to acquire a whole-file advisory lock. Returns false if held elsewhere.
    fn try_lock(&self, shared: bool) -> io::Result<bool>;

    /// Release an advisory lock.
    fn unlock(&self) -> io::Result<()>;

    /// Remove the backing file. The handle stays usable until dropped.
    fn delete(&self) -> io::Result<()>;

    /// Copy up to `count` bytes starting at `offset` into `target`.
    fn transfer_to(&self, offset: u64, count: u64, target: &mut dyn Write) -> io::Result<u64> {
        let mut buf = vec![0u8; TRANSFER_BUFFER.min(count as usize).max(1)];
        let mut done = 0u64;
        while done < count {
            let want = buf.len().min((count - done) as usize);
            let n = self.read_at(&mut buf[..want], offset + done)?;
            if n == 0 {
                break;
            }
            target.write_all(&buf[..n])?;
            done += n as u64;
        }
        Ok(done)
    }

    /// Copy up to `count` bytes from `source` into this file at `offset`.
    fn transfer_from(&self, source: &mut dyn Read, offset: u64, count: u64) -> io::Result<u64> {
        let mut buf = vec![0u8; TRANSFER_BUFFER.min(count as usize).max(1)];
        let mut done = 0u64;
        while done < count {
            let want = buf.len().min((count - done) as usize);
            let n = source.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            self.write_at(&buf[..n], offset + done)?;
            done += n as u64;
        }
        Ok(done)
    }
}

/// Allocation and lookup for one tier.
pub trait TierBackend: Send + Sync {
    /// The tier this backend serves.
    fn tier(&self) -> Tier;

    /// Open `relative`, creating it when `mutable` and it does not exist.
    fn open(
        &self,
        relative: &Path,
        size: u64,
        preallocate: bool,
        mutable: bool,
    ) -> TierResult<Arc<dyn SegmentFile>>;

    /// Returns true if a file for `relative` exists in this tier.
    fn exists(&self, relative: &Path) -> bool;

    /// Bytes an allocation for a segment of `size` bytes occupies.
    fn allocation_size(&self, size: u64) -> u64;

    /// Remove the file for `relative` without opening it. Returns whether
    /// anything was removed.
    fn remove(&self, relative: &Path) -> io::Result<bool>;

    /// Relative segment path for an absolute path under this tier's roots.
    fn relativize(&self, path: &Path) -> Option<PathBuf>;
}

/// Backends indexed by tier.
#[derive(Clone, Default)]
pub struct Backends {
    slots: [Option<Arc<dyn TierBackend>>; Tier::COUNT],
}

impl Backends {
    /// Backends for the home and overflow tiers.
    pub fn new(home: Arc<dyn TierBackend>, overflow: Arc<dyn TierBackend>) -> Self {
        Self::default().with(home).with(overflow)
    }

    /// Install `backend` in the slot of the tier it serves.
    pub fn with(mut self, backend: Arc<dyn TierBackend>) -> Self {
        let idx = backend.tier().index();
        self.slots[idx] = Some(backend);
        self
    }

    /// Backend for `tier`.
    pub fn get(&self, tier: Tier) -> TierResult<&Arc<dyn TierBackend>> {
        self.slots[tier.index()]
            .as_ref()
            .ok_or(TierError::NoBackend(tier))
    }

    /// Returns true if `tier` has a backend.
    pub fn has(&self, tier: Tier) -> bool {
        self.slots[tier.index()].is_some()
    }

    /// Configured backends, fastest tier first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TierBackend>> {
        self.slots.iter().flatten()
    }

    /// Relative path for an absolute path under any backend's roots.
    pub fn relativize(&self, path: &Path) -> Option<PathBuf> {
        self.iter().find_map(|b| b.relativize(path))
    }
}

pub(crate) fn lock_file(file: &File, shared: bool) -> io::Result<()> {
    if shared {
        file.lock_shared()
    } else {
        file.lock()
    }
}

pub(crate) fn try_lock_file(file: &File, shared: bool) -> io::Result<bool> {
    let result = if shared {
        file.try_lock_shared()
    } else {
        file.try_lock()
    };
    match result {
        Ok(()) => Ok(true),
        Err(TryLockError::WouldBlock) => Ok(false),
        Err(TryLockError::Error(e)) => Err(e),
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
