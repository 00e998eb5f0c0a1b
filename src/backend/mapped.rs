//! Memory-mapped backend for the home tier.
//!
//! Each segment is one fixed-size file mapped in full. The capacity is set
//! at allocation time and never grows; writes past it fail with
//! [`io::ErrorKind::StorageFull`].
//!
//! # File Layout
//!
//! ```text
//! +------------------+
//! | MappedHeader     |  64 bytes
//! +------------------+
//! | data             |  capacity bytes
//! +------------------+
//! | padding          |  up to the allocation granularity
//! +------------------+
//! ```

use super::{SegmentFile, TierBackend, lock_file, remove_if_exists, try_lock_file};
use crate::error::TierResult;
use crate::tier::Tier;
use memmap2::{Mmap, MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic bytes identifying a mapped segment file.
pub const MAPPED_MAGIC: [u8; 8] = *b"SEGTIER\0";

/// Current mapped file format version.
pub const MAPPED_VERSION: u32 = 1;

/// Header size (64 bytes, cache line aligned).
pub const HEADER_SIZE: usize = 64;

const LENGTH_OFFSET: usize = 24;

/// Header stored at the start of every mapped segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedHeader {
    /// Magic bytes: "SEGTIER\0"
    pub magic: [u8; 8],
    /// File format version
    pub version: u32,
    /// Reserved flags
    pub flags: u32,
    /// Usable data bytes following the header
    pub capacity: u64,
    /// Logical length of the segment
    pub length: u64,
}

impl MappedHeader {
    /// Header for a fresh allocation.
    pub fn new(capacity: u64) -> Self {
        Self {
            magic: MAPPED_MAGIC,
            version: MAPPED_VERSION,
            flags: 0,
            capacity,
            length: 0,
        }
    }

    /// Decode and validate a header.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "file too small to contain header",
            ));
        }
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(b)
        };

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[..8]);
        let header = Self {
            magic,
            version: u32_at(8),
            flags: u32_at(12),
            capacity: u64_at(16),
            length: u64_at(LENGTH_OFFSET),
        };
        header.validate()?;
        Ok(header)
    }

    /// Encode the header.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..8].copy_from_slice(&self.magic);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.flags.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.capacity.to_le_bytes());
        bytes[LENGTH_OFFSET..LENGTH_OFFSET + 8].copy_from_slice(&self.length.to_le_bytes());
        bytes
    }

    fn validate(&self) -> io::Result<()> {
        if self.magic != MAPPED_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid magic bytes in mapped segment",
            ));
        }
        if self.version != MAPPED_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unsupported mapped segment version {} (expected {})",
                    self.version, MAPPED_VERSION
                ),
            ));
        }
        if self.length > self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "recorded length {} exceeds capacity {}",
                    self.length, self.capacity
                ),
            ));
        }
        Ok(())
    }
}

/// Home-tier backend rooted at a single directory.
#[derive(Debug)]
pub struct MappedBackend {
    tier: Tier,
    root: PathBuf,
    granularity: u64,
    default_size: u64,
}

impl MappedBackend {
    /// Create a backend.
    ///
    /// `default_size` is the capacity given to segments opened with size 0.
    pub fn new(tier: Tier, root: PathBuf, granularity: u64, default_size: u64) -> Self {
        Self {
            tier,
            root,
            granularity: granularity.max(1),
            default_size,
        }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TierBackend for MappedBackend {
    fn tier(&self) -> Tier {
        self.tier
    }

    /// Opens an existing file as is. New files always get their full
    /// allocation, so `preallocate` has no effect here.
    fn open(
        &self,
        relative: &Path,
        size: u64,
        _preallocate: bool,
        mutable: bool,
    ) -> TierResult<Arc<dyn SegmentFile>> {
        let path = self.root.join(relative);
        if path.exists() || !mutable {
            return Ok(Arc::new(MappedSegment::open(path, mutable)?));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let allocation = self.allocation_size(size);
        let capacity = allocation - HEADER_SIZE as u64;
        Ok(Arc::new(MappedSegment::create(path, allocation, capacity)?))
    }

    fn exists(&self, relative: &Path) -> bool {
        self.root.join(relative).exists()
    }

    fn allocation_size(&self, size: u64) -> u64 {
        let size = if size == 0 { self.default_size } else { size };
        (HEADER_SIZE as u64 + size).div_ceil(self.granularity) * self.granularity
    }

    fn remove(&self, relative: &Path) -> io::Result<bool> {
        remove_if_exists(&self.root.join(relative))
    }

    fn relativize(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// An open mapped segment.
pub struct MappedSegment {
    path: PathBuf,
    file: File,
    mapping: Mapping,
    base: *mut u8,
    capacity: u64,
    occupied: u64,
    len: AtomicU64,
    header_lock: Mutex<()>,
}

// SAFETY: `base` points into `mapping`, which lives exactly as long as the
// segment and never moves. Writes through `base` only happen for
// `Mapping::ReadWrite`. The logical length is atomic and header updates are
// serialized by `header_lock`.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl MappedSegment {
    fn create(path: PathBuf, allocation: u64, capacity: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(allocation)?;

        // SAFETY: the file was just created by us with its final length.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        mmap[..HEADER_SIZE].copy_from_slice(&MappedHeader::new(capacity).to_bytes());
        mmap.flush_range(0, HEADER_SIZE)?;

        let base = mmap.as_mut_ptr();
        Ok(Self {
            path,
            file,
            mapping: Mapping::ReadWrite(mmap),
            base,
            capacity,
            occupied: allocation,
            len: AtomicU64::new(0),
            header_lock: Mutex::new(()),
        })
    }

    fn open(path: PathBuf, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(&path)?;
        let occupied = file.metadata()?.len();
        if occupied < HEADER_SIZE as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is too small to be a mapped segment", path.display()),
            ));
        }

        // SAFETY: the file length was checked above and mapped segment files
        // are never resized after creation.
        let (mapping, base) = unsafe {
            if writable {
                let mut mmap = MmapOptions::new().map_mut(&file)?;
                let base = mmap.as_mut_ptr();
                (Mapping::ReadWrite(mmap), base)
            } else {
                let mmap = MmapOptions::new().map(&file)?;
                let base = mmap.as_ptr() as *mut u8;
                (Mapping::ReadOnly(mmap), base)
            }
        };

        let header = MappedHeader::from_bytes(match &mapping {
            Mapping::ReadOnly(m) => &m[..HEADER_SIZE],
            Mapping::ReadWrite(m) => &m[..HEADER_SIZE],
        })?;
        if header.capacity + HEADER_SIZE as u64 > occupied {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "{}: capacity {} exceeds file length {}",
                    path.display(),
                    header.capacity,
                    occupied
                ),
            ));
        }

        Ok(Self {
            path,
            file,
            mapping,
            base,
            capacity: header.capacity,
            occupied,
            len: AtomicU64::new(header.length),
            header_lock: Mutex::new(()),
        })
    }

    /// Usable data bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn writable(&self) -> bool {
        matches!(self.mapping, Mapping::ReadWrite(_))
    }

    fn persist_len(&self, update: impl FnOnce(&AtomicU64)) {
        let _guard = self.header_lock.lock();
        update(&self.len);
        let bytes = self.len.load(Ordering::Acquire).to_le_bytes();
        // SAFETY: the header is inside the mapping and only written while
        // holding `header_lock`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(LENGTH_OFFSET), 8);
        }
    }
}

impl std::fmt::Debug for MappedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedSegment")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("writable", &self.writable())
            .finish()
    }
}

impl SegmentFile for MappedSegment {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let len = self.len.load(Ordering::Acquire);
        if offset >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - offset) as usize);
        // SAFETY: offset + n <= len <= capacity, inside the mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(HEADER_SIZE + offset as usize),
                buf.as_mut_ptr(),
                n,
            );
        }
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if !self.writable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} opened read-only", self.path.display()),
            ));
        }
        let end = offset.saturating_add(buf.len() as u64);
        if end > self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                format!(
                    "write to {}..{} exceeds capacity {} of {}",
                    offset,
                    end,
                    self.capacity,
                    self.path.display()
                ),
            ));
        }

        // SAFETY: end <= capacity, inside a writable mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                self.base.add(HEADER_SIZE + offset as usize),
                buf.len(),
            );
        }
        if end > self.len.load(Ordering::Acquire) {
            self.persist_len(|len| {
                len.fetch_max(end, Ordering::AcqRel);
            });
        }
        Ok(buf.len())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len.load(Ordering::Acquire))
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        if !self.writable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} opened read-only", self.path.display()),
            ));
        }
        if size < self.len.load(Ordering::Acquire) {
            self.persist_len(|len| {
                len.fetch_min(size, Ordering::AcqRel);
            });
        }
        Ok(())
    }

    fn force(&self, _metadata: bool) -> io::Result<()> {
        match &self.mapping {
            Mapping::ReadWrite(m) => m.flush(),
            Mapping::ReadOnly(_) => Ok(()),
        }
    }

    fn occupied_size(&self) -> io::Result<u64> {
        Ok(self.occupied)
    }

    fn map(&self, offset: u64, len: usize) -> io::Result<Mmap> {
        // SAFETY: mapped segment files are never resized after creation.
        unsafe {
            MmapOptions::new()
                .offset(HEADER_SIZE as u64 + offset)
                .len(len)
                .map(&self.file)
        }
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
