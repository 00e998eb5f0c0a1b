//! Tiered channel: one logical handle per segment.
//!
//! A [`TieredChannel`] routes every operation to the backend handle of the
//! segment's current tier and can move the segment to another tier while
//! readers and writers keep using it.
//!
//! # In-flight census
//!
//! Each tier slot has a pair of counters (reads, writes). An operation
//! increments the counter for the tier it is about to use, re-checks that the
//! tier did not change, and decrements on drop of its guard whatever the
//! outcome. A migration flips the tier first and then waits for the old
//! tier's counters to reach zero before the old handle is released, so no
//! operation ever touches a released handle.
//!
//! # Migration
//!
//! ```text
//! allocate in target ──> install mirror ──> chunked copy ──> lock ──> persist tier
//!        │                                     │                        │
//!   capacity refused                      deleted? abort         install + flip
//!        ▼                                     ▼                        │
//!    Ok(false)                            Ok(false)               drain old tier
//!                                                                       │
//!                                                                release old
//! ```
//!
//! Writes that land while the copy runs are applied to both handles, so the
//! copy never loses an update made after its chunk was transferred.

use crate::backend::{Backends, SegmentFile};
use crate::error::{TierError, TierResult};
use crate::meta::{MetaStore, NOT_EXIST_INT, NOT_EXIST_LONG, TIMESTAMP_FIELD};
use crate::metrics::{HOME_FALLBACKS, MIGRATED_BYTES, STRAY_ALLOCATIONS};
use crate::migrator::Migrator;
use crate::segment::{SegmentId, meta_key};
use crate::tier::{Status, Tier};
use crate::usage::TierUsage;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Default chunk size for migration copies.
pub const DEFAULT_COPY_CHUNK: usize = 1024 * 1024;

/// Collaborators shared by every channel of one store.
pub struct ChannelContext {
    /// Backends indexed by tier.
    pub backends: Backends,
    /// Durable tier/timestamp records.
    pub meta: Arc<dyn MetaStore>,
    /// Home tier accounting.
    pub usage: Arc<TierUsage>,
    /// Scheduler channels register with. Empty when migration is disabled.
    pub migrator: Weak<Migrator>,
    /// Bytes copied per step of a migration.
    pub copy_chunk_size: usize,
}

impl ChannelContext {
    /// Context without a migrator.
    pub fn new(backends: Backends, meta: Arc<dyn MetaStore>, usage: Arc<TierUsage>) -> Self {
        Self {
            backends,
            meta,
            usage,
            migrator: Weak::new(),
            copy_chunk_size: DEFAULT_COPY_CHUNK,
        }
    }

    /// Register channels with `migrator`.
    pub fn with_migrator(mut self, migrator: &Arc<Migrator>) -> Self {
        self.migrator = Arc::downgrade(migrator);
        self
    }

    /// Set the migration copy chunk size.
    pub fn with_copy_chunk_size(mut self, size: usize) -> Self {
        self.copy_chunk_size = size.max(1);
        self
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Read,
    Write,
}

#[derive(Default)]
struct InFlight {
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl InFlight {
    fn counter(&self, direction: Direction) -> &AtomicUsize {
        match direction {
            Direction::Read => &self.reads,
            Direction::Write => &self.writes,
        }
    }

    fn is_idle(&self) -> bool {
        self.reads.load(Ordering::SeqCst) == 0 && self.writes.load(Ordering::SeqCst) == 0
    }
}

/// A counted operation against one tier's handle.
struct Op<'a> {
    handle: Arc<dyn SegmentFile>,
    counter: &'a AtomicUsize,
}

impl Drop for Op<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Target-tier handle receiving writes while a copy is running.
struct Mirror {
    handle: Arc<dyn SegmentFile>,
    failed: AtomicBool,
}

impl Mirror {
    fn replicate(&self, apply: impl FnOnce(&dyn SegmentFile) -> std::io::Result<()>) {
        if let Err(e) = apply(self.handle.as_ref()) {
            warn!(path = %self.handle.path().display(), error = %e, "mirrored write failed");
            self.failed.store(true, Ordering::Release);
        }
    }
}

/// A target-tier allocation that is discarded unless committed.
struct Allocation<'a> {
    handle: Arc<dyn SegmentFile>,
    reserved: u64,
    usage: &'a TierUsage,
    committed: bool,
}

impl Drop for Allocation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = self.handle.delete() {
            warn!(path = %self.handle.path().display(), error = %e, "failed to discard allocation");
        }
        if self.reserved > 0 {
            self.usage.release(self.reserved);
        }
    }
}

/// Per-segment handle that hides which tier holds the data.
pub struct TieredChannel {
    ctx: Arc<ChannelContext>,
    relative: PathBuf,
    key: String,
    segment: SegmentId,
    timestamp_ms: i64,
    tier: AtomicU8,
    status: AtomicU8,
    deleted: AtomicBool,
    closed: AtomicBool,
    handles: RwLock<[Option<Arc<dyn SegmentFile>>; Tier::COUNT]>,
    inflight: [InFlight; Tier::COUNT],
    lock: Mutex<()>,
    migration: Mutex<()>,
    position: Mutex<u64>,
    copy_gate: RwLock<Option<Mirror>>,
}

impl TieredChannel {
    /// Open the segment at `relative`.
    ///
    /// A segment with a metadata record is reopened in its recorded tier and
    /// any allocation of it in another tier is removed. A new segment goes to
    /// the home tier if it fits, otherwise to the overflow tier, and its tier
    /// and creation time are recorded before this returns.
    pub fn open(
        ctx: Arc<ChannelContext>,
        relative: &Path,
        size: u64,
        preallocate: bool,
        mutable: bool,
    ) -> TierResult<Arc<TieredChannel>> {
        let segment = SegmentId::from_relative(relative)?;
        let key = meta_key(relative);

        let recorded = ctx.meta.get_int(&key);
        let (tier, timestamp_ms, handle) = if recorded != NOT_EXIST_INT {
            Self::recover(&ctx, relative, &key, recorded, size, preallocate, mutable)?
        } else {
            Self::allocate(&ctx, relative, &key, size, preallocate, mutable)?
        };

        let mut handles: [Option<Arc<dyn SegmentFile>>; Tier::COUNT] = Default::default();
        handles[tier.index()] = Some(handle);

        let channel = Arc::new(TieredChannel {
            relative: relative.to_path_buf(),
            key,
            segment,
            timestamp_ms,
            tier: AtomicU8::new(tier as u8),
            status: AtomicU8::new(Status::Initializing as u8),
            deleted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            handles: RwLock::new(handles),
            inflight: Default::default(),
            lock: Mutex::new(()),
            migration: Mutex::new(()),
            position: Mutex::new(0),
            copy_gate: RwLock::new(None),
            ctx,
        });

        debug!(channel = %channel, "opened");
        if let Some(migrator) = channel.ctx.migrator.upgrade() {
            migrator.add(channel.clone());
        }
        Ok(channel)
    }

    fn recover(
        ctx: &ChannelContext,
        relative: &Path,
        key: &str,
        recorded: i32,
        size: u64,
        preallocate: bool,
        mutable: bool,
    ) -> TierResult<(Tier, i64, Arc<dyn SegmentFile>)> {
        let tier = match Tier::from_code(recorded).filter(|t| ctx.backends.has(*t)) {
            Some(tier) => tier,
            None => {
                error!(
                    segment = key,
                    recorded,
                    fallback = %Tier::OVERFLOW,
                    "recorded tier has no backend"
                );
                ctx.meta.put_int(key, Tier::OVERFLOW.code())?;
                Tier::OVERFLOW
            }
        };

        let mut timestamp_ms = ctx.meta.get_long(key, TIMESTAMP_FIELD);
        if timestamp_ms == NOT_EXIST_LONG {
            timestamp_ms = now_ms();
            error!(segment = key, "creation timestamp missing, using current time");
            ctx.meta.put_long(key, TIMESTAMP_FIELD, timestamp_ms)?;
        }

        let handle = ctx
            .backends
            .get(tier)?
            .open(relative, size, preallocate, mutable)?;
        if tier.is_home() {
            ctx.usage.force_add(handle.occupied_size()?);
        }

        // an interrupted migration may have left a copy the record never
        // pointed at
        for backend in ctx.backends.iter().filter(|b| b.tier() != tier) {
            if backend.exists(relative) {
                warn!(
                    segment = key,
                    recorded = %tier,
                    stray = %backend.tier(),
                    "removing unrecorded allocation"
                );
                backend.remove(relative)?;
                STRAY_ALLOCATIONS.increment();
            }
        }

        Ok((tier, timestamp_ms, handle))
    }

    fn allocate(
        ctx: &ChannelContext,
        relative: &Path,
        key: &str,
        size: u64,
        preallocate: bool,
        mutable: bool,
    ) -> TierResult<(Tier, i64, Arc<dyn SegmentFile>)> {
        let mut placed = None;

        if let Ok(home) = ctx.backends.get(Tier::HOME) {
            let want = home.allocation_size(size);
            if ctx.usage.try_reserve(want) {
                match home.open(relative, size, preallocate, mutable) {
                    Ok(handle) => {
                        let reservation = Allocation {
                            handle,
                            reserved: want,
                            usage: &ctx.usage,
                            committed: false,
                        };
                        placed = Some((Tier::HOME, reservation));
                    }
                    Err(e) => {
                        ctx.usage.release(want);
                        warn!(segment = key, error = %e, "home allocation failed");
                    }
                }
            }
        }

        let (tier, mut allocation) = match placed {
            Some(placed) => placed,
            None => {
                HOME_FALLBACKS.increment();
                let handle = ctx
                    .backends
                    .get(Tier::OVERFLOW)?
                    .open(relative, size, preallocate, mutable)?;
                let allocation = Allocation {
                    handle,
                    reserved: 0,
                    usage: &ctx.usage,
                    committed: false,
                };
                (Tier::OVERFLOW, allocation)
            }
        };

        if tier.is_home() {
            let occupied = allocation.handle.occupied_size()?;
            ctx.usage.settle(allocation.reserved, occupied);
            allocation.reserved = occupied;
        }

        let timestamp_ms = now_ms();
        ctx.meta.put_int(key, tier.code())?;
        ctx.meta.put_long(key, TIMESTAMP_FIELD, timestamp_ms)?;

        allocation.committed = true;
        Ok((tier, timestamp_ms, allocation.handle.clone()))
    }

    /// Tier currently serving I/O.
    pub fn tier(&self) -> Tier {
        Tier::from_index(self.tier.load(Ordering::SeqCst) as usize)
    }

    /// Lifecycle status.
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Mark as queued for migration unless already queued.
    pub(crate) fn try_mark_migrating(&self) -> bool {
        self.status
            .compare_exchange(
                Status::Initializing as u8,
                Status::Migrating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Creation time in epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Segment identity.
    pub fn segment(&self) -> &SegmentId {
        &self.segment
    }

    /// Relative path of the segment.
    pub fn relative_path(&self) -> &Path {
        &self.relative
    }

    /// Metadata key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns true once [`delete`](Self::delete) has been called.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn begin(&self, direction: Direction) -> TierResult<Op<'_>> {
        loop {
            let tier = self.tier();
            let counter = self.inflight[tier.index()].counter(direction);
            counter.fetch_add(1, Ordering::SeqCst);
            let op_guard = OpCounter(counter);

            if self.is_deleted() {
                return Err(TierError::Deleted);
            }
            if self.is_closed() {
                return Err(TierError::Closed);
            }
            if self.tier() != tier {
                continue;
            }

            let handle = self.handles.read()[tier.index()].clone();
            return match handle {
                Some(handle) => {
                    std::mem::forget(op_guard);
                    Ok(Op { handle, counter })
                }
                None => Err(TierError::Closed),
            };
        }
    }

    /// Current position used by [`read`](Self::read) and [`write`](Self::write).
    pub fn position(&self) -> u64 {
        *self.position.lock()
    }

    /// Set the position.
    pub fn set_position(&self, position: u64) {
        *self.position.lock() = position;
    }

    /// Read at the current position and advance it.
    pub fn read(&self, buf: &mut [u8]) -> TierResult<usize> {
        let mut position = self.position.lock();
        let n = self.read_at(buf, *position)?;
        *position += n as u64;
        Ok(n)
    }

    /// Write at the current position and advance it.
    pub fn write(&self, buf: &[u8]) -> TierResult<usize> {
        let mut position = self.position.lock();
        let n = self.write_at(buf, *position)?;
        *position += n as u64;
        Ok(n)
    }

    /// Read at `offset`. Returns 0 at end of data.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> TierResult<usize> {
        let op = self.begin(Direction::Read)?;
        Ok(op.handle.read_at(buf, offset)?)
    }

    /// Write all of `buf` at `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> TierResult<usize> {
        let gate = self.copy_gate.read();
        let op = self.begin(Direction::Write)?;
        let n = op.handle.write_at(buf, offset)?;
        if let Some(mirror) = gate.as_ref() {
            mirror.replicate(|h| h.write_at(buf, offset).map(|_| ()));
        }
        Ok(n)
    }

    /// Logical size.
    pub fn size(&self) -> TierResult<u64> {
        let op = self.begin(Direction::Read)?;
        Ok(op.handle.size()?)
    }

    /// Bytes the segment occupies in its current tier.
    pub fn occupied_size(&self) -> TierResult<u64> {
        let op = self.begin(Direction::Read)?;
        Ok(op.handle.occupied_size()?)
    }

    /// Shrink to `size`, clamping the position.
    pub fn truncate(&self, size: u64) -> TierResult<()> {
        let gate = self.copy_gate.read();
        let op = self.begin(Direction::Write)?;
        op.handle.truncate(size)?;
        if let Some(mirror) = gate.as_ref() {
            mirror.replicate(|h| h.truncate(size));
        }
        drop(op);
        drop(gate);

        let mut position = self.position.lock();
        if *position > size {
            *position = size;
        }
        Ok(())
    }

    /// Flush to the device.
    pub fn force(&self, metadata: bool) -> TierResult<()> {
        let op = self.begin(Direction::Write)?;
        Ok(op.handle.force(metadata)?)
    }

    /// Copy up to `count` bytes at `offset` into `target`.
    pub fn transfer_to(&self, offset: u64, count: u64, target: &mut dyn Write) -> TierResult<u64> {
        let op = self.begin(Direction::Read)?;
        Ok(op.handle.transfer_to(offset, count, target)?)
    }

    /// Copy up to `count` bytes from `source` to `offset`.
    pub fn transfer_from(&self, source: &mut dyn Read, offset: u64, count: u64) -> TierResult<u64> {
        let mut buf = vec![0u8; self.ctx.copy_chunk_size.min(count as usize).max(1)];
        let mut done = 0u64;
        while done < count {
            let want = buf.len().min((count - done) as usize);
            let n = source.read(&mut buf[..want]).map_err(TierError::Io)?;
            if n == 0 {
                break;
            }
            self.write_at(&buf[..n], offset + done)?;
            done += n as u64;
        }
        Ok(done)
    }

    /// Read-only mapping of `len` bytes at `offset`.
    ///
    /// The mapping stays valid after a migration but no longer reflects
    /// writes made through the channel.
    pub fn map(&self, offset: u64, len: usize) -> TierResult<Mmap> {
        let op = self.begin(Direction::Read)?;
        Ok(op.handle.map(offset, len)?)
    }

    /// Acquire a whole-file advisory lock on the current tier's file.
    pub fn lock(&self, shared: bool) -> TierResult<()> {
        let op = self.begin(Direction::Read)?;
        Ok(op.handle.lock(shared)?)
    }

    /// Try to acquire a whole-file advisory lock.
    pub fn try_lock(&self, shared: bool) -> TierResult<bool> {
        let op = self.begin(Direction::Read)?;
        Ok(op.handle.try_lock(shared)?)
    }

    /// Release an advisory lock.
    pub fn unlock(&self) -> TierResult<()> {
        let op = self.begin(Direction::Read)?;
        Ok(op.handle.unlock()?)
    }

    /// Move the segment to `target`.
    ///
    /// Returns `Ok(false)` without side effects when the home tier has no
    /// room, the channel was deleted or closed, or another migration of this
    /// channel is running. Errors are backend faults.
    pub fn set_mode(&self, target: Tier) -> TierResult<bool> {
        if self.is_deleted() || self.is_closed() {
            return Ok(false);
        }
        let source = self.tier();
        if source == target {
            return Ok(true);
        }
        let Some(_migration) = self.migration.try_lock() else {
            debug!(channel = %self, "migration already running");
            return Ok(false);
        };

        match self.migrate(source, target) {
            Err(TierError::Deleted | TierError::Closed) => Ok(false),
            Err(e) if self.is_deleted() || self.is_closed() => {
                debug!(channel = %self, error = %e, "migration failed after delete");
                Ok(false)
            }
            result => result,
        }
    }

    fn migrate(&self, source: Tier, target: Tier) -> TierResult<bool> {
        let backend = self.ctx.backends.get(target)?;
        let size = self.size()?;
        let old = self.handles.read()[source.index()]
            .clone()
            .ok_or(TierError::Closed)?;

        let reserved = if target.is_home() {
            let want = backend.allocation_size(size);
            if !self.ctx.usage.try_reserve(want) {
                debug!(channel = %self, size = want, "home tier full, not migrating");
                return Ok(false);
            }
            want
        } else {
            0
        };

        if backend.exists(&self.relative) {
            warn!(channel = %self, target = %target, "removing leftover allocation in target tier");
            if let Err(e) = backend.remove(&self.relative) {
                self.ctx.usage.release(reserved);
                return Err(e.into());
            }
        }

        let handle = match backend.open(&self.relative, size, true, true) {
            Ok(handle) => handle,
            Err(e) => {
                self.ctx.usage.release(reserved);
                return Err(e);
            }
        };
        let mut allocation = Allocation {
            handle,
            reserved,
            usage: &self.ctx.usage,
            committed: false,
        };
        if target.is_home() {
            let occupied = allocation.handle.occupied_size()?;
            self.ctx.usage.settle(allocation.reserved, occupied);
            allocation.reserved = occupied;
        }

        *self.copy_gate.write() = Some(Mirror {
            handle: allocation.handle.clone(),
            failed: AtomicBool::new(false),
        });

        let copied = match self.copy(old.as_ref(), allocation.handle.as_ref(), size) {
            Ok(Some(copied)) => copied,
            Ok(None) => {
                *self.copy_gate.write() = None;
                debug!(channel = %self, "deleted during copy, aborting migration");
                return Ok(false);
            }
            Err(e) => {
                *self.copy_gate.write() = None;
                return Err(e);
            }
        };
        if copied != size {
            error!(
                channel = %self,
                expected = size,
                copied,
                "copied size does not match source size"
            );
        }

        let _lock = self.lock.lock();
        let mut gate = self.copy_gate.write();
        let mirror = gate.take();
        if self.is_deleted() || self.is_closed() {
            debug!(channel = %self, "deleted before swap, aborting migration");
            return Ok(false);
        }
        if mirror.is_some_and(|m| m.failed.load(Ordering::Acquire)) {
            warn!(channel = %self, target = %target, "writes during copy did not reach the target");
            return Ok(false);
        }

        // writes that landed before the mirror was installed are only in the
        // old handle; no write can start while the gate is held
        let final_size = old.size()?;
        if final_size > copied {
            let tail = copy_range(
                old.as_ref(),
                allocation.handle.as_ref(),
                copied,
                final_size,
                self.ctx.copy_chunk_size,
            );
            if let Err(e) = tail {
                warn!(channel = %self, target = %target, error = %e, "failed to copy tail, not migrating");
                return Ok(false);
            }
        } else if allocation.handle.size()? > final_size {
            allocation.handle.truncate(final_size)?;
        }

        allocation.handle.force(true)?;
        self.ctx.meta.put_int(&self.key, target.code())?;

        self.handles.write()[target.index()] = Some(allocation.handle.clone());
        self.tier.store(target as u8, Ordering::SeqCst);
        allocation.committed = true;
        drop(gate);

        self.drain(source);
        let released = self.handles.write()[source.index()].take();
        if let Some(old) = released {
            self.discard(source, old.as_ref());
        }

        MIGRATED_BYTES.add(final_size);
        info!(channel = %self, from = %source, to = %target, bytes = final_size, "migrated");
        Ok(true)
    }

    // Returns None if the channel went away mid-copy.
    fn copy(&self, from: &dyn SegmentFile, to: &dyn SegmentFile, size: u64) -> TierResult<Option<u64>> {
        let mut buf = vec![0u8; self.ctx.copy_chunk_size.min(size as usize).max(1)];
        let mut offset = 0u64;
        while offset < size {
            if self.is_deleted() || self.is_closed() {
                return Ok(None);
            }
            let _gate = self.copy_gate.write();
            let want = buf.len().min((size - offset) as usize);
            let n = from.read_at(&mut buf[..want], offset)?;
            if n == 0 {
                break;
            }
            to.write_at(&buf[..n], offset)?;
            offset += n as u64;
        }
        Ok(Some(offset))
    }

    fn drain(&self, tier: Tier) {
        let counters = &self.inflight[tier.index()];
        let mut spins = 0u32;
        while !counters.is_idle() {
            if spins < 64 {
                std::hint::spin_loop();
            } else if spins < 128 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_micros(100));
            }
            spins = spins.saturating_add(1);
        }
    }

    // Release accounting for a handle that is no longer in any slot, and
    // delete its file.
    fn discard(&self, tier: Tier, handle: &dyn SegmentFile) {
        if tier.is_home() {
            match handle.occupied_size() {
                Ok(occupied) => self.ctx.usage.release(occupied),
                Err(e) => error!(channel = %self, error = %e, "cannot size released home allocation"),
            }
        }
        if let Err(e) = handle.delete() {
            warn!(channel = %self, tier = %tier, error = %e, "failed to delete old allocation");
        }
    }

    fn release_handles(&self, delete: bool) {
        for tier in Tier::ALL {
            self.drain(tier);
            let Some(handle) = self.handles.write()[tier.index()].take() else {
                continue;
            };
            if delete {
                self.discard(tier, handle.as_ref());
            } else if tier.is_home() {
                match handle.occupied_size() {
                    Ok(occupied) => self.ctx.usage.release(occupied),
                    Err(e) => error!(channel = %self, error = %e, "cannot size closed home allocation"),
                }
            }
        }
    }

    /// Delete the segment: its files in every tier and its metadata record.
    ///
    /// Safe to call while a migration of this channel is running; the
    /// migration aborts and discards its new allocation. Only the first call
    /// has any effect.
    pub fn delete(&self) -> TierResult<()> {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(migrator) = self.ctx.migrator.upgrade() {
            migrator.remove(self);
        }

        let _lock = self.lock.lock();
        self.release_handles(true);
        // a closed channel has no handles left, so remove by path
        for backend in self.ctx.backends.iter() {
            match backend.remove(&self.relative) {
                Ok(true) => debug!(channel = %self, tier = %backend.tier(), "removed file by path"),
                Ok(false) => {}
                Err(e) => warn!(channel = %self, tier = %backend.tier(), error = %e, "failed to remove file"),
            }
        }
        self.ctx.meta.del(&self.key)?;
        debug!(channel = %self, "deleted");
        Ok(())
    }

    /// Close every handle. The segment and its record remain.
    pub fn close(&self) -> TierResult<()> {
        if self.is_deleted() || self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(migrator) = self.ctx.migrator.upgrade() {
            migrator.remove(self);
        }

        let _lock = self.lock.lock();
        self.release_handles(false);
        debug!(channel = %self, "closed");
        Ok(())
    }
}

/// Decrements an in-flight counter unless forgotten.
struct OpCounter<'a>(&'a AtomicUsize);

impl Drop for OpCounter<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Display for TieredChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TieredChannel {} {} [status: {:?}, deleted: {}]",
            self.tier(),
            self.segment,
            self.status(),
            self.is_deleted()
        )
    }
}

impl fmt::Debug for TieredChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// Copy `[start, end)` between handles.
fn copy_range(
    from: &dyn SegmentFile,
    to: &dyn SegmentFile,
    start: u64,
    end: u64,
    chunk: usize,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; chunk.min((end - start) as usize).max(1)];
    let mut offset = start;
    while offset < end {
        let want = buf.len().min((end - offset) as usize);
        let n = from.read_at(&mut buf[..want], offset)?;
        if n == 0 {
            break;
        }
        to.write_at(&buf[..n], offset)?;
        offset += n as u64;
    }
    Ok(offset - start)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, MappedBackend};
    use crate::dirs::{DirPool, DiskSpace};
    use crate::meta::MemoryMetaStore;
    use std::io;

    fn roomy(_: &Path) -> io::Result<DiskSpace> {
        Ok(DiskSpace {
            total: 1 << 40,
            free: 1 << 40,
        })
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        meta: Arc<MemoryMetaStore>,
        ctx: Arc<ChannelContext>,
    }

    fn fixture(capacity: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let home = Arc::new(MappedBackend::new(
            Tier::Pmem,
            dir.path().join("pmem"),
            4096,
            64 * 1024,
        ));
        let pool = DirPool::with_probe(vec![dir.path().join("hdd")], roomy).unwrap();
        let overflow = Arc::new(FileBackend::new(Tier::Hdd, pool));
        let meta = Arc::new(MemoryMetaStore::new());
        let usage = Arc::new(TierUsage::new(Tier::Pmem, capacity));
        let ctx = ChannelContext::new(Backends::new(home, overflow), meta.clone(), usage)
            .with_copy_chunk_size(4096);
        Fixture {
            _dir: dir,
            meta,
            ctx: Arc::new(ctx),
        }
    }

    fn open(f: &Fixture, rel: &str, size: u64) -> Arc<TieredChannel> {
        TieredChannel::open(f.ctx.clone(), Path::new(rel), size, true, true).unwrap()
    }

    #[test]
    fn test_new_segment_prefers_home() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 10_000);
        assert_eq!(ch.tier(), Tier::Pmem);
        assert_eq!(ch.status(), Status::Initializing);
        assert_eq!(f.meta.get_int("ns/0.log"), Tier::Pmem.code());
        assert!(f.meta.get_long("ns/0.log", TIMESTAMP_FIELD) > 0);
        assert_eq!(f.ctx.usage.used(), ch.occupied_size().unwrap());
    }

    #[test]
    fn test_new_segment_falls_back_when_full() {
        let f = fixture(8192);
        let a = open(&f, "ns/0.log", 5000);
        let b = open(&f, "ns/1.log", 5000);
        assert_eq!(a.tier(), Tier::Pmem);
        assert_eq!(b.tier(), Tier::Hdd);
        assert_eq!(f.meta.get_int("ns/1.log"), Tier::Hdd.code());
        assert_eq!(f.ctx.usage.used(), 8192);
    }

    #[test]
    fn test_invalid_path_rejected() {
        let f = fixture(1 << 20);
        assert!(matches!(
            TieredChannel::open(f.ctx.clone(), Path::new("flat.log"), 0, true, true),
            Err(TierError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_relative_io_and_position() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 10_000);
        ch.write(b"hello ").unwrap();
        ch.write(b"world").unwrap();
        assert_eq!(ch.position(), 11);
        assert_eq!(ch.size().unwrap(), 11);

        ch.set_position(6);
        let mut buf = [0u8; 5];
        assert_eq!(ch.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        ch.truncate(3).unwrap();
        assert_eq!(ch.position(), 3);
        assert_eq!(ch.size().unwrap(), 3);
    }

    #[test]
    fn test_demote_then_promote() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 50_000);
        let payload: Vec<u8> = (0..30_000u32).map(|i| (i % 241) as u8).collect();
        ch.write_at(&payload, 0).unwrap();
        ch.set_position(30_000);

        assert!(ch.set_mode(Tier::Hdd).unwrap());
        assert_eq!(ch.tier(), Tier::Hdd);
        assert_eq!(f.meta.get_int("ns/0.log"), Tier::Hdd.code());
        assert_eq!(f.ctx.usage.used(), 0);
        assert_eq!(ch.position(), 30_000);

        let mut back = vec![0u8; payload.len()];
        assert_eq!(ch.read_at(&mut back, 0).unwrap(), payload.len());
        assert_eq!(back, payload);

        assert!(ch.set_mode(Tier::Pmem).unwrap());
        assert_eq!(ch.tier(), Tier::Pmem);
        assert_eq!(f.ctx.usage.used(), ch.occupied_size().unwrap());
        let mut back = vec![0u8; payload.len()];
        ch.read_at(&mut back, 0).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_same_tier_is_noop() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 100);
        assert!(ch.set_mode(Tier::Pmem).unwrap());
        assert_eq!(ch.tier(), Tier::Pmem);
    }

    #[test]
    fn test_promotion_refused_without_capacity() {
        let f = fixture(4096);
        let _filler = open(&f, "ns/0.log", 100);
        let ch = open(&f, "ns/1.log", 100);
        assert_eq!(ch.tier(), Tier::Hdd);
        ch.write_at(b"data", 0).unwrap();

        let used = f.ctx.usage.used();
        assert!(!ch.set_mode(Tier::Pmem).unwrap());
        assert_eq!(ch.tier(), Tier::Hdd);
        assert_eq!(f.ctx.usage.used(), used);
        assert_eq!(f.meta.get_int("ns/1.log"), Tier::Hdd.code());
    }

    #[test]
    fn test_missing_backend_is_error() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 100);
        assert!(matches!(
            ch.set_mode(Tier::Ssd),
            Err(TierError::NoBackend(Tier::Ssd))
        ));
        assert_eq!(ch.tier(), Tier::Pmem);
    }

    #[test]
    fn test_delete_releases_everything_once() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 100);
        let path = ch.handles.read()[Tier::Pmem.index()]
            .as_ref()
            .unwrap()
            .path()
            .to_path_buf();

        ch.delete().unwrap();
        ch.delete().unwrap();
        assert!(ch.is_deleted());
        assert!(!path.exists());
        assert_eq!(f.ctx.usage.used(), 0);
        assert!(!f.meta.contains("ns/0.log"));
        assert!(matches!(ch.read_at(&mut [0u8; 4], 0), Err(TierError::Deleted)));
        assert!(!ch.set_mode(Tier::Hdd).unwrap());
    }

    #[test]
    fn test_same_tier_set_mode_after_delete_or_close() {
        let f = fixture(1 << 20);
        let deleted = open(&f, "ns/0.log", 100);
        assert!(deleted.set_mode(Tier::Pmem).unwrap());
        deleted.delete().unwrap();
        assert!(!deleted.set_mode(Tier::Pmem).unwrap());

        let closed = open(&f, "ns/1.log", 100);
        closed.close().unwrap();
        assert!(!closed.set_mode(Tier::Pmem).unwrap());
    }

    #[test]
    fn test_close_keeps_record() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 100);
        ch.write_at(b"kept", 0).unwrap();
        ch.close().unwrap();
        assert!(matches!(ch.size(), Err(TierError::Closed)));
        assert_eq!(f.ctx.usage.used(), 0);
        assert_eq!(f.meta.get_int("ns/0.log"), Tier::Pmem.code());

        let reopened = open(&f, "ns/0.log", 0);
        assert_eq!(reopened.tier(), Tier::Pmem);
        assert_eq!(reopened.size().unwrap(), 4);
        assert_eq!(f.ctx.usage.used(), reopened.occupied_size().unwrap());
    }

    #[test]
    fn test_display() {
        let f = fixture(1 << 20);
        let ch = open(&f, "orders/00042.log", 100);
        assert_eq!(
            ch.to_string(),
            "TieredChannel PMEM orders/42 [status: Initializing, deleted: false]"
        );
    }

    #[test]
    fn test_transfer_and_map() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 1000);
        let copied = ch.transfer_from(&mut &b"transferred"[..], 0, 11).unwrap();
        assert_eq!(copied, 11);

        let mut out = Vec::new();
        assert_eq!(ch.transfer_to(0, 11, &mut out).unwrap(), 11);
        assert_eq!(out, b"transferred");

        let map = ch.map(0, 8).unwrap();
        assert_eq!(&map[..], b"transfer");
        ch.force(true).unwrap();
    }

    #[test]
    fn test_lock_follows_current_tier() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 1000);
        assert!(ch.try_lock(false).unwrap());
        ch.unlock().unwrap();
        ch.lock(true).unwrap();
        ch.unlock().unwrap();
    }

    #[test]
    fn test_status_marking() {
        let f = fixture(1 << 20);
        let ch = open(&f, "ns/0.log", 100);
        assert!(ch.try_mark_migrating());
        assert!(!ch.try_mark_migrating());
        assert_eq!(ch.status(), Status::Migrating);
        ch.set_status(Status::Initializing);
        assert_eq!(ch.status(), Status::Initializing);
    }
}
