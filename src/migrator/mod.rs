//! Migration scheduler and worker pool.
//!
//! The [`Migrator`] keeps every open channel in a registry ordered by
//! creation time. A scheduler pass compares home-tier usage against the
//! configured thresholds and queues work:
//!
//! - above `capacity * threshold`, the oldest home-resident channels are
//!   queued for demotion until the estimate falls back under the threshold
//! - otherwise, the newest overflow-resident channels down to the last
//!   evicted one are queued for promotion while the estimate stays under
//!   `capacity * readmit_threshold`
//!
//! Only channels with a newer segment in their namespace are moved, so a
//! segment that may still be appended to stays where it is.
//!
//! Workers drain the demote queue before the promote queue and drive each
//! task through [`TieredChannel::set_mode`].

mod registry;
mod worker;

pub use registry::HotKey;
pub use worker::MigratorHandle;

use crate::channel::TieredChannel;
use crate::metrics::CHANNELS_REGISTERED;
use crate::tier::{Status, Tier};
use crate::usage::TierUsage;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use registry::{Entry, Intake, Registry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MB: u64 = 1024 * 1024;

/// Scheduler and worker settings.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Fraction of capacity above which demotion starts.
    pub threshold: f64,
    /// Fraction of capacity promotion may fill up to.
    pub readmit_threshold: f64,
    /// Time between scheduler passes.
    pub interval: Duration,
    /// Time before the first scheduler pass.
    pub initial_delay: Duration,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            threshold: 0.5,
            readmit_threshold: 0.5,
            interval: Duration::from_secs(5),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// A queued migration of one channel.
pub(crate) struct Task {
    pub channel: Arc<TieredChannel>,
    pub target: Tier,
    /// Occupied size when queued; the amount speculated against usage.
    pub size: u64,
}

impl Task {
    fn pending_delta(&self) -> i64 {
        if self.target.is_home() {
            self.size as i64
        } else {
            -(self.size as i64)
        }
    }
}

/// Outcome of one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    /// Demote tasks queued.
    pub demoted: usize,
    /// Promote tasks queued.
    pub promoted: usize,
    /// Estimated home usage before the pass.
    pub used_before: u64,
    /// Estimated home usage once the queued tasks finish.
    pub used_after: u64,
}

/// Background migration of channels between the home and overflow tiers.
pub struct Migrator {
    config: MigratorConfig,
    usage: Arc<TierUsage>,
    registry: Mutex<Registry>,
    intake: Mutex<Intake>,
    demote_tx: Sender<Task>,
    demote_rx: Receiver<Task>,
    promote_tx: Sender<Task>,
    promote_rx: Receiver<Task>,
}

impl Migrator {
    /// Create a migrator. No threads run until [`start`](Self::start).
    pub fn new(config: MigratorConfig, usage: Arc<TierUsage>) -> Self {
        let (demote_tx, demote_rx) = crossbeam_channel::unbounded();
        let (promote_tx, promote_rx) = crossbeam_channel::unbounded();
        Self {
            config,
            usage,
            registry: Mutex::new(Registry::default()),
            intake: Mutex::new(Intake::default()),
            demote_tx,
            demote_rx,
            promote_tx,
            promote_rx,
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// The accounting object shared with channels.
    pub fn usage(&self) -> &Arc<TierUsage> {
        &self.usage
    }

    /// Register a channel for the next pass.
    pub fn add(&self, channel: Arc<TieredChannel>) {
        let size = channel.occupied_size().unwrap_or_else(|e| {
            warn!(channel = %channel, error = %e, "cannot size registered channel");
            0
        });
        self.intake.lock().push(Entry { channel, size });
        self.usage.add_total(size as i64);
        CHANNELS_REGISTERED.increment();
    }

    /// Deregister a channel, whether merged or still buffered.
    pub fn remove(&self, channel: &TieredChannel) {
        let removed = {
            let mut registry = self.registry.lock();
            let mut intake = self.intake.lock();
            registry.take(channel).or_else(|| intake.take(channel))
        };
        if let Some(entry) = removed {
            self.usage.add_total(-(entry.size as i64));
            CHANNELS_REGISTERED.decrement();
        }
    }

    /// Channels known to the scheduler, merged or buffered.
    pub fn registered(&self) -> usize {
        let registry = self.registry.lock();
        let intake = self.intake.lock();
        registry.channels.len() + intake.buffer.len()
    }

    /// Highest segment id seen in `namespace`.
    pub fn highest_id(&self, namespace: &str) -> Option<u64> {
        self.intake.lock().ns_ids.get(namespace).copied()
    }

    /// Key of the newest channel the last demotion scan moved past.
    pub fn last_evicted(&self) -> Option<HotKey> {
        self.registry.lock().last_evicted.clone()
    }

    /// Tasks waiting in the demote queue.
    pub fn queued_demotions(&self) -> usize {
        self.demote_rx.len()
    }

    /// Tasks waiting in the promote queue.
    pub fn queued_promotions(&self) -> usize {
        self.promote_rx.len()
    }

    /// Run one scheduler pass.
    pub fn schedule_once(&self) -> ScheduleReport {
        let mut registry = self.registry.lock();
        let mut intake = self.intake.lock();

        for entry in std::mem::take(&mut intake.buffer) {
            if entry.channel.is_deleted() || entry.channel.is_closed() {
                self.usage.add_total(-(entry.size as i64));
                CHANNELS_REGISTERED.decrement();
                continue;
            }
            let key = HotKey::of(&entry.channel);
            if let Some(displaced) = registry.channels.insert(key, entry) {
                warn!(channel = %displaced.channel, "registry key collision, dropping older entry");
                self.usage.add_total(-(displaced.size as i64));
                CHANNELS_REGISTERED.decrement();
            }
        }

        // segments grow and move between passes
        let mut total_delta = 0i64;
        for entry in registry.channels.values_mut() {
            if let Ok(size) = entry.channel.occupied_size() {
                total_delta += size as i64 - entry.size as i64;
                entry.size = size;
            }
        }
        self.usage.add_total(total_delta);

        let snapshot = self.usage.snapshot();
        let capacity = snapshot.capacity as f64;
        let high = (capacity * self.config.threshold) as u64;
        let readmit = (capacity * self.config.readmit_threshold) as u64;
        let before = snapshot.estimate();

        info!(
            used_mb = before / MB,
            threshold_mb = high / MB,
            capacity_mb = snapshot.capacity / MB,
            used_total_mb = snapshot.used_total / MB,
            "before schedule"
        );

        let mut report = ScheduleReport {
            used_before: before,
            ..Default::default()
        };
        let Registry {
            channels,
            last_evicted,
        } = &mut *registry;
        let mut estimate = before;

        if estimate > high {
            let mut leading = true;
            for (key, entry) in channels.iter() {
                if estimate <= high {
                    break;
                }
                let channel = &entry.channel;
                if !channel.tier().is_home() {
                    if leading {
                        *last_evicted = Some(key.clone());
                    }
                    continue;
                }
                leading = false;
                if !intake.is_eligible(channel) {
                    continue;
                }
                let Some(size) = self.enqueue(channel, Tier::OVERFLOW) else {
                    continue;
                };
                estimate = estimate.saturating_sub(size);
                *last_evicted = Some(key.clone());
                report.demoted += 1;
            }
        } else {
            for (key, entry) in channels.iter().rev() {
                if last_evicted.as_ref().is_some_and(|last| key <= last) {
                    break;
                }
                let channel = &entry.channel;
                if channel.tier().is_home() || !intake.is_eligible(channel) {
                    continue;
                }
                let Ok(size) = channel.occupied_size() else {
                    continue;
                };
                if estimate + size > readmit {
                    break;
                }
                if self.enqueue(channel, Tier::HOME).is_some() {
                    estimate += size;
                    report.promoted += 1;
                }
            }
        }

        report.used_after = estimate;
        info!(
            used_mb = estimate / MB,
            threshold_mb = high / MB,
            capacity_mb = snapshot.capacity / MB,
            demoted = report.demoted,
            promoted = report.promoted,
            "after schedule"
        );
        report
    }

    // Mark the channel and queue it. Returns the speculated size.
    fn enqueue(&self, channel: &Arc<TieredChannel>, target: Tier) -> Option<u64> {
        if !channel.try_mark_migrating() {
            return None;
        }
        let size = match channel.occupied_size() {
            Ok(size) => size,
            Err(e) => {
                debug!(channel = %channel, error = %e, "skipping unsizable channel");
                channel.set_status(Status::Initializing);
                return None;
            }
        };

        let task = Task {
            channel: channel.clone(),
            target,
            size,
        };
        self.usage.adjust_pending(task.pending_delta());
        let queue = if target.is_home() {
            &self.promote_tx
        } else {
            &self.demote_tx
        };
        if let Err(e) = queue.send(task) {
            let task = e.into_inner();
            self.usage.adjust_pending(-task.pending_delta());
            task.channel.set_status(Status::Initializing);
            return None;
        }
        Some(size)
    }

    /// Run queued tasks on the calling thread, demotions first. Returns the
    /// number of tasks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.next_task() {
            self.run_task(task);
            ran += 1;
        }
        ran
    }

    fn next_task(&self) -> Option<Task> {
        self.demote_rx
            .try_recv()
            .or_else(|_| self.promote_rx.try_recv())
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backends, FileBackend, MappedBackend};
    use crate::channel::ChannelContext;
    use crate::dirs::{DirPool, DiskSpace};
    use crate::meta::{MemoryMetaStore, MetaStore, TIMESTAMP_FIELD};
    use std::io;
    use std::path::Path;

    const PAGE: u64 = 4096;

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
        migrator: Arc<Migrator>,
    }

    fn fixture(capacity: u64, threshold: f64, readmit_threshold: f64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let home = Arc::new(MappedBackend::new(
            Tier::Pmem,
            dir.path().join("pmem"),
            PAGE,
            PAGE - 64,
        ));
        let pool = DirPool::with_probe(vec![dir.path().join("hdd")], roomy).unwrap();
        let overflow = Arc::new(FileBackend::new(Tier::Hdd, pool));
        let meta = Arc::new(MemoryMetaStore::new());
        let usage = Arc::new(TierUsage::new(Tier::Pmem, capacity));
        let migrator = Arc::new(Migrator::new(
            MigratorConfig {
                threads: 0,
                threshold,
                readmit_threshold,
                ..Default::default()
            },
            usage.clone(),
        ));
        let ctx = ChannelContext::new(Backends::new(home, overflow), meta.clone(), usage)
            .with_migrator(&migrator);
        Fixture {
            _dir: dir,
            meta,
            ctx: Arc::new(ctx),
            migrator,
        }
    }

    // Open a channel whose record already places it in `tier` at `ts`.
    fn open_at(f: &Fixture, rel: &str, tier: Tier, ts: i64) -> Arc<TieredChannel> {
        f.meta.put_int(rel, tier.code()).unwrap();
        f.meta.put_long(rel, TIMESTAMP_FIELD, ts).unwrap();
        let channel = TieredChannel::open(f.ctx.clone(), Path::new(rel), 4000, false, true).unwrap();
        if !tier.is_home() {
            channel.write_at(&[7u8; 100], 0).unwrap();
        }
        channel
    }

    #[test]
    fn test_registration_tracks_totals() {
        let f = fixture(10 * PAGE, 0.5, 0.5);
        let a = open_at(&f, "ns/0.log", Tier::Pmem, 1);
        let b = open_at(&f, "ns/1.log", Tier::Pmem, 2);
        assert_eq!(f.migrator.registered(), 2);
        assert_eq!(f.migrator.highest_id("ns"), Some(1));
        assert_eq!(f.migrator.usage().snapshot().used_total, 2 * PAGE);

        b.delete().unwrap();
        assert_eq!(f.migrator.registered(), 1);
        assert_eq!(f.migrator.usage().snapshot().used_total, PAGE);
        // ids never move backwards
        assert_eq!(f.migrator.highest_id("ns"), Some(1));
        drop(a);
    }

    #[test]
    fn test_schedule_refreshes_total_usage() {
        let f = fixture(10 * PAGE, 0.5, 0.01);
        // registered before its first write
        let cold = open_at(&f, "ns/0.log", Tier::Hdd, 1);
        let _hot = open_at(&f, "ns/1.log", Tier::Pmem, 2);
        assert_eq!(f.migrator.usage().snapshot().used_total, PAGE);

        f.migrator.schedule_once();
        assert_eq!(f.migrator.usage().snapshot().used_total, PAGE + 100);

        cold.write_at(&[2u8; 50], 100).unwrap();
        f.migrator.schedule_once();
        assert_eq!(f.migrator.usage().snapshot().used_total, PAGE + 150);

        cold.delete().unwrap();
        assert_eq!(f.migrator.usage().snapshot().used_total, PAGE);
    }

    #[test]
    fn test_same_id_different_extension_both_registered() {
        let f = fixture(10 * PAGE, 0.5, 0.5);
        let log = open_at(&f, "ns/0.log", Tier::Pmem, 5);
        let index = open_at(&f, "ns/0.index", Tier::Pmem, 5);

        f.migrator.schedule_once();
        assert_eq!(f.migrator.registered(), 2);
        assert_eq!(f.migrator.usage().snapshot().used_total, 2 * PAGE);

        log.delete().unwrap();
        index.delete().unwrap();
        assert_eq!(f.migrator.registered(), 0);
        assert_eq!(f.migrator.usage().snapshot().used_total, 0);
    }

    #[test]
    fn test_demotes_oldest_until_under_threshold() {
        let f = fixture(10 * PAGE, 0.5, 0.5);
        let channels: Vec<_> = (0..6)
            .map(|i| open_at(&f, &format!("ns/{}.log", i), Tier::Pmem, 10 + i))
            .collect();
        assert_eq!(f.ctx.usage.used(), 6 * PAGE);

        let report = f.migrator.schedule_once();
        assert_eq!(report.demoted, 1);
        assert_eq!(report.promoted, 0);
        assert_eq!(report.used_before, 6 * PAGE);
        assert_eq!(report.used_after, 5 * PAGE);
        assert_eq!(f.migrator.queued_demotions(), 1);
        assert_eq!(channels[0].status(), Status::Migrating);

        assert_eq!(f.migrator.run_pending(), 1);
        assert_eq!(channels[0].tier(), Tier::Hdd);
        assert_eq!(channels[0].status(), Status::Initializing);
        assert_eq!(f.ctx.usage.used(), 5 * PAGE);
        assert_eq!(f.ctx.usage.snapshot().pending, 0);
        assert_eq!(f.migrator.last_evicted().map(|k| k.id), Some(0));
    }

    #[test]
    fn test_leading_overflow_run_advances_watermark() {
        let f = fixture(PAGE, 0.5, 0.5);
        let _a = open_at(&f, "ns/0.log", Tier::Hdd, 1);
        let _b = open_at(&f, "ns/1.log", Tier::Hdd, 2);
        let newest = open_at(&f, "ns/2.log", Tier::Pmem, 3);

        let report = f.migrator.schedule_once();
        assert_eq!(report.demoted, 0);
        assert_eq!(f.migrator.last_evicted().map(|k| k.id), Some(1));
        assert_eq!(newest.tier(), Tier::Pmem);
    }

    #[test]
    fn test_promotion_stops_at_last_evicted() {
        let f = fixture(2 * PAGE, 0.25, 1.0);
        let _a = open_at(&f, "ns/0.log", Tier::Hdd, 1);
        let _b = open_at(&f, "ns/1.log", Tier::Hdd, 2);
        let c = open_at(&f, "ns/2.log", Tier::Pmem, 3);
        let d = open_at(&f, "ns/3.log", Tier::Hdd, 4);
        let e = open_at(&f, "ns/4.log", Tier::Pmem, 5);

        let report = f.migrator.schedule_once();
        assert_eq!(report.demoted, 1);
        f.migrator.run_pending();
        assert_eq!(c.tier(), Tier::Hdd);
        assert_eq!(f.migrator.last_evicted().map(|k| k.id), Some(2));

        e.delete().unwrap();
        assert_eq!(f.ctx.usage.used(), 0);

        let report = f.migrator.schedule_once();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.used_after, 100);
        f.migrator.run_pending();
        assert_eq!(d.tier(), Tier::Pmem);
        assert_eq!(c.tier(), Tier::Hdd);
        assert_eq!(f.ctx.usage.used(), PAGE);
        assert_eq!(f.ctx.usage.snapshot().pending, 0);
    }

    #[test]
    fn test_migrating_channel_is_not_queued_twice() {
        let f = fixture(2 * PAGE, 0.1, 0.1);
        let a = open_at(&f, "ns/0.log", Tier::Pmem, 1);
        let _b = open_at(&f, "ns/1.log", Tier::Pmem, 2);

        assert_eq!(f.migrator.schedule_once().demoted, 1);
        assert_eq!(f.migrator.schedule_once().demoted, 0);
        assert_eq!(f.migrator.queued_demotions(), 1);
        assert_eq!(f.ctx.usage.snapshot().pending, -(PAGE as i64));

        f.migrator.run_pending();
        assert_eq!(a.tier(), Tier::Hdd);
        assert_eq!(f.ctx.usage.snapshot().pending, 0);
    }

    #[test]
    fn test_deleted_while_queued_reverts_pending() {
        let f = fixture(2 * PAGE, 0.1, 0.1);
        let a = open_at(&f, "ns/0.log", Tier::Pmem, 1);
        let _b = open_at(&f, "ns/1.log", Tier::Pmem, 2);

        assert_eq!(f.migrator.schedule_once().demoted, 1);
        a.delete().unwrap();
        assert_eq!(f.migrator.run_pending(), 1);
        assert_eq!(f.ctx.usage.snapshot().pending, 0);
        assert_eq!(f.ctx.usage.used(), PAGE);
        assert!(!f.meta.contains("ns/0.log"));
    }
}
