//! Home-tier capacity accounting.
//!
//! One [`TierUsage`] exists per home tier and is shared by every channel and
//! the migrator of a store. All counters live behind a single lock so that
//! the capacity check and the reservation are one critical section.
//!
//! `used` is authoritative: it changes only when a home allocation is made,
//! vacated or deleted. `pending` is the scheduler's speculation about queued
//! migrations that have not finished yet; each task returns its share when
//! it completes, so `pending` is zero whenever nothing is queued.

use crate::metrics::HOME_USED_BYTES;
use crate::tier::Tier;
use parking_lot::Mutex;
use tracing::error;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Configured capacity of the home tier in bytes.
    pub capacity: u64,
    /// Bytes occupied by segments resident in the home tier.
    pub used: u64,
    /// Bytes of all registered segments across every tier.
    pub used_total: u64,
    /// Outstanding speculative adjustment from queued migrations.
    pub pending: i64,
}

impl UsageSnapshot {
    /// `used` adjusted by queued migrations.
    pub fn estimate(&self) -> u64 {
        (self.used as i64).saturating_add(self.pending).max(0) as u64
    }
}

#[derive(Debug)]
struct Inner {
    capacity: u64,
    used: u64,
    used_total: u64,
    pending: i64,
}

/// Shared capacity/usage counters of one home tier.
#[derive(Debug)]
pub struct TierUsage {
    tier: Tier,
    inner: Mutex<Inner>,
}

impl TierUsage {
    /// Create accounting for `tier` with `capacity` bytes.
    pub fn new(tier: Tier, capacity: u64) -> Self {
        Self {
            tier,
            inner: Mutex::new(Inner {
                capacity,
                used: 0,
                used_total: 0,
                pending: 0,
            }),
        }
    }

    /// The tier being accounted.
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Configured capacity.
    pub fn capacity(&self) -> u64 {
        self.inner.lock().capacity
    }

    /// Bytes currently occupied in the tier.
    pub fn used(&self) -> u64 {
        self.inner.lock().used
    }

    /// Copy all counters under the lock.
    pub fn snapshot(&self) -> UsageSnapshot {
        let inner = self.inner.lock();
        UsageSnapshot {
            capacity: inner.capacity,
            used: inner.used,
            used_total: inner.used_total,
            pending: inner.pending,
        }
    }

    /// Reserve `size` bytes if `used + size <= capacity`.
    pub fn try_reserve(&self, size: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.used.checked_add(size) {
            Some(total) if total <= inner.capacity => {
                inner.used = total;
                HOME_USED_BYTES.set(total as i64);
                true
            }
            _ => false,
        }
    }

    /// Account for an allocation found during recovery, ignoring capacity.
    pub fn force_add(&self, size: u64) {
        let mut inner = self.inner.lock();
        inner.used = inner.used.saturating_add(size);
        HOME_USED_BYTES.set(inner.used as i64);
    }

    /// Return `size` bytes to the tier.
    pub fn release(&self, size: u64) {
        let mut inner = self.inner.lock();
        if size > inner.used {
            error!(
                tier = %self.tier,
                used = inner.used,
                size,
                "releasing more than is accounted as used"
            );
            inner.used = 0;
        } else {
            inner.used -= size;
        }
        HOME_USED_BYTES.set(inner.used as i64);
    }

    /// Replace a reservation of `reserved` bytes with the `actual` size of
    /// the allocation it produced.
    pub fn settle(&self, reserved: u64, actual: u64) {
        if reserved == actual {
            return;
        }
        let mut inner = self.inner.lock();
        inner.used = inner.used.saturating_sub(reserved).saturating_add(actual);
        HOME_USED_BYTES.set(inner.used as i64);
    }

    /// Adjust the all-tier total by `delta` bytes.
    pub fn add_total(&self, delta: i64) {
        let mut inner = self.inner.lock();
        inner.used_total = (inner.used_total as i64).saturating_add(delta).max(0) as u64;
    }

    /// Adjust the speculative estimate by `delta` bytes.
    pub fn adjust_pending(&self, delta: i64) {
        self.inner.lock().pending += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_respects_capacity() {
        let usage = TierUsage::new(Tier::Pmem, 100);
        assert!(usage.try_reserve(60));
        assert!(!usage.try_reserve(41));
        assert!(usage.try_reserve(40));
        assert_eq!(usage.used(), 100);
        assert!(!usage.try_reserve(1));
        assert!(usage.try_reserve(0));
    }

    #[test]
    fn test_release_saturates() {
        let usage = TierUsage::new(Tier::Pmem, 100);
        usage.force_add(30);
        usage.release(10);
        assert_eq!(usage.used(), 20);
        usage.release(50);
        assert_eq!(usage.used(), 0);
    }

    #[test]
    fn test_force_add_may_exceed_capacity() {
        let usage = TierUsage::new(Tier::Pmem, 10);
        usage.force_add(25);
        assert_eq!(usage.used(), 25);
        assert!(!usage.try_reserve(0));
    }

    #[test]
    fn test_settle() {
        let usage = TierUsage::new(Tier::Pmem, 100);
        assert!(usage.try_reserve(50));
        usage.settle(50, 64);
        assert_eq!(usage.used(), 64);
        usage.settle(64, 64);
        assert_eq!(usage.used(), 64);
    }

    #[test]
    fn test_estimate_includes_pending() {
        let usage = TierUsage::new(Tier::Pmem, 100);
        usage.force_add(80);
        usage.adjust_pending(-30);
        let snap = usage.snapshot();
        assert_eq!(snap.estimate(), 50);
        usage.adjust_pending(30);
        assert_eq!(usage.snapshot().pending, 0);

        usage.adjust_pending(-500);
        assert_eq!(usage.snapshot().estimate(), 0);
    }

    #[test]
    fn test_total() {
        let usage = TierUsage::new(Tier::Pmem, 100);
        usage.add_total(500);
        usage.add_total(-200);
        assert_eq!(usage.snapshot().used_total, 300);
        usage.add_total(-1000);
        assert_eq!(usage.snapshot().used_total, 0);
    }
}
