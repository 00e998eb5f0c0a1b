//! Storage tiers and channel lifecycle status.
//!
//! Tiers are ordered fastest (most capacity constrained) first. The order is
//! total and the numeric code of each tier is what gets persisted in the
//! metadata store, so the discriminants must never be renumbered.

use std::fmt;

/// A physical storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Tier {
    /// Persistent-memory-class mapped storage. The home tier.
    Pmem = 0,
    /// NVMe block device.
    Nvme = 1,
    /// SATA/SAS solid state block device.
    Ssd = 2,
    /// Rotational block device. The default overflow tier.
    Hdd = 3,
}

impl Tier {
    /// Number of tiers.
    pub const COUNT: usize = 4;

    /// All tiers, fastest first.
    pub const ALL: [Tier; Tier::COUNT] = [Tier::Pmem, Tier::Nvme, Tier::Ssd, Tier::Hdd];

    /// The capacity-constrained tier subject to eviction pressure.
    pub const HOME: Tier = Tier::Pmem;

    /// The tier segments are evicted to and allocated in when home is full.
    pub const OVERFLOW: Tier = Tier::Hdd;

    /// Persisted integer code for this tier.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a persisted tier code.
    pub fn from_code(code: i32) -> Option<Tier> {
        match code {
            0 => Some(Tier::Pmem),
            1 => Some(Tier::Nvme),
            2 => Some(Tier::Ssd),
            3 => Some(Tier::Hdd),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub(crate) fn from_index(index: usize) -> Tier {
        Tier::ALL[index]
    }

    /// Returns true if `self` is faster than `other`.
    #[inline]
    pub fn is_higher_than(self, other: Tier) -> bool {
        (self as u8) < (other as u8)
    }

    /// Returns true if this is the home tier.
    #[inline]
    pub fn is_home(self) -> bool {
        self == Tier::HOME
    }

    /// Short upper-case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Pmem => "PMEM",
            Tier::Nvme => "NVME",
            Tier::Ssd => "SSD",
            Tier::Hdd => "HDD",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a tiered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Idle, serving I/O from its current tier.
    #[default]
    Initializing = 0,
    /// A migration task has been queued or is running.
    Migrating = 1,
}

impl Status {
    pub(crate) fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Migrating,
            _ => Status::Initializing,
        }
    }
}
