//! Tiered storage metrics.

use metriken::{Counter, Gauge, metric};

/// Segments moved from the home tier to an overflow tier.
#[metric(
    name = "tier_migrations_demoted",
    description = "Total segments demoted out of the home tier"
)]
pub static MIGRATIONS_DEMOTED: Counter = Counter::new();

/// Segments moved from an overflow tier into the home tier.
#[metric(
    name = "tier_migrations_promoted",
    description = "Total segments promoted into the home tier"
)]
pub static MIGRATIONS_PROMOTED: Counter = Counter::new();

/// Migration tasks that returned an I/O error.
#[metric(
    name = "tier_migrations_failed",
    description = "Migration tasks that failed with an I/O error"
)]
pub static MIGRATIONS_FAILED: Counter = Counter::new();

/// Refused for capacity or aborted by a concurrent delete.
#[metric(
    name = "tier_migrations_aborted",
    description = "Migration tasks that did not proceed"
)]
pub static MIGRATIONS_ABORTED: Counter = Counter::new();

/// Bytes copied by completed migrations.
#[metric(
    name = "tier_migrated_bytes",
    description = "Bytes copied between tiers by completed migrations"
)]
pub static MIGRATED_BYTES: Counter = Counter::new();

/// New segments placed in the overflow tier.
#[metric(
    name = "tier_home_fallbacks",
    description = "New segments placed in overflow because the home tier was full"
)]
pub static HOME_FALLBACKS: Counter = Counter::new();

/// Stray allocations removed on reopen.
#[metric(
    name = "tier_stray_allocations",
    description = "Unrecorded allocations removed during recovery"
)]
pub static STRAY_ALLOCATIONS: Counter = Counter::new();

/// Home tier bytes in use.
#[metric(
    name = "tier_home_used_bytes",
    description = "Bytes occupied in the home tier"
)]
pub static HOME_USED_BYTES: Gauge = Gauge::new();

/// Registered channels.
#[metric(
    name = "tier_channels_registered",
    description = "Channels known to the migration scheduler"
)]
pub static CHANNELS_REGISTERED: Gauge = Gauge::new();
