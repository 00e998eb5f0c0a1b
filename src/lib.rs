//! segtier: tiered hot/cold storage for append-only log segments.
//!
//! Each segment file is opened through a [`TieredChannel`], a single handle
//! whose bytes live in one of several storage tiers at a time. A small, fast
//! home tier holds new and recently created segments; larger overflow tiers
//! take the rest. A background [`Migrator`] moves segments between tiers as
//! home-tier usage crosses configured thresholds, while readers and writers
//! keep using the same handle.
//!
//! - **Tiers**: `Tier` ordering and the persisted tier codes
//! - **Directories**: `DirPool` spreads one tier across several volumes
//! - **Backends**: `SegmentFile` and `TierBackend` per-tier I/O and allocation
//! - **Metadata**: `MetaStore`, the durable record of each segment's tier
//! - **Channels**: `TieredChannel` routing and the migration protocol
//! - **Migration**: `Migrator` registry, scheduler and worker pool
//! - **Store**: `TieredStore` initialization and per-segment entry points
//!
//! # Architecture
//!
//! ```text
//!   open/read/write/delete by path
//!                 |
//!                 v
//!        +-----------------+       +-------------+
//!        |   TieredStore   |------>|  MetaStore  |
//!        +--------+--------+       +-------------+
//!                 |                       ^
//!                 v                       | tier, timestamp
//!        +-----------------+              |
//!        |  TieredChannel  |--------------+
//!        +---+---------+---+
//!            |         |  register / set_mode
//!            |         v
//!            |   +-------------+     +------------+
//!            |   |  Migrator   |---->| TierUsage  |
//!            |   +-------------+     +------------+
//!            v
//!   +----------------+   +-----------------+
//!   | MappedBackend  |   |   FileBackend   |
//!   |  (home tier)   |   | (overflow tier) |
//!   +----------------+   +--------+--------+
//!                                 |
//!                            +---------+
//!                            | DirPool |
//!                            +---------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use segtier::{Config, MemoryMetaStore, TieredStore, Tier};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config = Config::load(Path::new("segtier.toml"))?;
//! let store = TieredStore::open(&config, Arc::new(MemoryMetaStore::new()))?;
//!
//! let segment = store.open_segment(Path::new("orders-0/00000000000000000000.log"), 0, true, true)?;
//! segment.write(b"record")?;
//! assert_eq!(segment.tier(), Tier::Pmem);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod channel;
pub mod config;
pub mod dirs;
pub mod error;
pub mod logging;
pub mod meta;
pub mod metrics;
pub mod migrator;
pub mod segment;
pub mod store;
pub mod tier;
pub mod usage;

pub use backend::{Backends, FileBackend, MappedBackend, SegmentFile, TierBackend};
pub use channel::{ChannelContext, TieredChannel};
pub use config::{Config, HomeCapacity, LogFormat, LoggingConfig, MigrationConfig, StorageConfig};
pub use dirs::{DirPool, DiskSpace};
pub use error::{TierError, TierResult};
pub use meta::{MemoryMetaStore, MetaStore, NOT_EXIST_INT, NOT_EXIST_LONG, TIMESTAMP_FIELD};
pub use migrator::{HotKey, Migrator, MigratorConfig, MigratorHandle, ScheduleReport};
pub use segment::SegmentId;
pub use store::TieredStore;
pub use tier::{Status, Tier};
pub use usage::{TierUsage, UsageSnapshot};
