//! Store initialization and per-segment entry points.
//!
//! [`TieredStore`] wires the home and overflow backends, the shared usage
//! accounting and the migrator from a [`Config`], and hands out one
//! [`TieredChannel`] per segment path.

use crate::backend::{Backends, FileBackend, MappedBackend};
use crate::channel::{ChannelContext, TieredChannel};
use crate::config::{Config, HomeCapacity};
use crate::dirs::{DirPool, SpaceProbe, statvfs_space};
use crate::error::TierResult;
use crate::meta::{MetaStore, NOT_EXIST_INT};
use crate::migrator::{Migrator, MigratorHandle};
use crate::segment::{meta_key, trailing_relative};
use crate::tier::Tier;
use crate::usage::TierUsage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

/// A tiered segment store.
pub struct TieredStore {
    ctx: Arc<ChannelContext>,
    migrator: Option<Arc<Migrator>>,
    handle: Mutex<Option<MigratorHandle>>,
    open: Mutex<HashMap<String, Weak<TieredChannel>>>,
}

impl TieredStore {
    /// Initialize a store and start its migrator.
    pub fn open(config: &Config, meta: Arc<dyn MetaStore>) -> TierResult<Self> {
        Self::open_with_probe(config, meta, statvfs_space)
    }

    /// Initialize a store using `probe` for disk space queries.
    pub fn open_with_probe(
        config: &Config,
        meta: Arc<dyn MetaStore>,
        probe: SpaceProbe,
    ) -> TierResult<Self> {
        config.validate()?;
        let storage = &config.storage;

        for dir in std::iter::once(&storage.home_path).chain(&storage.overflow_paths) {
            if let Err(e) = std::fs::create_dir_all(dir) {
                error!(path = %dir.display(), error = %e, "failed to create storage directory");
            }
        }

        let capacity = match storage.home_capacity {
            HomeCapacity::Bytes(bytes) => bytes,
            HomeCapacity::All => probe(&storage.home_path)?.total,
        };

        let home = Arc::new(MappedBackend::new(
            Tier::HOME,
            storage.home_path.clone(),
            storage.allocation_granularity,
            storage.segment_size,
        ));
        let pool = DirPool::with_probe(storage.overflow_paths.clone(), probe)?;
        let overflow = Arc::new(FileBackend::new(Tier::OVERFLOW, pool));
        let usage = Arc::new(TierUsage::new(Tier::HOME, capacity));

        let mut ctx = ChannelContext::new(Backends::new(home, overflow), meta, usage.clone())
            .with_copy_chunk_size(config.migration.copy_chunk_size as usize);

        let migrator = if config.migration.is_enabled() {
            let migrator = Arc::new(Migrator::new(
                config.migration.migrator_config(),
                usage,
            ));
            ctx = ctx.with_migrator(&migrator);
            Some(migrator)
        } else {
            info!("migration disabled, home tier is a fixed allocation");
            None
        };

        let handle = match &migrator {
            Some(migrator) => Some(migrator.start()?),
            None => None,
        };

        info!(
            home = %storage.home_path.display(),
            overflow = storage.overflow_paths.len(),
            capacity,
            "tiered store opened"
        );

        Ok(Self {
            ctx: Arc::new(ctx),
            migrator,
            handle: Mutex::new(handle),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Create a store from prebuilt parts without starting any threads.
    pub fn from_parts(ctx: ChannelContext, migrator: Option<Arc<Migrator>>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            migrator,
            handle: Mutex::new(None),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Relative segment path for `path`, which may be absolute or relative.
    pub fn relative(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            return path.to_path_buf();
        }
        self.ctx
            .backends
            .relativize(path)
            .unwrap_or_else(|| trailing_relative(path))
    }

    /// Open the segment at `path`.
    ///
    /// A segment that is already open returns the same channel.
    pub fn open_segment(
        &self,
        path: &Path,
        size: u64,
        preallocate: bool,
        mutable: bool,
    ) -> TierResult<Arc<TieredChannel>> {
        let relative = self.relative(path);
        let key = meta_key(&relative);

        let mut open = self.open.lock();
        if let Some(channel) = open.get(&key).and_then(Weak::upgrade)
            && !channel.is_deleted()
            && !channel.is_closed()
        {
            return Ok(channel);
        }

        let channel = TieredChannel::open(self.ctx.clone(), &relative, size, preallocate, mutable)?;
        open.insert(key, Arc::downgrade(&channel));
        Ok(channel)
    }

    /// Close the segment at `path` if it is open.
    pub fn close_segment(&self, path: &Path) -> TierResult<()> {
        let key = meta_key(&self.relative(path));
        let channel = self.open.lock().remove(&key).and_then(|w| w.upgrade());
        match channel {
            Some(channel) => channel.close(),
            None => Ok(()),
        }
    }

    /// Delete the segment at `path` in every tier along with its record.
    pub fn delete_segment(&self, path: &Path) -> TierResult<()> {
        let relative = self.relative(path);
        let key = meta_key(&relative);

        let live = self.open.lock().remove(&key).and_then(|w| w.upgrade());
        if let Some(channel) = live
            && !channel.is_closed()
        {
            return channel.delete();
        }

        if self.ctx.meta.get_int(&key) != NOT_EXIST_INT {
            // reopen through recovery so accounting is released exactly once
            return TieredChannel::open(self.ctx.clone(), &relative, 0, false, true)?.delete();
        }

        for backend in self.ctx.backends.iter() {
            if backend.remove(&relative)? {
                warn!(segment = key, tier = %backend.tier(), "removed unrecorded segment file");
            }
        }
        Ok(())
    }

    /// The migrator, if migration is enabled.
    pub fn migrator(&self) -> Option<&Arc<Migrator>> {
        self.migrator.as_ref()
    }

    /// Home tier accounting.
    pub fn usage(&self) -> &Arc<TierUsage> {
        &self.ctx.usage
    }

    /// The metadata store.
    pub fn meta(&self) -> &Arc<dyn MetaStore> {
        &self.ctx.meta
    }

    /// Backends by tier.
    pub fn backends(&self) -> &Backends {
        &self.ctx.backends
    }

    /// Stop the migrator threads. Open channels stay usable.
    pub fn stop(&self) {
        if let Some(mut handle) = self.handle.lock().take() {
            handle.stop();
        }
    }
}

impl Drop for TieredStore {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoggingConfig, MigrationConfig, StorageConfig};
    use crate::dirs::DiskSpace;
    use crate::meta::MemoryMetaStore;
    use std::io;

    fn roomy(_: &Path) -> io::Result<DiskSpace> {
        Ok(DiskSpace {
            total: 1 << 30,
            free: 1 << 30,
        })
    }

    fn config(base: &Path, threshold: f64) -> Config {
        Config {
            storage: StorageConfig {
                home_path: base.join("pmem"),
                overflow_paths: vec![base.join("hdd0"), base.join("hdd1")],
                home_capacity: HomeCapacity::All,
                allocation_granularity: 4096,
                segment_size: 64 * 1024,
            },
            migration: MigrationConfig {
                threshold,
                threads: 0,
                initial_delay_ms: 3_600_000,
                ..Default::default()
            },
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_open_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        let store = TieredStore::open_with_probe(&config(dir.path(), 0.5), meta, roomy).unwrap();
        assert!(dir.path().join("pmem").is_dir());
        assert!(dir.path().join("hdd0").is_dir());
        assert!(dir.path().join("hdd1").is_dir());
        assert_eq!(store.usage().capacity(), 1 << 30);
        assert!(store.migrator().is_some());
        store.stop();
    }

    #[test]
    fn test_disabled_migration_has_no_migrator() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        let store = TieredStore::open_with_probe(&config(dir.path(), -1.0), meta, roomy).unwrap();
        assert!(store.migrator().is_none());

        let channel = store.open_segment(Path::new("ns/0.log"), 0, true, true).unwrap();
        assert_eq!(channel.tier(), Tier::Pmem);
    }

    #[test]
    fn test_open_segment_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        let store = TieredStore::open_with_probe(&config(dir.path(), 0.5), meta, roomy).unwrap();

        let a = store.open_segment(Path::new("ns/0.log"), 0, true, true).unwrap();
        let b = store
            .open_segment(&dir.path().join("pmem/ns/0.log"), 0, true, true)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.migrator().unwrap().registered(), 1);

        store.close_segment(Path::new("ns/0.log")).unwrap();
        assert!(a.is_closed());
        assert_eq!(store.migrator().unwrap().registered(), 0);
    }

    #[test]
    fn test_delete_segment_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        let store =
            TieredStore::open_with_probe(&config(dir.path(), 0.5), meta.clone(), roomy).unwrap();

        let channel = store.open_segment(Path::new("ns/0.log"), 0, true, true).unwrap();
        channel.write_at(b"bytes", 0).unwrap();
        store.delete_segment(Path::new("ns/0.log")).unwrap();
        assert!(channel.is_deleted());
        assert!(!meta.contains("ns/0.log"));
        assert_eq!(store.usage().used(), 0);
        assert!(!dir.path().join("pmem/ns/0.log").exists());
    }

    #[test]
    fn test_delete_closed_segment_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        let store =
            TieredStore::open_with_probe(&config(dir.path(), 0.5), meta.clone(), roomy).unwrap();

        let channel = store.open_segment(Path::new("ns/1.log"), 0, true, true).unwrap();
        store.close_segment(Path::new("ns/1.log")).unwrap();
        drop(channel);

        store.delete_segment(Path::new("ns/1.log")).unwrap();
        assert!(!meta.contains("ns/1.log"));
        assert_eq!(store.usage().used(), 0);
        assert!(!dir.path().join("pmem/ns/1.log").exists());
    }

    #[test]
    fn test_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MemoryMetaStore::new());
        let store = TieredStore::open_with_probe(&config(dir.path(), -1.0), meta, roomy).unwrap();
        assert_eq!(
            store.relative(&dir.path().join("hdd1/ns/3.log")),
            PathBuf::from("ns/3.log")
        );
        assert_eq!(
            store.relative(Path::new("/somewhere/else/ns/4.log")),
            PathBuf::from("ns/4.log")
        );
        assert_eq!(store.relative(Path::new("ns/5.log")), PathBuf::from("ns/5.log"));
    }
}
