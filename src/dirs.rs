//! Multi-directory pool.
//!
//! A single logical tier may be spread over several physical volumes, each
//! mounted at its own root. [`DirPool`] resolves a relative segment path to
//! the root that already holds it, or picks a root for a new file with a
//! random draw weighted by each root's free space.

use crate::error::{TierError, TierResult};
use parking_lot::RwLock;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

const GIB: u64 = 1024 * 1024 * 1024;

/// Total and available bytes of the volume holding a root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskSpace {
    /// Size of the volume in bytes.
    pub total: u64,
    /// Bytes available to unprivileged writers.
    pub free: u64,
}

/// Function used to query a root's [`DiskSpace`].
pub type SpaceProbe = fn(&Path) -> io::Result<DiskSpace>;

/// Query a volume with `statvfs(3)`.
#[cfg(unix)]
pub fn statvfs_space(path: &Path) -> io::Result<DiskSpace> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(io::Error::last_os_error());
        }
        let frsize = stat.f_frsize as u64;
        Ok(DiskSpace {
            total: (stat.f_blocks as u64).saturating_mul(frsize),
            free: (stat.f_bavail as u64).saturating_mul(frsize),
        })
    }
}

/// A set of filesystem roots backing one tier.
pub struct DirPool {
    roots: Vec<PathBuf>,
    probe: SpaceProbe,
    stats: RwLock<Vec<DiskSpace>>,
}

impl DirPool {
    /// Create a pool over `roots` using `statvfs` for space queries.
    #[cfg(unix)]
    pub fn new(roots: Vec<PathBuf>) -> TierResult<Self> {
        Self::with_probe(roots, statvfs_space)
    }

    /// Create a pool with a custom space probe.
    pub fn with_probe(roots: Vec<PathBuf>, probe: SpaceProbe) -> TierResult<Self> {
        if roots.is_empty() {
            return Err(TierError::Config(
                "directory pool needs at least one root".to_string(),
            ));
        }
        let pool = Self {
            stats: RwLock::new(vec![DiskSpace::default(); roots.len()]),
            roots,
            probe,
        };
        pool.refresh();
        Ok(pool)
    }

    /// Re-query free and total space for every root.
    pub fn refresh(&self) {
        let fresh: Vec<DiskSpace> = self
            .roots
            .iter()
            .map(|root| {
                (self.probe)(root).unwrap_or_else(|e| {
                    warn!(root = %root.display(), error = %e, "failed to query disk space");
                    DiskSpace::default()
                })
            })
            .collect();
        *self.stats.write() = fresh;
    }

    /// The configured roots.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Sum of volume sizes at the last refresh.
    pub fn capacity(&self) -> u64 {
        self.stats.read().iter().map(|s| s.total).sum()
    }

    /// Sum of free space at the last refresh.
    pub fn free(&self) -> u64 {
        self.stats.read().iter().map(|s| s.free).sum()
    }

    /// Root with the most free space at the last refresh.
    pub fn max_dir(&self) -> &Path {
        let stats = self.stats.read();
        let idx = stats
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| s.free)
            .map(|(i, _)| i)
            .unwrap_or(0);
        &self.roots[idx]
    }

    /// Returns true if `path` lies under one of the roots.
    pub fn contains_absolute(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    /// Strip the owning root from an absolute path.
    pub fn relativize(&self, path: &Path) -> Option<PathBuf> {
        self.roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())
            .map(Path::to_path_buf)
    }

    /// Index of the first root under which `relative` already exists.
    pub fn resolve(&self, relative: &Path) -> Option<usize> {
        self.roots
            .iter()
            .position(|root| root.join(relative).exists())
    }

    /// Returns true if `relative` exists under any root.
    pub fn contains_relative(&self, relative: &Path) -> bool {
        self.resolve(relative).is_some()
    }

    /// Pick a root for a new file.
    ///
    /// Unbalanced picks are uniform. Balanced picks are weighted by free
    /// space in whole GiB, falling back to byte weights when every root has
    /// less than one GiB free.
    pub fn pick_root(&self, balanced: bool, refresh: bool) -> TierResult<&Path> {
        let mut rng = rand::rng();

        if !balanced {
            return Ok(&self.roots[rng.random_range(0..self.roots.len())]);
        }

        if refresh {
            self.refresh();
        }

        let stats = self.stats.read();
        let mut weights: Vec<u64> = stats.iter().map(|s| s.free / GIB).collect();
        if weights.iter().all(|w| *w == 0) {
            weights = stats.iter().map(|s| s.free).collect();
        }
        let sum: u64 = weights.iter().sum();
        if sum == 0 {
            return Err(TierError::NoFreeSpace(self.roots.len()));
        }

        let mut draw = rng.random_range(0..sum);
        for (idx, weight) in weights.iter().enumerate() {
            if draw < *weight {
                return Ok(&self.roots[idx]);
            }
            draw -= weight;
        }

        // unreachable while weights sum to `sum`
        Ok(&self.roots[self.roots.len() - 1])
    }

    /// Absolute path for `relative`: the existing location, or a new one on a
    /// balanced pick.
    pub fn to_absolute(&self, relative: &Path) -> TierResult<PathBuf> {
        if let Some(idx) = self.resolve(relative) {
            return Ok(self.roots[idx].join(relative));
        }
        Ok(self.pick_root(true, false)?.join(relative))
    }
}

impl std::fmt::Debug for DirPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirPool")
            .field("roots", &self.roots)
            .field("stats", &*self.stats.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    // Space is derived from the root's directory name so tests are hermetic.
    fn named_probe(path: &Path) -> io::Result<DiskSpace> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let free = match name {
            "big" => 9 * GIB,
            "small" => GIB,
            "tiny" => 100 * 1024 * 1024,
            "broken" => return Err(io::Error::other("probe failed")),
            _ => 0,
        };
        Ok(DiskSpace {
            total: 10 * GIB,
            free,
        })
    }

    fn pool(base: &Path, names: &[&str]) -> DirPool {
        let roots = names
            .iter()
            .map(|n| {
                let p = base.join(n);
                fs::create_dir_all(&p).unwrap();
                p
            })
            .collect();
        DirPool::with_probe(roots, named_probe).unwrap()
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(DirPool::with_probe(Vec::new(), named_probe).is_err());
    }

    #[test]
    fn test_capacity_free_max_dir() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), &["small", "big"]);
        assert_eq!(pool.capacity(), 20 * GIB);
        assert_eq!(pool.free(), 10 * GIB);
        assert_eq!(pool.max_dir(), dir.path().join("big"));
    }

    #[test]
    fn test_resolve_existing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), &["small", "big"]);
        let rel = Path::new("ns/0.log");
        assert_eq!(pool.resolve(rel), None);
        assert!(!pool.contains_relative(rel));

        fs::create_dir_all(dir.path().join("small/ns")).unwrap();
        fs::write(dir.path().join("small/ns/0.log"), b"x").unwrap();

        assert_eq!(pool.resolve(rel), Some(0));
        assert_eq!(
            pool.to_absolute(rel).unwrap(),
            dir.path().join("small/ns/0.log")
        );
    }

    #[test]
    fn test_contains_absolute_and_relativize() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), &["big"]);
        let abs = dir.path().join("big/ns/3.log");
        assert!(pool.contains_absolute(&abs));
        assert_eq!(pool.relativize(&abs), Some(PathBuf::from("ns/3.log")));
        assert!(!pool.contains_absolute(Path::new("/elsewhere/ns/3.log")));
        assert_eq!(pool.relativize(Path::new("/elsewhere/ns/3.log")), None);
    }

    #[test]
    fn test_weighted_pick_prefers_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), &["small", "big"]);
        let big = dir.path().join("big");

        let mut big_picks = 0;
        for _ in 0..2000 {
            if pool.pick_root(true, false).unwrap() == big {
                big_picks += 1;
            }
        }
        // expected 90%
        assert!(big_picks > 1500, "big picked {} times", big_picks);
    }

    #[test]
    fn test_full_root_never_picked() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), &["full", "small"]);
        for _ in 0..200 {
            assert_eq!(
                pool.pick_root(true, true).unwrap(),
                dir.path().join("small")
            );
        }
    }

    #[test]
    fn test_sub_gib_roots_still_weighted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), &["tiny", "full"]);
        assert_eq!(pool.pick_root(true, false).unwrap(), dir.path().join("tiny"));
    }

    #[test]
    fn test_no_free_space_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), &["full", "broken"]);
        assert!(matches!(
            pool.pick_root(true, true),
            Err(TierError::NoFreeSpace(2))
        ));
        assert!(pool.to_absolute(Path::new("ns/0.log")).is_err());
    }

    #[test]
    fn test_unbalanced_pick_ignores_space() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), &["full"]);
        assert_eq!(pool.pick_root(false, false).unwrap(), dir.path().join("full"));
    }

    #[test]
    fn test_statvfs_on_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let space = statvfs_space(dir.path()).unwrap();
        assert!(space.total > 0);
        assert!(space.free <= space.total);
    }
}
