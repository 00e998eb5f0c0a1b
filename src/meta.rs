//! Metadata store contract.
//!
//! The durable key/value store that remembers each segment's current tier
//! and creation timestamp. Keys are relative segment paths. Reads use
//! reserved sentinels for "not present" so crash recovery never has to
//! treat a missing record as a fault.

use crate::error::TierResult;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Sentinel returned by [`MetaStore::get_int`] for a missing key.
pub const NOT_EXIST_INT: i32 = i32::MIN;

/// Sentinel returned by [`MetaStore::get_long`] for a missing key or field.
pub const NOT_EXIST_LONG: i64 = i64::MIN;

/// Sub-field holding the segment creation time in epoch milliseconds.
pub const TIMESTAMP_FIELD: &str = "_timestamp_";

/// Typed get/put/delete keyed by relative segment path.
pub trait MetaStore: Send + Sync {
    /// Integer value for `key`, or [`NOT_EXIST_INT`].
    fn get_int(&self, key: &str) -> i32;

    /// Long value of `field` under `key`, or [`NOT_EXIST_LONG`].
    fn get_long(&self, key: &str, field: &str) -> i64;

    /// Store the integer value for `key`.
    fn put_int(&self, key: &str, value: i32) -> TierResult<()>;

    /// Store a long value in `field` under `key`.
    fn put_long(&self, key: &str, field: &str, value: i64) -> TierResult<()>;

    /// Remove `key` and all of its fields.
    fn del(&self, key: &str) -> TierResult<()>;
}

#[derive(Debug, Default, Clone)]
struct Record {
    int: Option<i32>,
    longs: HashMap<String, i64>,
}

/// In-process [`MetaStore`].
///
/// Survives as long as the value does; share it through an `Arc` to model a
/// process restart against the same store.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryMetaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if any value is recorded for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.records.lock().contains_key(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl MetaStore for MemoryMetaStore {
    fn get_int(&self, key: &str) -> i32 {
        self.records
            .lock()
            .get(key)
            .and_then(|r| r.int)
            .unwrap_or(NOT_EXIST_INT)
    }

    fn get_long(&self, key: &str, field: &str) -> i64 {
        self.records
            .lock()
            .get(key)
            .and_then(|r| r.longs.get(field).copied())
            .unwrap_or(NOT_EXIST_LONG)
    }

    fn put_int(&self, key: &str, value: i32) -> TierResult<()> {
        self.records.lock().entry(key.to_string()).or_default().int = Some(value);
        Ok(())
    }

    fn put_long(&self, key: &str, field: &str, value: i64) -> TierResult<()> {
        self.records
            .lock()
            .entry(key.to_string())
            .or_default()
            .longs
            .insert(field.to_string(), value);
        Ok(())
    }

    fn del(&self, key: &str) -> TierResult<()> {
        self.records.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_values_use_sentinels() {
        let store = MemoryMetaStore::new();
        assert_eq!(store.get_int("ns/0.log"), NOT_EXIST_INT);
        assert_eq!(store.get_long("ns/0.log", TIMESTAMP_FIELD), NOT_EXIST_LONG);
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_get_del() {
        let store = MemoryMetaStore::new();
        store.put_int("ns/0.log", 3).unwrap();
        store.put_long("ns/0.log", TIMESTAMP_FIELD, 1_700_000_000_000).unwrap();

        assert_eq!(store.get_int("ns/0.log"), 3);
        assert_eq!(store.get_long("ns/0.log", TIMESTAMP_FIELD), 1_700_000_000_000);
        assert_eq!(store.get_long("ns/0.log", "other"), NOT_EXIST_LONG);
        assert_eq!(store.len(), 1);

        store.del("ns/0.log").unwrap();
        assert!(!store.contains("ns/0.log"));
        assert_eq!(store.get_int("ns/0.log"), NOT_EXIST_INT);
    }

    #[test]
    fn test_long_without_int() {
        let store = MemoryMetaStore::new();
        store.put_long("ns/1.log", TIMESTAMP_FIELD, 5).unwrap();
        assert_eq!(store.get_int("ns/1.log"), NOT_EXIST_INT);
        assert_eq!(store.get_long("ns/1.log", TIMESTAMP_FIELD), 5);
    }
}
