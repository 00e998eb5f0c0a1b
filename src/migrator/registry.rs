//! Channel registry ordered by hotness.

use crate::channel::TieredChannel;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::error;

/// Hotness ordering key: older segments sort first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HotKey {
    /// Creation time in epoch milliseconds.
    pub timestamp_ms: i64,
    /// Segment namespace.
    pub namespace: String,
    /// Segment id.
    pub id: u64,
    /// Metadata key, which tells apart files sharing a segment id.
    pub path: String,
}

impl HotKey {
    pub(crate) fn of(channel: &TieredChannel) -> Self {
        Self {
            timestamp_ms: channel.timestamp_ms(),
            namespace: channel.segment().namespace().to_string(),
            id: channel.segment().id(),
            path: channel.key().to_string(),
        }
    }
}

/// A registered channel and the size it contributed to the total.
pub(crate) struct Entry {
    pub channel: Arc<TieredChannel>,
    pub size: u64,
}

impl Entry {
    pub fn is(&self, channel: &TieredChannel) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.channel), channel)
    }
}

/// Channels merged by the scheduler, guarded by the registry lock.
#[derive(Default)]
pub(crate) struct Registry {
    pub channels: BTreeMap<HotKey, Entry>,
    /// Newest channel the demotion scan moved past. Promotion stops here.
    pub last_evicted: Option<HotKey>,
}

impl Registry {
    pub fn take(&mut self, channel: &TieredChannel) -> Option<Entry> {
        let key = HotKey::of(channel);
        if self.channels.get(&key).is_some_and(|e| e.is(channel)) {
            self.channels.remove(&key)
        } else {
            None
        }
    }
}

/// Newly opened channels waiting for the next pass, and the highest id seen
/// per namespace. Guarded by the intake lock, taken after the registry lock.
#[derive(Default)]
pub(crate) struct Intake {
    pub buffer: Vec<Entry>,
    pub ns_ids: HashMap<String, u64>,
}

impl Intake {
    pub fn push(&mut self, entry: Entry) {
        let segment = entry.channel.segment();
        let highest = self
            .ns_ids
            .entry(segment.namespace().to_string())
            .or_insert(segment.id());
        if *highest > segment.id() {
            error!(
                namespace = segment.namespace(),
                id = segment.id(),
                highest = *highest,
                "segment ids registered out of order"
            );
        } else {
            *highest = segment.id();
        }
        self.buffer.push(entry);
    }

    pub fn take(&mut self, channel: &TieredChannel) -> Option<Entry> {
        let idx = self.buffer.iter().position(|e| e.is(channel))?;
        Some(self.buffer.swap_remove(idx))
    }

    /// A channel may migrate once a newer segment exists in its namespace.
    pub fn is_eligible(&self, channel: &TieredChannel) -> bool {
        let segment = channel.segment();
        self.ns_ids
            .get(segment.namespace())
            .is_some_and(|highest| *highest > segment.id())
    }
}
