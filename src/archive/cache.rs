//! Caches owned by one [`ArchiveStore`](super::ArchiveStore).
//!
//! Both caches hand out `Arc` snapshots. A reader never observes a value
//! being built; a refresh swaps in a whole new snapshot. Two readers racing
//! on a miss may both load the same data, which is harmless because export
//! files are immutable.

use arc_swap::ArcSwapOption;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::{ChatRecord, LoadedMessage};

/// Chat id plus the exact file list that was loaded.
pub type MessageCacheKey = (String, Vec<String>);

/// Bounded cache of loaded per-chat message arrays. When full, the oldest
/// inserted entry is evicted first.
pub struct MessageCache {
    entries: Mutex<IndexMap<MessageCacheKey, Arc<Vec<LoadedMessage>>>>,
    capacity: usize,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &MessageCacheKey) -> Option<Arc<Vec<LoadedMessage>>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: MessageCacheKey, messages: Arc<Vec<LoadedMessage>>) {
        let mut entries = self.entries.lock();
        entries.insert(key, messages);
        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

struct ChatListEntry {
    fetched_at: Instant,
    chats: Arc<Vec<ChatRecord>>,
}

/// Time-expiring snapshot of the enumerated chat list.
pub struct ChatListCache {
    entry: ArcSwapOption<ChatListEntry>,
    ttl: Duration,
}

impl ChatListCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: ArcSwapOption::const_empty(),
            ttl,
        }
    }

    /// The cached list, unless it is older than the TTL.
    pub fn get(&self) -> Option<Arc<Vec<ChatRecord>>> {
        let guard = self.entry.load();
        match guard.as_ref() {
            Some(entry) if entry.fetched_at.elapsed() < self.ttl => Some(entry.chats.clone()),
            _ => None,
        }
    }

    pub fn store(&self, chats: Arc<Vec<ChatRecord>>) {
        self.entry.store(Some(Arc::new(ChatListEntry {
            fetched_at: Instant::now(),
            chats,
        })));
    }

    pub fn invalidate(&self) {
        self.entry.store(None);
    }
}
