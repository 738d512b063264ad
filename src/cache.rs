//! A bounded LRU over open granule handles.
//!
//! The evaluator touches each granule once per variable, so reopening the
//! file for every read would multiply open/close syscalls by the variable
//! count. The cache keeps a small number of handles alive, evicting in least
//! recently used order; everything still works with a limit of zero, since a
//! miss simply opens the granule for the duration of the call.
//!
//! Entries are directly accessible via `map` and also threaded through a
//! doubly linked list where `most_recent` and `least_recent` are the two
//! ends.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::Result;
use crate::granule::{Granule, GranuleStore};

/// Handles kept open beyond the read that needed them.
const DEFAULT_LIMIT: usize = 8;

pub struct HandleCache<'a> {
    store: &'a dyn GranuleStore,
    entries: Mutex<Entries>,
}

struct Entries {
    limit: usize,
    map: HashMap<String, CacheEntry>,
    most_recent: Option<String>,
    least_recent: Option<String>,
}

struct CacheEntry {
    handle: Arc<dyn Granule>,
    more_recent: Option<String>,
    less_recent: Option<String>,
}

impl<'a> HandleCache<'a> {
    pub fn new(store: &'a dyn GranuleStore) -> Self {
        Self::with_limit(store, DEFAULT_LIMIT)
    }

    pub fn with_limit(store: &'a dyn GranuleStore, limit: usize) -> Self {
        HandleCache {
            store,
            entries: Mutex::new(Entries {
                limit,
                map: HashMap::new(),
                most_recent: None,
                least_recent: None,
            }),
        }
    }

    /// Get a handle for `path`, opening the granule read-only on a miss. A
    /// hit moves the handle to the most recently used position.
    ///
    pub fn get(&self, path: &str) -> Result<Arc<dyn Granule>> {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.detach(path) {
                let handle = Arc::clone(&entry.handle);
                entries.push_most_recent(path.to_string(), entry.handle);
                return Ok(handle);
            }
        }

        let handle = self.store.open(path)?;
        let mut entries = self.entries.lock();
        entries.push_most_recent(path.to_string(), Arc::clone(&handle));
        entries.evict_over_limit();
        Ok(handle)
    }
}

impl Entries {
    /// Unlink an entry from both the map and the recency list.
    ///
    fn detach(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.map.remove(key)?;
        if self.most_recent.as_deref() == Some(key) {
            self.most_recent = entry.less_recent.clone();
        }
        if self.least_recent.as_deref() == Some(key) {
            self.least_recent = entry.more_recent.clone();
        }
        if let Some(less) = &entry.less_recent {
            if let Some(neighbor) = self.map.get_mut(less) {
                neighbor.more_recent = entry.more_recent.clone();
            }
        }
        if let Some(more) = &entry.more_recent {
            if let Some(neighbor) = self.map.get_mut(more) {
                neighbor.less_recent = entry.less_recent.clone();
            }
        }
        Some(entry)
    }

    fn push_most_recent(&mut self, key: String, handle: Arc<dyn Granule>) {
        let old_head = self.most_recent.take();
        if let Some(head) = &old_head {
            if let Some(neighbor) = self.map.get_mut(head) {
                neighbor.more_recent = Some(key.clone());
            }
        }
        self.most_recent = Some(key.clone());
        if self.least_recent.is_none() {
            self.least_recent = Some(key.clone());
        }
        self.map.insert(
            key,
            CacheEntry {
                handle,
                more_recent: None,
                less_recent: old_head,
            },
        );
    }

    fn evict_over_limit(&mut self) {
        while self.map.len() > self.limit {
            match self.least_recent.clone() {
                Some(tail) => {
                    // Evicting drops the handle, closing the granule.
                    self.detach(&tail);
                }
                None => break,
            }
        }
    }
}
