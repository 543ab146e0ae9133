// Keyed mutual-exclusion boundaries for tiebreakers and rounds.

use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

use crate::model::{RoundId, TiebreakerId};

/// A registry handing out one mutex per key. Work on different keys never
/// contends; work on the same key is serialized.
pub struct KeyedLocks<K> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Fetch (or lazily create) the mutex for `key`. The DashMap shard guard
    /// is dropped before the caller blocks on the returned mutex.
    pub fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the entry for `key` once nobody else holds its handle. Used
    /// when a tiebreaker resolves or a round completes, so the map tracks
    /// live keys rather than every id ever seen.
    pub fn release(&self, key: &K) -> bool {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock a handle returned by [`KeyedLocks::handle`]. A poisoned mutex only
/// means a previous holder panicked; the guarded unit carries no data, so
/// the lock is still usable.
pub fn acquire(handle: &Mutex<()>) -> MutexGuard<'_, ()> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The engine's serialization boundaries.
#[derive(Default)]
pub struct LockRegistry {
    pub tiebreakers: KeyedLocks<TiebreakerId>,
    pub rounds: KeyedLocks<RoundId>,
}
