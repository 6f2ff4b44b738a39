//! Per-key mutual exclusion
//!
//! Locks are created on demand and dropped from the table when the last
//! holder or waiter releases them. Distinct keys never contend.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    table: Mutex<HashMap<Vec<u8>, Arc<Mutex<()>>>>,
}

/// Held lock on one key; released on drop
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: Vec<u8>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, key: &[u8]) -> KeyGuard<'_> {
        let slot = {
            let mut table = self.table.lock();
            table
                .entry(key.to_vec())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = slot.lock_arc();
        KeyGuard {
            locks: self,
            key: key.to_vec(),
            guard: Some(guard),
        }
    }

    /// Lock several keys in ascending byte order; duplicates are locked once
    pub fn lock_many(&self, keys: &[&[u8]]) -> Vec<KeyGuard<'_>> {
        let mut ordered: Vec<&[u8]> = keys.to_vec();
        ordered.sort();
        ordered.dedup();
        ordered.into_iter().map(|key| self.lock(key)).collect()
    }

    /// Number of keys currently held or waited on
    pub fn active(&self) -> usize {
        self.table.lock().len()
    }
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.locks.table.lock();
        if let Some(slot) = table.get(&self.key) {
            if Arc::strong_count(slot) == 1 {
                table.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_lock_released_on_drop() {
        let locks = KeyedLocks::new();
        {
            let _guard = locks.lock(b"owner-1");
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(b"a");
        let _b = locks.lock(b"b");
        assert_eq!(locks.active(), 2);
    }

    #[test]
    fn test_lock_many_dedups() {
        let locks = KeyedLocks::new();
        let guards = locks.lock_many(&[b"z".as_slice(), b"a".as_slice(), b"z".as_slice()]);
        assert_eq!(guards.len(), 2);
        assert_eq!(guards[0].key(), b"a");
    }

    #[test]
    fn test_same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = locks.lock(b"shared");
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }
}
