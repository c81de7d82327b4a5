use crate::ContentHash;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

const PURGE_CHECK_INTERVAL: usize = 64;

#[derive(Debug, Clone, Copy)]
struct ElisionEntry {
    size: i64,
    expires_at: SystemTime,
}

/// TTL map from content hash to known byte size, used to short-circuit
/// existence checks. Strictly a hint: a missing entry never implies
/// absence, and consumers verify against authoritative stores before
/// skipping work, so lost or stale entries only cost extra probes.
#[derive(Default)]
pub struct ElisionCache {
    entries: Mutex<HashMap<ContentHash, ElisionEntry>>,
    insert_count: Mutex<usize>,
}

impl ElisionCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            insert_count: Mutex::new(0),
        }
    }

    /// Entries past their wall-clock deadline read as absent.
    pub fn try_get(&self, hash: &ContentHash) -> Option<i64> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(hash) {
            Some(entry) if entry.expires_at > SystemTime::now() => Some(entry.size),
            Some(_) => {
                entries.remove(hash);
                None
            }
            None => None,
        }
    }

    /// Overwrites any earlier entry for the hash.
    pub fn try_add(&self, hash: &ContentHash, size: i64, ttl: Duration) {
        let expires_at = SystemTime::now() + ttl;
        let mut entries = self.entries.lock().unwrap();
        entries.insert(*hash, ElisionEntry { size, expires_at });

        let mut count = self.insert_count.lock().unwrap();
        *count += 1;
        if *count % PURGE_CHECK_INTERVAL == 0 {
            let now = SystemTime::now();
            entries.retain(|_, entry| entry.expires_at > now);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
