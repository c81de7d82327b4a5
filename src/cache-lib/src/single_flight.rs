use crate::{CacheError, CacheResult, ContentHash};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

struct GateEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    holders: usize,
}

/// Keyed mutex deduplicating concurrent work on the same hash.
///
/// `acquire` blocks until the key is free or cancellation fires. The
/// returned handle reports `wait_free() == true` iff no other holder
/// was present at acquisition time; callers use a false value as the
/// signal to re-read shared state, because another thread may have just
/// completed the same work. Releasing the last handle removes the key.
/// Fairness is unordered.
#[derive(Clone, Default)]
pub struct SingleFlightGate {
    entries: Arc<Mutex<HashMap<ContentHash, GateEntry>>>,
}

impl SingleFlightGate {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn acquire(
        &self,
        key: ContentHash,
        cancel: &CancellationToken,
    ) -> CacheResult<GateHandle> {
        let lock = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(key).or_insert_with(|| GateEntry {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            entry.lock.clone()
        };

        if let Ok(guard) = lock.clone().try_lock_owned() {
            return Ok(GateHandle {
                entries: self.entries.clone(),
                key,
                wait_free: true,
                _guard: guard,
            });
        }

        tokio::select! {
            guard = lock.lock_owned() => Ok(GateHandle {
                entries: self.entries.clone(),
                key,
                wait_free: false,
                _guard: guard,
            }),
            _ = cancel.cancelled() => {
                release_slot(&self.entries, &key);
                Err(CacheError::Cancelled(format!(
                    "gate acquire cancelled for {}",
                    key.short_hash()
                )))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn key_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

fn release_slot(entries: &Arc<Mutex<HashMap<ContentHash, GateEntry>>>, key: &ContentHash) {
    let mut entries = entries.lock().unwrap();
    if let Some(entry) = entries.get_mut(key) {
        entry.holders -= 1;
        if entry.holders == 0 {
            entries.remove(key);
        }
    }
}

pub struct GateHandle {
    entries: Arc<Mutex<HashMap<ContentHash, GateEntry>>>,
    key: ContentHash,
    wait_free: bool,
    _guard: OwnedMutexGuard<()>,
}

impl GateHandle {
    /// True iff the gate was obtained without contention.
    pub fn wait_free(&self) -> bool {
        self.wait_free
    }
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        // Waiters hold their own clone of the entry lock, so removing
        // the map slot here cannot strand them.
        release_slot(&self.entries, &self.key);
    }
}
