use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Short-lived per-key exclusive locks.
///
/// Serializes concurrent writes that share an idempotency key within this
/// process; entries are dropped again once nobody holds or waits on them.
#[derive(Default)]
pub struct KeyedLocks {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            // An entry only the map references is idle: no guard, no waiter.
            // Pruning here keeps the map bounded by live keys.
            entries.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                entries
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        lock.lock_owned().await
    }
}
