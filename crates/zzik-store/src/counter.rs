//! Atomic fixed-window counters backing the rate limiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use zzik_core::{Clock, after_secs};

use crate::CounterError;

/// Counter value and the instant its window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    pub count: u64,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`. The first increment of a window sets the
    /// expiry to `window_secs` from now; later increments keep it.
    async fn incr(&self, key: &str, window_secs: u64) -> Result<CounterHit, CounterError>;

    async fn get(&self, key: &str) -> Result<Option<CounterHit>, CounterError>;

    async fn reset(&self, key: &str) -> Result<(), CounterError>;
}

/// Process-local counter store. Increments are atomic under one mutex.
#[derive(Debug)]
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CounterHit>>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tracked counters, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |e| e.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CounterHit>>, CounterError> {
        self.entries
            .lock()
            .map_err(|e| CounterError::Unavailable(format!("mutex poisoned: {e}")))
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, window_secs: u64) -> Result<CounterHit, CounterError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        // Closed windows are dropped here so the map only holds live counters.
        entries.retain(|_, hit| hit.expires_at > now);
        let entry = entries.entry(key.to_string()).or_insert(CounterHit {
            count: 0,
            expires_at: after_secs(now, window_secs),
        });
        entry.count += 1;
        Ok(*entry)
    }

    async fn get(&self, key: &str) -> Result<Option<CounterHit>, CounterError> {
        let now = self.clock.now();
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(hit) if hit.expires_at <= now => {
                entries.remove(key);
                Ok(None)
            }
            hit => Ok(hit.copied()),
        }
    }

    async fn reset(&self, key: &str) -> Result<(), CounterError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
