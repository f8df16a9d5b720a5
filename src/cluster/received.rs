//! Received-message ledger
//!
//! Remembers the UUIDs of messages already handed to local subscribers so a
//! message reaching us twice (live and replayed, or redelivered by the
//! transport) is processed once.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

pub struct ReceivedMessages {
    lifetime: Duration,
    seen: Mutex<HashMap<Uuid, Instant>>,
}

impl ReceivedMessages {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Instant>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a message; returns false if it was already seen
    pub fn record(&self, uuid: Uuid) -> bool {
        let mut seen = self.lock();
        if seen.contains_key(&uuid) {
            return false;
        }
        seen.insert(uuid, Instant::now());
        true
    }

    /// Forget entries older than the lifetime
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub(crate) fn evict_expired_at(&self, now: Instant) -> usize {
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, at| now.duration_since(*at) < self.lifetime);
        before - seen.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_rejected() {
        let ledger = ReceivedMessages::new(Duration::from_secs(300));
        let id = Uuid::new_v4();

        assert!(ledger.record(id));
        assert!(!ledger.record(id));
        assert!(ledger.record(Uuid::new_v4()));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_expired_entries_are_forgotten() {
        let ledger = ReceivedMessages::new(Duration::from_secs(300));
        ledger.record(Uuid::new_v4());

        assert_eq!(ledger.evict_expired_at(Instant::now()), 0);
        assert_eq!(ledger.evict_expired_at(Instant::now() + Duration::from_secs(301)), 1);
        assert!(ledger.is_empty());
    }
}
