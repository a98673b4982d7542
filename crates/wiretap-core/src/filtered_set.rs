//! TTL-bounded set of dropped request ids (spec.md §4.2 step 3).
//!
//! The reference backs this with a `freecache` byte-capped LRU keyed on the
//! raw ASCII meta id — captured ids are not guaranteed to be valid hex, so
//! the key here is the raw `payload_id` byte slice, not a parsed [`Uuid`].
//! A `HashMap<Vec<u8>, Instant>` purged lazily on access gets the same
//! externally observable behavior without pulling in a cache crate for a
//! small, short-lived key set.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct FilteredSet {
    ttl: Duration,
    entries: HashMap<Vec<u8>, Instant>,
}

impl FilteredSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Records a request as filtered (its rewrite produced an empty payload).
    pub fn insert(&mut self, id: &[u8]) {
        self.entries.insert(id.to_vec(), Instant::now());
    }

    /// Checks and evicts in one step: a response whose request id was
    /// filtered should itself be dropped exactly once.
    pub fn take(&mut self, id: &[u8]) -> bool {
        self.purge_expired();
        self.entries.remove(id).is_some()
    }

    fn purge_expired(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, inserted| inserted.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_request_suppresses_its_response_once() {
        let mut set = FilteredSet::new(Duration::from_secs(60));
        let id = b"1234567890123456789a0000";
        set.insert(id);
        assert!(set.take(id));
        assert!(!set.take(id));
    }

    #[test]
    fn expired_entries_are_not_taken() {
        let mut set = FilteredSet::new(Duration::from_millis(0));
        let id = b"1234567890123456789a0000";
        set.insert(id);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!set.take(id));
    }
}
