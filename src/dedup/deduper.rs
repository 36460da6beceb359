//! Event Deduper
//!
//! Bounded memory of recently processed fingerprints. Redeliveries after a
//! reconnect and server echoes of local optimistic updates arrive with the
//! same fingerprint and are dropped while the original is still retained.
//!
//! Sightings are scoped: every descriptor gets its own copy of a change, so
//! one descriptor's delivery never suppresses another's. Local changes are
//! recorded once and suppress the echo in every scope.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::fingerprint::EventFingerprint;

/// Scope of fingerprints recorded for locally-triggered changes
const LOCAL_SCOPE: &str = "@local";

/// Configuration for the deduper
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a fingerprint suppresses duplicates
    pub retention: Duration,
    /// Ring size above which age-based eviction runs on insert
    pub prune_threshold: usize,
    /// Hard upper bound on retained fingerprints
    ///
    /// Reaching it evicts the oldest fingerprints even inside the retention
    /// window, so a burst of more than `capacity` distinct changes within
    /// `retention` can let a late redelivery through. Memory stays bounded
    /// at the cost of that rare duplicate.
    pub capacity: usize,
    /// Row field holding the entity id
    pub id_field: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(10),
            prune_threshold: 100,
            capacity: 500,
            id_field: "id".to_string(),
        }
    }
}

#[derive(Default)]
struct Ring {
    /// Latest sighting per key
    seen: HashMap<String, Instant>,
    /// Insertion order; may hold stale entries for refreshed keys
    order: VecDeque<(String, Instant)>,
}

impl Ring {
    /// Pop the oldest ring entry, dropping its key if it was not refreshed
    fn pop_oldest(&mut self) -> bool {
        match self.order.pop_front() {
            Some((key, at)) => {
                if self.seen.get(&key) == Some(&at) {
                    self.seen.remove(&key);
                }
                true
            }
            None => false,
        }
    }
}

/// Decides whether a change notification was already processed
pub struct EventDeduper {
    config: DedupConfig,
    ring: Mutex<Ring>,
}

impl EventDeduper {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            ring: Mutex::new(Ring::default()),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn should_process(&self, scope: &str, fingerprint: &EventFingerprint) -> bool {
        self.should_process_at(scope, fingerprint, Instant::now())
    }

    /// Returns false if `fingerprint` was seen in `scope`, or recorded as a
    /// local change, within the retention window. The sighting is recorded
    /// either way.
    pub fn should_process_at(
        &self,
        scope: &str,
        fingerprint: &EventFingerprint,
        now: Instant,
    ) -> bool {
        let key = fingerprint.key();
        let scoped = format!("{}|{}", scope, key);
        let local = format!("{}|{}", LOCAL_SCOPE, key);
        let retention = self.config.retention;
        let mut ring = self.ring.lock();

        if ring.seen.len() > self.config.prune_threshold {
            Self::evict_locked(&mut ring, now, retention);
        }

        let fresh = |ring: &Ring, key: &str| {
            ring.seen
                .get(key)
                .is_some_and(|seen| now.saturating_duration_since(*seen) < retention)
        };
        let duplicate = fresh(&*ring, &scoped) || fresh(&*ring, &local);

        self.insert_locked(&mut ring, scoped, now);
        !duplicate
    }

    /// Mark a locally-triggered event as processed so its echo is dropped
    /// in every scope
    pub fn record(&self, fingerprint: &EventFingerprint) {
        self.record_at(fingerprint, Instant::now());
    }

    pub fn record_at(&self, fingerprint: &EventFingerprint, now: Instant) {
        let mut ring = self.ring.lock();
        let local = format!("{}|{}", LOCAL_SCOPE, fingerprint.key());
        self.insert_locked(&mut ring, local, now);
    }

    /// Drop every fingerprint older than the retention window.
    /// Returns the number of keys removed.
    pub fn evict(&self, now: Instant) -> usize {
        let mut ring = self.ring.lock();
        Self::evict_locked(&mut ring, now, self.config.retention)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.seen.clear();
        ring.order.clear();
    }

    fn insert_locked(&self, ring: &mut Ring, key: String, now: Instant) {
        ring.seen.insert(key.clone(), now);
        ring.order.push_back((key, now));

        while ring.seen.len() > self.config.capacity
            || ring.order.len() > self.config.capacity * 2
        {
            if !ring.pop_oldest() {
                break;
            }
        }
    }

    fn evict_locked(ring: &mut Ring, now: Instant, retention: Duration) -> usize {
        let before = ring.seen.len();
        while let Some((_, at)) = ring.order.front() {
            if now.saturating_duration_since(*at) < retention {
                break;
            }
            ring.pop_oldest();
        }
        let removed = before - ring.seen.len();
        if removed > 0 {
            tracing::trace!(removed, retained = ring.seen.len(), "Evicted fingerprints");
        }
        removed
    }
}

impl Default for EventDeduper {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChangeKind;

    const JOBS: &str = "jobs|UPDATE|";

    fn fp(id: &str, ts: &str) -> EventFingerprint {
        EventFingerprint::new("jobs", ChangeKind::Update, id, ts)
    }

    #[test]
    fn test_duplicate_within_window_is_dropped() {
        let deduper = EventDeduper::default();
        let now = Instant::now();

        assert!(deduper.should_process_at(JOBS, &fp("42", "T1"), now));
        assert!(!deduper.should_process_at(JOBS, &fp("42", "T1"), now + Duration::from_secs(9)));
        assert!(deduper.should_process_at(JOBS, &fp("42", "T2"), now));
    }

    #[test]
    fn test_same_event_eleven_seconds_apart_passes() {
        let deduper = EventDeduper::default();
        let now = Instant::now();

        assert!(deduper.should_process_at(JOBS, &fp("42", "T1"), now));
        assert!(deduper.should_process_at(JOBS, &fp("42", "T1"), now + Duration::from_secs(11)));
    }

    #[test]
    fn test_recorded_local_event_suppresses_echo() {
        let deduper = EventDeduper::default();
        let now = Instant::now();

        deduper.record_at(&fp("7", "T3"), now);
        assert!(!deduper.should_process_at(JOBS, &fp("7", "T3"), now + Duration::from_millis(200)));
        assert!(!deduper.should_process_at("jobs|*|", &fp("7", "T3"), now + Duration::from_millis(300)));
    }

    #[test]
    fn test_scopes_are_independent() {
        let deduper = EventDeduper::default();
        let now = Instant::now();

        assert!(deduper.should_process_at(JOBS, &fp("42", "T1"), now));
        assert!(deduper.should_process_at("jobs|*|", &fp("42", "T1"), now));
        assert!(!deduper.should_process_at(JOBS, &fp("42", "T1"), now + Duration::from_secs(1)));
        assert!(!deduper.should_process_at("jobs|*|", &fp("42", "T1"), now + Duration::from_secs(1)));
    }

    #[test]
    fn test_evict_removes_only_expired() {
        let deduper = EventDeduper::default();
        let now = Instant::now();

        deduper.should_process_at(JOBS, &fp("1", "T1"), now);
        deduper.should_process_at(JOBS, &fp("2", "T1"), now + Duration::from_secs(5));
        assert_eq!(deduper.len(), 2);

        assert_eq!(deduper.evict(now + Duration::from_secs(12)), 1);
        assert_eq!(deduper.len(), 1);
        assert_eq!(deduper.evict(now + Duration::from_secs(16)), 1);
        assert!(deduper.is_empty());
    }

    #[test]
    fn test_refreshed_key_survives_stale_ring_entry() {
        let deduper = EventDeduper::default();
        let now = Instant::now();

        deduper.should_process_at(JOBS, &fp("1", "T1"), now);
        deduper.should_process_at(JOBS, &fp("1", "T1"), now + Duration::from_secs(8));

        // The first ring entry expires but the key was refreshed at +8s
        deduper.evict(now + Duration::from_secs(11));
        assert_eq!(deduper.len(), 1);
        assert!(!deduper.should_process_at(JOBS, &fp("1", "T1"), now + Duration::from_secs(12)));
    }

    #[test]
    fn test_ring_never_exceeds_capacity() {
        let deduper = EventDeduper::new(DedupConfig {
            capacity: 50,
            prune_threshold: 10,
            ..Default::default()
        });
        let now = Instant::now();

        for i in 0..1_000 {
            deduper.should_process_at(JOBS, &fp(&i.to_string(), "T"), now);
        }
        assert!(deduper.len() <= 50);
    }

    #[test]
    fn test_capacity_evicts_inside_retention_window() {
        let deduper = EventDeduper::new(DedupConfig {
            capacity: 2,
            ..Default::default()
        });
        let now = Instant::now();

        for id in ["1", "2", "3"] {
            assert!(deduper.should_process_at(JOBS, &fp(id, "T"), now));
        }
        assert_eq!(deduper.len(), 2);
        // "1" was pushed out a second after it was seen
        assert!(deduper.should_process_at(JOBS, &fp("1", "T"), now + Duration::from_secs(1)));
        assert!(!deduper.should_process_at(JOBS, &fp("1", "T"), now + Duration::from_secs(1)));
    }

    #[test]
    fn test_opportunistic_prune_past_threshold() {
        let deduper = EventDeduper::new(DedupConfig {
            prune_threshold: 3,
            ..Default::default()
        });
        let now = Instant::now();

        for i in 0..4 {
            deduper.should_process_at(JOBS, &fp(&i.to_string(), "T"), now);
        }
        assert_eq!(deduper.len(), 4);

        deduper.should_process_at(JOBS, &fp("late", "T"), now + Duration::from_secs(30));
        assert_eq!(deduper.len(), 1);
    }
}
