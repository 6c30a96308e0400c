//! The authoritative store of keys, per-key failure
//! counters, and per-(key, model) cooldown deadlines. Grounded on the
//! round-robin-with-cooldown shape of an auth-key rotator, generalized
//! here with a failure ceiling, per-model cooldowns, and a best-effort
//! ring scan instead of a single global cooldown window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;

use keygate_domain::clock::{next_daily_reset, Clock};

use crate::cursor::RotationCursor;
use crate::key::Key;

/// Per-key failure counters, keyed by key. Guarded independently from the
/// cooldown map so a burst of cooldown reads never blocks a failure write.
type FailCounts = HashMap<Key, u32>;
/// Per-(key, model) cooldown deadlines.
type CooldownMap = HashMap<Key, HashMap<String, DateTime<Utc>>>;

/// Snapshot of registry health for admin/observability.
#[derive(Debug, Clone, Default)]
pub struct KeyStatusSnapshot {
    pub valid: HashMap<Key, u32>,
    pub invalid: HashMap<Key, u32>,
}

pub struct KeyRegistry {
    /// Insertion order, stable across reads; never reordered.
    keys: Vec<Key>,
    fail_count: Mutex<FailCounts>,
    cooldown: RwLock<CooldownMap>,
    cursor: RotationCursor,
    max_failures: u32,
    clock: Arc<dyn Clock>,
    tz: chrono_tz::Tz,
    quota_reset_hour: u32,
}

impl KeyRegistry {
    pub fn new(
        keys: Vec<Key>,
        max_failures: u32,
        clock: Arc<dyn Clock>,
        tz: chrono_tz::Tz,
        quota_reset_hour: u32,
    ) -> Self {
        if keys.is_empty() {
            tracing::warn!(
                "KeyRegistry initialized with zero keys; getNextWorking will return None \
                 until keys are configured"
            );
        }
        Self {
            keys,
            fail_count: Mutex::new(HashMap::new()),
            cooldown: RwLock::new(HashMap::new()),
            cursor: RotationCursor::new(),
            max_failures,
            clock,
            tz,
            quota_reset_hour,
        }
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Advance the cursor and return the key at the new position. Constant
    /// time; does not check validity.
    pub fn next_raw(&self) -> Option<Key> {
        if self.keys.is_empty() {
            return None;
        }
        let pos = self.cursor.advance(self.keys.len());
        Some(self.keys[pos].clone())
    }

    /// A key is valid while its failure count stays under the ceiling. Keys
    /// not yet seen default to 0.
    pub fn is_valid(&self, k: &Key) -> bool {
        let counts = self.fail_count.lock();
        counts.get(k).copied().unwrap_or(0) < self.max_failures
    }

    /// Generally-valid AND no live cooldown for `model`.
    pub fn is_model_available(&self, k: &Key, model: &str) -> bool {
        if !self.is_valid(k) {
            return false;
        }
        let now = self.clock.now();
        let cooldown = self.cooldown.read();
        match cooldown.get(k).and_then(|per_model| per_model.get(model)) {
            Some(deadline) => now >= *deadline,
            None => true,
        }
    }

    /// Fatal errors: auth, permanent client/server errors. Sets the
    /// counter straight to the ceiling.
    pub fn mark_failed(&self, k: &Key) {
        let mut counts = self.fail_count.lock();
        counts.insert(k.clone(), self.max_failures);
        tracing::warn!(key = %k.redacted(), "key marked failed (ceiling reached)");
    }

    /// Increments the failure counter, clamped to the ceiling. Emits a
    /// warning the moment it reaches the ceiling (not on every call after).
    pub fn increment_failure(&self, k: &Key) {
        let mut counts = self.fail_count.lock();
        let entry = counts.entry(k.clone()).or_insert(0);
        let was_below = *entry < self.max_failures;
        *entry = (*entry + 1).min(self.max_failures);
        if was_below && *entry == self.max_failures {
            tracing::warn!(
                key = %k.redacted(),
                max_failures = self.max_failures,
                "key reached failure ceiling"
            );
        }
    }

    /// Resets the counter to 0. Returns whether the key is known to the
    /// registry (it resets the entry either way, but callers use the bool
    /// to distinguish "reset a real key" from "no-op on an unknown one").
    pub fn reset_failure(&self, k: &Key) -> bool {
        let exists = self.keys.contains(k);
        let mut counts = self.fail_count.lock();
        counts.insert(k.clone(), 0);
        exists
    }

    /// Computes the next quota-reset instant and stores it as the cooldown
    /// deadline for `(k, model)`. Returns the deadline so callers (e.g. the
    /// error classifier's log record) can report it.
    pub fn mark_model_cooling(&self, k: &Key, model: &str) -> DateTime<Utc> {
        let deadline = next_daily_reset(self.clock.now(), self.tz, self.quota_reset_hour);
        let mut cooldown = self.cooldown.write();
        cooldown
            .entry(k.clone())
            .or_insert_with(HashMap::new)
            .insert(model.to_string(), deadline);
        deadline
    }

    /// Scans at most `len + 1` positions from the cursor, skipping keys
    /// that aren't generally-valid (and, if `model` is given, those
    /// currently cooling for it). Returns the first that passes, advancing
    /// the cursor as it goes. If every position is skipped, returns the
    /// last candidate examined — best-effort; the caller's upstream call
    /// will then fail and cascade back through the error classifier.
    /// `None` only when the registry holds zero keys.
    pub fn get_next_working(&self, model: Option<&str>) -> Option<Key> {
        if self.keys.is_empty() {
            return None;
        }
        let len = self.keys.len();
        let mut last_candidate = None;
        for _ in 0..=len {
            let candidate = self.next_raw().expect("non-empty keys checked above");
            let passes = match model {
                Some(m) => self.is_model_available(&candidate, m),
                None => self.is_valid(&candidate),
            };
            if passes {
                return Some(candidate);
            }
            last_candidate = Some(candidate);
        }
        last_candidate
    }

    /// Unknown-category handler: increments the failure counter; if there's
    /// retry budget left, substitutes in the next working key, else signals
    /// exhaustion with `None`.
    pub fn handle_api_failure(
        &self,
        k: &Key,
        attempt_index: u32,
        max_retries: u32,
        model: Option<&str>,
    ) -> Option<Key> {
        self.increment_failure(k);
        if attempt_index < max_retries {
            self.get_next_working(model)
        } else {
            None
        }
    }

    /// First generally-valid key in insertion order.
    pub fn first_valid(&self) -> Option<Key> {
        self.keys.iter().find(|k| self.is_valid(k)).cloned()
    }

    /// Uniformly random generally-valid key.
    pub fn random_valid(&self) -> Option<Key> {
        let valid: Vec<&Key> = self.keys.iter().filter(|k| self.is_valid(k)).collect();
        valid.choose(&mut rand::thread_rng()).map(|k| (*k).clone())
    }

    /// All generally-valid keys, for pool refill candidate selection.
    pub fn valid_keys(&self) -> Vec<Key> {
        self.keys.iter().filter(|k| self.is_valid(k)).cloned().collect()
    }

    pub fn snapshot_by_status(&self) -> KeyStatusSnapshot {
        let counts = self.fail_count.lock();
        let mut snapshot = KeyStatusSnapshot::default();
        for k in &self.keys {
            let n = counts.get(k).copied().unwrap_or(0);
            if n < self.max_failures {
                snapshot.valid.insert(k.clone(), n);
            } else {
                snapshot.invalid.insert(k.clone(), n);
            }
        }
        snapshot
    }

    /// Snapshot used by the hot-reload lifecycle: failure counters
    /// and the key the cursor would hand out next.
    pub fn fail_counts_snapshot(&self) -> HashMap<Key, u32> {
        self.fail_count.lock().clone()
    }

    pub fn next_key_preview(&self) -> Option<Key> {
        if self.keys.is_empty() {
            return None;
        }
        let pos = self.cursor.peek_next(self.keys.len());
        Some(self.keys[pos].clone())
    }

    /// Re-seed failure counters (used only by the lifecycle migration path;
    /// production code should never call this outside of hot-reload).
    pub(crate) fn seed_fail_counts(&self, seed: HashMap<Key, u32>) {
        *self.fail_count.lock() = seed;
    }

    /// Advance the cursor until `target` would be the next key returned, or
    /// leave it at 0 if `target` isn't in this registry's key list.
    pub(crate) fn seed_cursor_to(&self, target: &Key) {
        if let Some(idx) = self.keys.iter().position(|k| k == target) {
            // `advance` returns the *new* position, so land one before.
            let len = self.keys.len();
            self.cursor.set((idx + len - 1) % len);
        } else {
            self.cursor.set(self.keys.len().saturating_sub(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_domain::clock::SystemClock;

    fn registry(keys: &[&str], max_failures: u32) -> KeyRegistry {
        KeyRegistry::new(
            keys.iter().map(|s| Key::new(*s)).collect(),
            max_failures,
            Arc::new(SystemClock),
            chrono_tz::UTC,
            0,
        )
    }

    #[test]
    fn next_raw_cycles_in_insertion_order() {
        let r = registry(&["a", "b", "c"], 3);
        let seq: Vec<String> = (0..6)
            .map(|_| r.next_raw().unwrap().as_str().to_string())
            .collect();
        assert_eq!(seq, vec!["b", "c", "a", "b", "c", "a"]);
    }

    #[test]
    fn mark_failed_makes_key_invalid() {
        let r = registry(&["a", "b"], 3);
        let a = Key::new("a");
        assert!(r.is_valid(&a));
        r.mark_failed(&a);
        assert!(!r.is_valid(&a));
    }

    #[test]
    fn reset_after_mark_failed_restores_validity() {
        let r = registry(&["a"], 3);
        let a = Key::new("a");
        r.mark_failed(&a);
        assert!(r.reset_failure(&a));
        assert!(r.is_valid(&a));
    }

    #[test]
    fn increment_failure_reaches_ceiling() {
        let r = registry(&["a"], 3);
        let a = Key::new("a");
        r.increment_failure(&a);
        r.increment_failure(&a);
        assert!(r.is_valid(&a));
        r.increment_failure(&a);
        assert!(!r.is_valid(&a));
    }

    #[test]
    fn increment_failure_clamps_at_ceiling() {
        let r = registry(&["a"], 2);
        let a = Key::new("a");
        for _ in 0..10 {
            r.increment_failure(&a);
        }
        assert_eq!(r.fail_counts_snapshot().get(&a).copied(), Some(2));
    }

    #[test]
    fn get_next_working_skips_invalid_key() {
        let r = registry(&["a", "b", "c"], 1);
        let b = Key::new("b");
        r.mark_failed(&b);
        // First advance lands on "b" (skipped, invalid), then "c".
        assert_eq!(r.get_next_working(None).unwrap().as_str(), "c");
        // Next call continues from the cursor: "a".
        assert_eq!(r.get_next_working(None).unwrap().as_str(), "a");
    }

    #[test]
    fn get_next_working_falls_back_to_last_candidate_when_all_fail() {
        let r = registry(&["a", "b"], 1);
        r.mark_failed(&Key::new("a"));
        r.mark_failed(&Key::new("b"));
        // Best-effort: still returns *something*, not None.
        assert!(r.get_next_working(None).is_some());
    }

    #[test]
    fn empty_registry_returns_none() {
        let r = registry(&[], 3);
        assert!(r.get_next_working(None).is_none());
        assert!(r.next_raw().is_none());
    }

    #[test]
    fn model_cooldown_blocks_until_deadline() {
        let r = registry(&["a"], 3);
        let a = Key::new("a");
        assert!(r.is_model_available(&a, "gemini-x"));
        r.mark_model_cooling(&a, "gemini-x");
        assert!(!r.is_model_available(&a, "gemini-x"));
        // Unrelated model is unaffected.
        assert!(r.is_model_available(&a, "other-model"));
    }

    #[test]
    fn handle_api_failure_switches_key_within_budget() {
        let r = registry(&["a", "b"], 3);
        let a = Key::new("a");
        let next = r.handle_api_failure(&a, 0, 3, None);
        assert!(next.is_some());
        assert_eq!(r.fail_counts_snapshot().get(&a).copied(), Some(1));
    }

    #[test]
    fn handle_api_failure_exhausted_returns_none() {
        let r = registry(&["a", "b"], 3);
        let a = Key::new("a");
        assert!(r.handle_api_failure(&a, 3, 3, None).is_none());
    }
}
