//! A bounded, TTL'd ready-queue of keys already
//! observed to be working, so most callers skip a live verification round
//! trip entirely. Replenishment runs in the background; a pool miss falls
//! through to a synchronous, concurrent emergency refill.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::Mutex as AsyncMutex;

use keygate_domain::clock::Clock;
use keygate_domain::{Error, Result};

use crate::classifier::ErrorClassifier;
use crate::key::Key;
use crate::registry::KeyRegistry;
use crate::upstream::{ChatRequest, ErrorLogSink, UpstreamChatService};

/// A key already observed to be working, with the wall-clock window it's
/// trusted for.
#[derive(Debug, Clone)]
pub struct ValidKeyEntry {
    pub key: Key,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ValidKeyEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    refills_scheduled: AtomicU64,
    expired_evictions: AtomicU64,
    verification_success: AtomicU64,
    verification_failure: AtomicU64,
}

/// Read-only snapshot of pool health for observability endpoints.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub pool_size: usize,
    pub current_size: usize,
    pub utilization: f64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub refills_scheduled: u64,
    pub expired_evictions: u64,
    pub verification_success: u64,
    pub verification_failure: u64,
    pub verification_success_rate: f64,
    pub avg_key_age_seconds: f64,
}

pub struct ValidKeyPoolConfig {
    pub pool_size: usize,
    pub ttl: Duration,
    pub min_threshold: usize,
    pub emergency_refill_count: usize,
    pub test_model: String,
    pub verification_timeout: StdDuration,
}

pub struct ValidKeyPool {
    queue: Mutex<VecDeque<ValidKeyEntry>>,
    config: ValidKeyPoolConfig,
    counters: PoolCounters,
    /// Single-holder gate for normal and async-emergency refills (prevents
    /// two verifiers racing into the same last slot of the queue).
    verification_lock: AsyncMutex<()>,
    /// Separate from `verification_lock` because synchronous emergency
    /// refill runs on the hot path (a `getValid` miss) and must not block
    /// on a slow background verification.
    emergency_lock: AsyncMutex<()>,
    registry: Arc<KeyRegistry>,
    upstream: Arc<dyn UpstreamChatService>,
    log: Arc<dyn ErrorLogSink>,
    clock: Arc<dyn Clock>,
}

impl ValidKeyPool {
    pub fn new(
        config: ValidKeyPoolConfig,
        registry: Arc<KeyRegistry>,
        upstream: Arc<dyn UpstreamChatService>,
        log: Arc<dyn ErrorLogSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(config.pool_size)),
            config,
            counters: PoolCounters::default(),
            verification_lock: AsyncMutex::new(()),
            emergency_lock: AsyncMutex::new(()),
            registry,
            upstream,
            log,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Snapshot the live entries (used by hot-reload to re-seed a new
    /// pool instance during hot-reload).
    pub fn snapshot_entries(&self) -> Vec<ValidKeyEntry> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Re-insert preserved entries. Used only during hot-reload migration.
    pub(crate) fn seed_entries(&self, entries: Vec<ValidKeyEntry>) {
        let mut queue = self.queue.lock();
        for entry in entries {
            if queue.len() >= self.config.pool_size {
                break;
            }
            if !queue.iter().any(|e| e.key == entry.key) {
                queue.push_back(entry);
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let current_size = self.len();
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let vsucc = self.counters.verification_success.load(Ordering::Relaxed);
        let vfail = self.counters.verification_failure.load(Ordering::Relaxed);
        let vtotal = vsucc + vfail;

        let now = self.clock.now();
        let avg_age = {
            let queue = self.queue.lock();
            if queue.is_empty() {
                0.0
            } else {
                let total_secs: i64 = queue
                    .iter()
                    .map(|e| (now - e.created_at).num_seconds())
                    .sum();
                total_secs as f64 / queue.len() as f64
            }
        };

        PoolStats {
            pool_size: self.config.pool_size,
            current_size,
            utilization: current_size as f64 / self.config.pool_size.max(1) as f64,
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            refills_scheduled: self.counters.refills_scheduled.load(Ordering::Relaxed),
            expired_evictions: self.counters.expired_evictions.load(Ordering::Relaxed),
            verification_success: vsucc,
            verification_failure: vfail,
            verification_success_rate: if vtotal == 0 { 0.0 } else { vsucc as f64 / vtotal as f64 },
            avg_key_age_seconds: avg_age,
        }
    }

    // ── Public API ──────────────────────────────────────────────────

    /// Pops a live entry from the head, evicting expired ones as it goes.
    /// On a hit, schedules background refill per the size-dependent policy
    /// table. On a miss, falls through to a synchronous emergency refill.
    pub async fn get_valid(self: &Arc<Self>, model: Option<&str>) -> Result<Key> {
        let now = self.clock.now();
        let mut found = None;
        loop {
            let popped = self.queue.lock().pop_front();
            match popped {
                Some(entry) if entry.is_expired(now) => {
                    self.counters.expired_evictions.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Some(entry) => {
                    found = Some(entry);
                    break;
                }
                None => break,
            }
        }

        match found {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                let size_after = self.len();
                self.schedule_refill(size_after);
                Ok(entry.key)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.emergency_refill(model).await
            }
        }
    }

    /// Size-dependent refill policy. Spawns background tasks;
    /// never awaits them.
    fn schedule_refill(self: &Arc<Self>, size_after: usize) {
        let pool_size = self.config.pool_size as f64;
        let min_threshold = self.config.min_threshold as f64;
        let s = size_after as f64;

        enum Action {
            None,
            Emergency,
            TwoVerify,
            OneVerify(f64),
        }

        let action = if s < min_threshold / 2.0 {
            Action::Emergency
        } else if s < min_threshold {
            Action::TwoVerify
        } else if s < pool_size * 0.8 && s < min_threshold * 1.5 {
            Action::TwoVerify
        } else if s < pool_size * 0.8 && s < min_threshold * 2.0 {
            Action::OneVerify(1.0)
        } else if s < pool_size * 0.8 && s < min_threshold * 2.5 {
            Action::OneVerify(0.8)
        } else if s < pool_size * 0.8 {
            Action::OneVerify(0.3)
        } else if s < pool_size {
            Action::OneVerify(0.1)
        } else {
            Action::None
        };

        let roll = || rand::random::<f64>();
        match action {
            Action::None => {}
            Action::Emergency => {
                self.counters.refills_scheduled.fetch_add(1, Ordering::Relaxed);
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.emergency_refill_async().await;
                });
            }
            Action::TwoVerify => {
                self.counters.refills_scheduled.fetch_add(2, Ordering::Relaxed);
                for _ in 0..2 {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.async_verify_and_add().await;
                    });
                }
            }
            Action::OneVerify(p) => {
                if p >= 1.0 || roll() < p {
                    self.counters.refills_scheduled.fetch_add(1, Ordering::Relaxed);
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.async_verify_and_add().await;
                    });
                }
            }
        }
    }

    /// Normal single-key refill. Guarded by `verification_lock`; a
    /// concurrent holder means this call is a no-op (already being
    /// refilled).
    pub async fn async_verify_and_add(self: &Arc<Self>) {
        let _guard = match self.verification_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        if self.len() >= self.config.pool_size {
            return;
        }

        let candidate = {
            let in_pool: Vec<Key> = self.queue.lock().iter().map(|e| e.key.clone()).collect();
            let mut pool_candidates: Vec<Key> = self
                .registry
                .valid_keys()
                .into_iter()
                .filter(|k| !in_pool.contains(k))
                .collect();
            pool_candidates.shuffle(&mut rand::thread_rng());
            pool_candidates.into_iter().next()
        };

        let Some(key) = candidate else { return };

        if self.verify(&key).await {
            let mut queue = self.queue.lock();
            if queue.len() < self.config.pool_size && !queue.iter().any(|e| e.key == key) {
                queue.push_back(self.new_entry(key));
            }
        }
    }

    /// Synchronous concurrent emergency refill on a pool miss. Returns the
    /// first successfully-verified key, or falls back to
    /// `KeyRegistry::get_next_working` if every attempt fails.
    pub async fn emergency_refill(self: &Arc<Self>, model: Option<&str>) -> Result<Key> {
        let _guard = self.emergency_lock.lock().await;

        let candidates = self.pick_emergency_candidates();
        let results = join_all(candidates.iter().map(|k| self.verify_emergency_simple(k))).await;

        let mut first_success = None;
        for (key, ok) in candidates.into_iter().zip(results) {
            if ok {
                let mut queue = self.queue.lock();
                if queue.len() < self.config.pool_size && !queue.iter().any(|e| e.key == key) {
                    queue.push_back(self.new_entry(key.clone()));
                }
                drop(queue);
                if first_success.is_none() {
                    first_success = Some(key);
                }
            }
        }

        match first_success {
            Some(key) => Ok(key),
            None => self
                .registry
                .get_next_working(model)
                .ok_or(Error::NoKeyAvailable),
        }
    }

    /// Side-effect-only variant scheduled from `get_valid`'s hit path.
    /// Guarded by `verification_lock` (not `emergency_lock`) to interlock
    /// with normal background refill.
    pub async fn emergency_refill_async(self: &Arc<Self>) {
        let _guard = match self.verification_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let candidates = self.pick_emergency_candidates();
        let results = join_all(candidates.iter().map(|k| self.verify_emergency_simple(k))).await;
        for (key, ok) in candidates.into_iter().zip(results) {
            if ok {
                let mut queue = self.queue.lock();
                if queue.len() < self.config.pool_size && !queue.iter().any(|e| e.key == key) {
                    queue.push_back(self.new_entry(key));
                }
            }
        }
    }

    fn pick_emergency_candidates(&self) -> Vec<Key> {
        let in_pool: Vec<Key> = self.queue.lock().iter().map(|e| e.key.clone()).collect();
        let mut available: Vec<Key> = self
            .registry
            .valid_keys()
            .into_iter()
            .filter(|k| !in_pool.contains(k))
            .collect();
        available.shuffle(&mut rand::thread_rng());
        let n = self.config.emergency_refill_count.min(available.len());
        available.into_iter().take(n).collect()
    }

    /// Periodic maintenance: evict expired entries, top up toward
    /// capacity, then spot-check a sample of resident keys.
    pub async fn maintenance(self: &Arc<Self>) {
        self.evict_expired();

        if self.len() < self.config.pool_size {
            let target_adds = 10usize.min(self.config.pool_size - self.len());
            let max_attempts = target_adds * 2;
            let mut added = 0;
            let mut attempts = 0;
            while added < target_adds && attempts < max_attempts && self.len() < self.config.pool_size {
                let before = self.len();
                self.async_verify_and_add().await;
                if self.len() > before {
                    added += 1;
                }
                attempts += 1;
                tokio::time::sleep(StdDuration::from_millis(100)).await;
            }
        }

        self.validate_pool_keys().await;
    }

    fn evict_expired(&self) {
        let now = self.clock.now();
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|e| !e.is_expired(now));
        let evicted = before - queue.len();
        if evicted > 0 {
            self.counters
                .expired_evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    /// Samples up to 5 resident keys, re-verifies them, evicts failures.
    async fn validate_pool_keys(self: &Arc<Self>) {
        let sample: Vec<Key> = {
            let queue = self.queue.lock();
            let mut keys: Vec<Key> = queue.iter().map(|e| e.key.clone()).collect();
            keys.shuffle(&mut rand::thread_rng());
            keys.truncate(5);
            keys
        };

        for key in sample {
            if !self.verify(&key).await {
                self.queue.lock().retain(|e| e.key != key);
            }
        }
    }

    /// Batch-verifies keys concurrently (10 at a time) until the pool
    /// reaches `target_size` (defaults to half capacity) or candidates
    /// run out.
    pub async fn preload(self: &Arc<Self>, target_size: Option<usize>) {
        let target = target_size.unwrap_or(self.config.pool_size / 2);
        loop {
            if self.len() >= target {
                return;
            }
            let in_pool: Vec<Key> = self.queue.lock().iter().map(|e| e.key.clone()).collect();
            let mut candidates: Vec<Key> = self
                .registry
                .valid_keys()
                .into_iter()
                .filter(|k| !in_pool.contains(k))
                .collect();
            if candidates.is_empty() {
                return;
            }
            candidates.truncate(10);

            let results = join_all(candidates.iter().map(|k| self.verify(k))).await;
            for (key, ok) in candidates.into_iter().zip(results) {
                if ok {
                    let mut queue = self.queue.lock();
                    if queue.len() < self.config.pool_size && !queue.iter().any(|e| e.key == key) {
                        queue.push_back(self.new_entry(key));
                    }
                }
            }
        }
    }

    fn new_entry(&self, key: Key) -> ValidKeyEntry {
        let created_at = self.clock.now();
        ValidKeyEntry {
            key,
            created_at,
            expires_at: created_at + self.config.ttl,
        }
    }

    /// Verification primitive: a minimal "hi" request against the
    /// configured test model. Success resets the key's failure counter;
    /// failure routes the exception through the error classifier (so a
    /// verification failure can cool or fail the key exactly like a real
    /// request would). A timeout elapsing counts as a failure; a task
    /// abort (cancellation) simply stops this future before either branch
    /// runs, so it is never counted either way.
    async fn verify(&self, key: &Key) -> bool {
        let request = ChatRequest {
            model: self.config.test_model.clone(),
            prompt: "hi".to_string(),
        };
        let outcome = tokio::time::timeout(
            self.config.verification_timeout,
            self.upstream.generate(&self.config.test_model, &request, key),
        )
        .await;

        match outcome {
            Ok(Ok(_)) => {
                self.registry.reset_failure(key);
                self.counters.verification_success.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(e)) => {
                let classifier = ErrorClassifier::new(&self.registry, self.log.as_ref(), 0);
                classifier.apply(&e.to_string(), key, Some(&self.config.test_model), 0);
                self.counters.verification_failure.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(_elapsed) => {
                let classifier = ErrorClassifier::new(&self.registry, self.log.as_ref(), 0);
                classifier.apply("status code 408 verification timeout", key, Some(&self.config.test_model), 0);
                self.counters.verification_failure.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Simplified verification for the emergency path: does *not* invoke
    /// the error classifier on failure, to avoid a re-entrant classify
    /// loop while mass-verifying during an outage. Local bookkeeping only.
    async fn verify_emergency_simple(&self, key: &Key) -> bool {
        let request = ChatRequest {
            model: self.config.test_model.clone(),
            prompt: "hi".to_string(),
        };
        let outcome = tokio::time::timeout(
            self.config.verification_timeout,
            self.upstream.generate(&self.config.test_model, &request, key),
        )
        .await;

        match outcome {
            Ok(Ok(_)) => {
                self.registry.reset_failure(key);
                self.counters.verification_success.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => {
                self.counters.verification_failure.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}
