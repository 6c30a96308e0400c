//! Ties the registry, pool, and verifier together into one long-lived
//! instance, and supports hot-reloading the key list (picking up an edited
//! key file or config push) without losing in-flight rotation state,
//! cooldowns, or a warm pool.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use keygate_domain::clock::{parse_tz, Clock};
use keygate_domain::config::Config;
use keygate_domain::{Error, Result};

use crate::key::Key;
use crate::pool::{ValidKeyPool, ValidKeyPoolConfig};
use crate::registry::KeyRegistry;
use crate::upstream::{ErrorLogSink, UpstreamChatService};
use crate::verifier::{ScheduledVerifier, VerifierConfig};

struct LiveState {
    registry: Arc<KeyRegistry>,
    pool: Arc<ValidKeyPool>,
    verifier: Arc<ScheduledVerifier>,
    pool_enabled: bool,
    maintenance_task: Option<JoinHandle<()>>,
    verifier_task: Option<JoinHandle<()>>,
}

impl Drop for LiveState {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance_task.take() {
            task.abort();
        }
        if let Some(task) = self.verifier_task.take() {
            task.abort();
        }
    }
}

/// The single process-wide handle to the key lifecycle subsystem. Wraps the
/// registry/pool/verifier triple behind a lock so `reload` can swap all
/// three atomically while request handlers keep a cheap `Arc` clone of
/// whichever generation was current when they started.
pub struct KeyLifecycle {
    state: RwLock<Arc<LiveState>>,
    upstream: Arc<dyn UpstreamChatService>,
    log: Arc<dyn ErrorLogSink>,
    clock: Arc<dyn Clock>,
}

/// A read-only handle into one generation of the lifecycle, returned by
/// [`KeyLifecycle::current`]. Holding onto one keeps that generation's
/// registry/pool/verifier alive even across a concurrent `reload`.
pub struct Generation {
    pub registry: Arc<KeyRegistry>,
    pub pool: Arc<ValidKeyPool>,
    pub verifier: Arc<ScheduledVerifier>,
    pool_enabled: bool,
}

impl Generation {
    /// The single entry point callers use to get a usable key. When the
    /// pool is enabled this goes through the TTL'd ready-pool (and its
    /// emergency-refill path on a miss); when disabled it delegates
    /// straight to the registry's ring scan, per `VALID_KEY_POOL_ENABLED`.
    pub async fn get_key(&self, model: Option<&str>) -> Result<Key> {
        if self.pool_enabled {
            self.pool.get_valid(model).await
        } else {
            self.registry.get_next_working(model).ok_or(Error::NoKeyAvailable)
        }
    }
}

impl KeyLifecycle {
    pub fn new(
        keys: Vec<Key>,
        config: &Config,
        upstream: Arc<dyn UpstreamChatService>,
        log: Arc<dyn ErrorLogSink>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let state = build_state(keys, config, &upstream, &log, &clock);
        Arc::new(Self {
            state: RwLock::new(Arc::new(state)),
            upstream,
            log,
            clock,
        })
    }

    /// The current generation. Cheap: an `Arc` clone under a read lock.
    pub fn current(&self) -> Generation {
        let state = self.state.read();
        Generation {
            registry: Arc::clone(&state.registry),
            pool: Arc::clone(&state.pool),
            verifier: Arc::clone(&state.verifier),
            pool_enabled: state.pool_enabled,
        }
    }

    /// Replaces the key list (and any tuning that changed in `config`),
    /// carrying over everything about the old generation that's still
    /// meaningful: failure counters and model cooldowns for keys present in
    /// both lists, the rotation cursor's next-key position (if that key
    /// survived), and whichever pool entries are still for valid keys.
    /// Keys absent from the new list are simply dropped; keys new to the
    /// list start with a clean slate, exactly as they would at first boot.
    pub fn reload(&self, new_keys: Vec<Key>, config: &Config) {
        let old = self.state.read().clone();

        let old_fail_counts = old.registry.fail_counts_snapshot();
        let preview_key = old.registry.next_key_preview();
        let old_pool_entries = old.pool.snapshot_entries();

        let mut new_state = build_state(new_keys, config, &self.upstream, &self.log, &self.clock);

        let carried_counts = old_fail_counts
            .into_iter()
            .filter(|(k, _)| new_state.registry.keys().contains(k))
            .collect();
        new_state.registry.seed_fail_counts(carried_counts);

        if let Some(ref target) = preview_key {
            if new_state.registry.keys().contains(target) {
                new_state.registry.seed_cursor_to(target);
            }
        }

        let carried_entries = old_pool_entries
            .into_iter()
            .filter(|e| new_state.registry.is_valid(&e.key))
            .collect();
        new_state.pool.seed_entries(carried_entries);

        *self.state.write() = Arc::new(new_state);
        // `old` (and its task handles) drops here, aborting the previous
        // generation's background work.
    }
}

fn build_state(
    keys: Vec<Key>,
    config: &Config,
    upstream: &Arc<dyn UpstreamChatService>,
    log: &Arc<dyn ErrorLogSink>,
    clock: &Arc<dyn Clock>,
) -> LiveState {
    let tz = parse_tz(&config.verifier.timezone);
    let registry = Arc::new(KeyRegistry::new(
        keys,
        config.keys.max_failures,
        Arc::clone(clock),
        tz,
        config.verifier.quota_reset_hour,
    ));

    let pool = Arc::new(ValidKeyPool::new(
        ValidKeyPoolConfig {
            pool_size: config.pool.pool_size,
            ttl: chrono::Duration::hours(config.pool.key_ttl_hours),
            min_threshold: config.pool.min_threshold,
            emergency_refill_count: config.pool.emergency_refill_count,
            test_model: config.verifier.test_model.clone(),
            verification_timeout: StdDuration::from_millis(config.upstream.verification_timeout_ms),
        },
        Arc::clone(&registry),
        Arc::clone(upstream),
        Arc::clone(log),
        Arc::clone(clock),
    ));

    let verifier = Arc::new(ScheduledVerifier::new(
        VerifierConfig {
            batch_size: config.verifier.batch_size,
            sweep_interval: StdDuration::from_secs_f64(config.verifier.check_interval_hours * 3600.0),
            test_model: config.verifier.test_model.clone(),
            verification_timeout: StdDuration::from_millis(config.upstream.verification_timeout_ms),
        },
        Arc::clone(&registry),
        Arc::clone(upstream),
        Arc::clone(log),
    ));

    let maintenance_task = if config.pool.enabled {
        let pool_for_task = Arc::clone(&pool);
        let interval = StdDuration::from_secs(config.pool.maintenance_interval_minutes.max(1) * 60);
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                pool_for_task.maintenance().await;
            }
        }))
    } else {
        None
    };

    let verifier_task = {
        let verifier_for_task = Arc::clone(&verifier);
        Some(tokio::spawn(async move {
            verifier_for_task.run_forever().await;
        }))
    };

    LiveState {
        registry,
        pool,
        verifier,
        pool_enabled: config.pool.enabled,
        maintenance_task,
        verifier_task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{ChatRequest, ChatResponse, NullLogSink};
    use async_trait::async_trait;
    use keygate_domain::clock::FakeClock;
    use keygate_domain::Result;

    struct AlwaysOkUpstream;

    #[async_trait]
    impl UpstreamChatService for AlwaysOkUpstream {
        async fn generate(&self, _model: &str, _request: &ChatRequest, _key: &Key) -> Result<ChatResponse> {
            Ok(ChatResponse { text: "ok".into() })
        }
    }

    fn lifecycle(keys: &[&str]) -> Arc<KeyLifecycle> {
        let config = Config::default();
        KeyLifecycle::new(
            keys.iter().map(|s| Key::new(*s)).collect(),
            &config,
            Arc::new(AlwaysOkUpstream),
            Arc::new(NullLogSink),
            Arc::new(FakeClock::new(chrono::Utc::now())),
        )
    }

    #[tokio::test]
    async fn reload_carries_over_failure_counts_for_surviving_keys() {
        let lc = lifecycle(&["a", "b", "c"]);
        let gen0 = lc.current();
        gen0.registry.mark_failed(&Key::new("b"));
        assert!(!gen0.registry.is_valid(&Key::new("b")));

        let config = Config::default();
        lc.reload(vec![Key::new("a"), Key::new("b")], &config);

        let gen1 = lc.current();
        assert!(!gen1.registry.is_valid(&Key::new("b")), "carried-over failure state");
        assert!(gen1.registry.is_valid(&Key::new("a")));
    }

    #[tokio::test]
    async fn reload_drops_keys_no_longer_present() {
        let lc = lifecycle(&["a", "b"]);
        let config = Config::default();
        lc.reload(vec![Key::new("a")], &config);

        let gen1 = lc.current();
        assert_eq!(gen1.registry.keys(), &[Key::new("a")]);
    }

    #[tokio::test]
    async fn reload_preserves_valid_pool_entries() {
        let lc = lifecycle(&["a", "b"]);
        let gen0 = lc.current();
        gen0.pool.async_verify_and_add().await;
        assert!(gen0.pool.len() > 0);

        let config = Config::default();
        lc.reload(vec![Key::new("a"), Key::new("b")], &config);

        let gen1 = lc.current();
        assert!(gen1.pool.len() > 0, "warm pool entries survive a reload of the same keys");
    }

    #[tokio::test]
    async fn new_keys_start_with_a_clean_slate() {
        let lc = lifecycle(&["a"]);
        let config = Config::default();
        lc.reload(vec![Key::new("a"), Key::new("z")], &config);

        let gen1 = lc.current();
        assert!(gen1.registry.is_valid(&Key::new("z")));
    }

    #[tokio::test]
    async fn get_key_uses_the_pool_when_enabled() {
        let lc = lifecycle(&["a"]);
        let gen = lc.current();
        gen.get_key(None).await.unwrap();
        assert_eq!(gen.pool.stats().hits + gen.pool.stats().misses, 1);
    }

    #[tokio::test]
    async fn get_key_bypasses_the_pool_when_disabled() {
        let mut config = Config::default();
        config.pool.enabled = false;
        let lc = KeyLifecycle::new(
            vec![Key::new("a")],
            &config,
            Arc::new(AlwaysOkUpstream),
            Arc::new(NullLogSink),
            Arc::new(FakeClock::new(chrono::Utc::now())),
        );
        let gen = lc.current();
        let key = gen.get_key(None).await.unwrap();
        assert_eq!(key.as_str(), "a");
        assert_eq!(gen.pool.stats().hits + gen.pool.stats().misses, 0, "pool untouched");
    }
}
