//! A background sweep over the whole key ring,
//! staggered into batches so a verification run never opens hundreds of
//! upstream connections at once.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use rand::seq::SliceRandom;

use crate::key::Key;
use crate::registry::KeyRegistry;
use crate::upstream::{ChatRequest, ErrorLogSink, UpstreamChatService};
use crate::classifier::ErrorClassifier;

pub struct VerifierConfig {
    pub batch_size: usize,
    pub sweep_interval: StdDuration,
    pub test_model: String,
    pub verification_timeout: StdDuration,
}

/// Sweeps the candidate set (generally-valid keys not cooling for the test
/// model) in batches. A key already at the failure ceiling is excluded from
/// the candidate set just like everywhere else in this subsystem — see the
/// Open Questions section of the design notes for why that means a
/// `mark_failed` key never comes back on its own. Verification here only
/// resets or classifies; pre-warming the ready pool is the pool's own job
/// (its maintenance and async-refill paths pick up keys this sweep reset).
pub struct ScheduledVerifier {
    config: VerifierConfig,
    registry: Arc<KeyRegistry>,
    upstream: Arc<dyn UpstreamChatService>,
    log: Arc<dyn ErrorLogSink>,
}

impl ScheduledVerifier {
    pub fn new(
        config: VerifierConfig,
        registry: Arc<KeyRegistry>,
        upstream: Arc<dyn UpstreamChatService>,
        log: Arc<dyn ErrorLogSink>,
    ) -> Self {
        Self {
            config,
            registry,
            upstream,
            log,
        }
    }

    /// Runs sweeps forever, one full cadence every `sweep_interval`. A sweep
    /// itself already spans most of that interval (its batches are staggered
    /// across it), so only the remainder is slept here — sleeping the full
    /// interval again on top would stretch the effective cadence to ≈2·I.
    pub async fn run_forever(self: Arc<Self>) {
        loop {
            let started = std::time::Instant::now();
            self.sweep_once().await;
            let remaining = self.config.sweep_interval.saturating_sub(started.elapsed());
            tokio::time::sleep(remaining).await;
        }
    }

    /// One full pass over the candidate set: every key that is
    /// generally-valid and not currently cooling for the test model (a
    /// failed or cooling key would just fail verification again, so
    /// skipping them up front saves an upstream round trip). Shuffled so
    /// repeated sweeps don't always hit the same keys first under a tight
    /// interval, split into `batch_size`-sized batches, with consecutive
    /// batches spread evenly across the configured sweep interval rather
    /// than a fixed per-batch sleep — `I / nBatches`, recomputed every
    /// sweep so a changed `CHECK_INTERVAL_HOURS` takes effect immediately.
    pub async fn sweep_once(&self) {
        let mut candidates: Vec<Key> = self
            .registry
            .keys()
            .iter()
            .filter(|k| self.registry.is_model_available(k, &self.config.test_model))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return;
        }
        candidates.shuffle(&mut rand::thread_rng());

        let batch_size = self.config.batch_size.max(1);
        let num_batches = candidates.len().div_ceil(batch_size);
        let batch_stagger = if num_batches > 1 {
            self.config.sweep_interval / num_batches as u32
        } else {
            StdDuration::ZERO
        };

        for (i, batch) in candidates.chunks(batch_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(batch_stagger).await;
            }
            self.verify_batch(batch).await;
        }
    }

    async fn verify_batch(&self, batch: &[Key]) {
        let futures = batch.iter().map(|key| self.verify_one(key));
        futures::future::join_all(futures).await;
    }

    async fn verify_one(&self, key: &Key) {
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
            }
            Ok(Err(e)) => {
                let classifier = ErrorClassifier::new(&self.registry, self.log.as_ref(), 0);
                classifier.apply(&e.to_string(), key, Some(&self.config.test_model), 0);
            }
            Err(_elapsed) => {
                let classifier = ErrorClassifier::new(&self.registry, self.log.as_ref(), 0);
                classifier.apply(
                    "status code 408 verification timeout",
                    key,
                    Some(&self.config.test_model),
                    0,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KeyRegistry;
    use crate::upstream::{ChatResponse, NullLogSink};
    use async_trait::async_trait;
    use keygate_domain::clock::FakeClock;
    use keygate_domain::{Error, Result};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingUpstream {
        calls: AtomicUsize,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl UpstreamChatService for CountingUpstream {
        async fn generate(&self, _model: &str, _request: &ChatRequest, key: &Key) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(key.as_str()) {
                Err(Error::Other("status code 403".into()))
            } else {
                Ok(ChatResponse { text: "ok".into() })
            }
        }
    }

    fn setup(keys: &[&str], failing: &[&str], batch_size: usize) -> (Arc<ScheduledVerifier>, Arc<KeyRegistry>, Arc<CountingUpstream>) {
        let registry = Arc::new(KeyRegistry::new(
            keys.iter().map(|s| Key::new(*s)).collect(),
            3,
            Arc::new(FakeClock::new(chrono::Utc::now())),
            chrono_tz::UTC,
            0,
        ));
        let upstream = Arc::new(CountingUpstream {
            calls: AtomicUsize::new(0),
            failing: failing.iter().map(|s| s.to_string()).collect(),
        });
        let verifier = Arc::new(ScheduledVerifier::new(
            VerifierConfig {
                batch_size,
                sweep_interval: StdDuration::from_millis(20),
                test_model: "test-model".to_string(),
                verification_timeout: StdDuration::from_secs(5),
            },
            Arc::clone(&registry),
            upstream.clone() as Arc<dyn UpstreamChatService>,
            Arc::new(NullLogSink),
        ));
        (verifier, registry, upstream)
    }

    #[tokio::test]
    async fn sweep_verifies_every_key_across_batches() {
        let (verifier, _registry, upstream) = setup(&["a", "b", "c", "d", "e"], &[], 2);
        verifier.sweep_once().await;
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn sweep_resets_a_partially_failed_key_that_now_succeeds() {
        let (verifier, registry, _upstream) = setup(&["a"], &[], 3);
        let a = Key::new("a");
        // Below the ceiling, so still in the candidate set.
        registry.increment_failure(&a);
        assert!(registry.is_valid(&a));

        verifier.sweep_once().await;
        assert_eq!(registry.fail_counts_snapshot().get(&a).copied(), Some(0));
    }

    #[tokio::test]
    async fn sweep_skips_a_key_already_at_the_failure_ceiling() {
        let (verifier, registry, upstream) = setup(&["a", "b"], &[], 3);
        let a = Key::new("a");
        registry.mark_failed(&a);

        verifier.sweep_once().await;
        // Only "b" is in the candidate set; "a" is excluded and never calls
        // upstream, so it stays failed.
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert!(!registry.is_valid(&a));
    }

    #[tokio::test]
    async fn sweep_marks_a_key_failing_auth_as_invalid() {
        let (verifier, registry, _upstream) = setup(&["a", "b"], &["a"], 3);
        verifier.sweep_once().await;
        assert!(!registry.is_valid(&Key::new("a")));
        assert!(registry.is_valid(&Key::new("b")));
    }

    #[tokio::test]
    async fn sweep_excludes_keys_cooling_on_the_test_model() {
        let (verifier, registry, upstream) = setup(&["a", "b"], &[], 3);
        registry.mark_model_cooling(&Key::new("a"), "test-model");

        verifier.sweep_once().await;
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1, "cooling key must be skipped");
    }

    #[tokio::test]
    async fn batches_spread_evenly_across_the_sweep_interval() {
        // 100 keys, batch size 20 => 5 batches; staggering I/nBatches
        // between them means total elapsed time is dominated by 4 sleeps
        // of interval/5 each, not by a fixed per-batch constant.
        let keys: Vec<String> = (0..100).map(|i| format!("k{i}")).collect();
        let key_refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
        let (verifier, _registry, upstream) = setup(&key_refs, &[], 20);

        let start = std::time::Instant::now();
        verifier.sweep_once().await;
        let elapsed = start.elapsed();

        assert_eq!(upstream.calls.load(Ordering::SeqCst), 100);
        // sweep_interval in `setup` is 20ms => batch_stagger = 4ms, 4 gaps.
        assert!(elapsed >= StdDuration::from_millis(16), "elapsed={elapsed:?}");
    }
}
