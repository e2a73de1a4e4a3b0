use crate::backend::{Admission, Backend, Decision, SimpleBackend, SimpleInput, SimpleOutput};
use crate::policy::Policy;
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("GC interval must be non-zero")]
    ZeroGcInterval,
}

/// Times of the admitted requests for one key, oldest first.
type RequestLog = VecDeque<Instant>;

/// A sliding window rate limiter [Backend] that keeps a log of admitted request times per key,
/// using [DashMap](dashmap::DashMap) to store the logs in memory.
///
/// The prune, count and append sequence of a check runs while holding the write lock of the
/// key's shard, so concurrent requests from the same client can never be admitted past the
/// quota. Keys living in other shards are not blocked.
#[derive(Clone)]
pub struct InMemoryBackend {
    policy: Policy,
    map: Arc<DashMap<String, RequestLog>>,
    _gc_handle: Option<Arc<GcHandle>>,
}

/// Aborts the garbage collector once the last clone of the backend is gone.
struct GcHandle(JoinHandle<()>);

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl InMemoryBackend {
    pub fn builder(policy: Policy) -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            policy,
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Number of keys currently holding a request log.
    pub fn tracked_keys(&self) -> usize {
        self.map.len()
    }

    /// Admit or reject a request from `key` made at `now`.
    ///
    /// Entries older than the period are pruned first. An entry logged at `t` counts until
    /// `now - t` reaches the period, so it no longer counts at exactly `t + period`.
    /// A rejected request is not logged.
    ///
    /// `now` must never go backwards for a given key.
    pub fn check(&self, key: &str, now: Instant) -> Decision {
        self.check_with_output(key, now).0
    }

    /// Prune every request log against `now`, removing the keys left without any entries.
    ///
    /// Returns the number of keys removed.
    pub fn sweep(&self, now: Instant) -> usize {
        sweep(&self.map, now, self.policy.period())
    }

    fn check_with_output(&self, key: &str, now: Instant) -> (Decision, SimpleOutput) {
        let period = self.policy.period();
        let max_calls = self.policy.max_calls();

        let mut entries = self.map.entry(key.to_owned()).or_default();
        prune(&mut entries, now, period);
        let decision = if (entries.len() as u64) < max_calls {
            entries.push_back(now);
            Decision::Admit
        } else {
            Decision::Reject
        };

        let reset = entries
            .front()
            .and_then(|oldest| oldest.checked_add(period))
            .unwrap_or(now);
        let output = SimpleOutput {
            limit: max_calls,
            remaining: max_calls.saturating_sub(entries.len() as u64),
            reset,
            period,
        };
        (decision, output)
    }

    fn garbage_collector(
        map: Arc<DashMap<String, RequestLog>>,
        period: Duration,
        interval: Duration,
    ) -> JoinHandle<()> {
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                let removed = sweep(&map, now, period);
                if removed > 0 {
                    log::debug!("Rate limiter GC removed {removed} idle keys");
                }
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

fn prune(entries: &mut RequestLog, now: Instant, period: Duration) {
    while let Some(oldest) = entries.front() {
        if now.saturating_duration_since(*oldest) < period {
            break;
        }
        entries.pop_front();
    }
}

fn sweep(map: &DashMap<String, RequestLog>, now: Instant, period: Duration) -> usize {
    let before = map.len();
    map.retain(|_k, entries| {
        prune(entries, now, period);
        !entries.is_empty()
    });
    before.saturating_sub(map.len())
}

impl Backend<SimpleInput> for InMemoryBackend {
    type Output = SimpleOutput;
    /// The key and the logged time of an admitted request.
    type RollbackToken = (String, Instant);
    type Error = actix_web::Error;

    async fn request(
        &self,
        input: SimpleInput,
    ) -> Result<Admission<Self::Output, Self::RollbackToken>, Self::Error> {
        let now = Instant::now();
        let (decision, output) = self.check_with_output(&input.key, now);
        Ok(match decision {
            Decision::Admit => Admission::Admit {
                output,
                rollback: (input.key, now),
            },
            Decision::Reject => {
                log::debug!(
                    "Rejected key {:?}: {} requests within the last {:?}",
                    input.key,
                    output.limit,
                    output.period
                );
                Admission::Reject { output }
            }
        })
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        let (key, logged_at) = token;
        if let Some(mut entries) = self.map.get_mut(&key) {
            if let Some(position) = entries.iter().rposition(|t| *t == logged_at) {
                entries.remove(position);
            }
        }
        Ok(())
    }
}

impl SimpleBackend for InMemoryBackend {
    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.map.remove(key);
        Ok(())
    }
}

pub struct InMemoryBackendBuilder {
    policy: Policy,
    gc_interval: Option<Duration>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically prunes every request log, removing the keys of
    /// clients that have not made a request within the period.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Build the backend, spawning the garbage collector on the current actix runtime if enabled.
    ///
    /// Fails if the GC interval is zero.
    pub fn build(self) -> Result<InMemoryBackend, Error> {
        if self.gc_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::ZeroGcInterval);
        }
        let map = Arc::new(DashMap::<String, RequestLog>::new());
        let period = self.policy.period();
        let gc_handle = self.gc_interval.map(|gc_interval| {
            Arc::new(GcHandle(InMemoryBackend::garbage_collector(
                map.clone(),
                period,
                gc_interval,
            )))
        });
        Ok(InMemoryBackend {
            policy: self.policy,
            map,
            _gc_handle: gc_handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    const MINUTE: Duration = Duration::from_secs(60);

    fn backend(max_calls: u64, period: Duration) -> InMemoryBackend {
        let policy = Policy::new(max_calls, period).unwrap();
        InMemoryBackend::builder(policy)
            .with_gc_interval(None)
            .build()
            .unwrap()
    }

    fn secs(start: Instant, secs: u64) -> Instant {
        start + Duration::from_secs(secs)
    }

    fn log_len(backend: &InMemoryBackend, key: &str) -> usize {
        backend.map.get(key).map_or(0, |entries| entries.len())
    }

    #[actix_web::test]
    async fn test_quota() {
        let backend = backend(5, MINUTE);
        let start = Instant::now();
        for i in 0..5 {
            // First 5 should be admitted
            assert_eq!(backend.check("KEY1", secs(start, i)), Decision::Admit);
        }
        // Sixth is still within a minute of the first, so rejected
        assert_eq!(backend.check("KEY1", secs(start, 59)), Decision::Reject);
    }

    #[actix_web::test]
    async fn test_scenario() {
        let backend = backend(3, Duration::from_secs(10));
        let start = Instant::now();
        assert_eq!(backend.check("A", secs(start, 0)), Decision::Admit);
        assert_eq!(backend.check("A", secs(start, 1)), Decision::Admit);
        assert_eq!(backend.check("A", secs(start, 2)), Decision::Admit);
        assert_eq!(backend.check("A", secs(start, 3)), Decision::Reject);
        // The entry at 0 has expired
        assert_eq!(backend.check("A", secs(start, 11)), Decision::Admit);
        // So has the entry at 1, exactly one period earlier, leaving 2 and 11
        assert_eq!(log_len(&backend, "A"), 2);
    }

    #[actix_web::test]
    async fn test_window_edge() {
        let backend = backend(3, Duration::from_secs(10));
        let start = Instant::now();
        for i in 0..3 {
            assert_eq!(backend.check("A", secs(start, i)), Decision::Admit);
        }
        // The entry at 0 is pruned at exactly 10 seconds later
        assert_eq!(backend.check("A", secs(start, 10)), Decision::Admit);
        // But the entries at 1 and 2 are still counted
        assert_eq!(
            backend.check("A", start + Duration::from_millis(10_999)),
            Decision::Reject
        );
    }

    #[actix_web::test]
    async fn test_window_slides() {
        let backend = backend(3, Duration::from_secs(10));
        let start = Instant::now();
        for i in 0..3 {
            assert_eq!(backend.check("A", secs(start, i)), Decision::Admit);
        }
        // Only the oldest entry has expired, which frees exactly one slot
        let later = start + Duration::from_millis(10_001);
        assert_eq!(backend.check("A", later), Decision::Admit);
        assert_eq!(backend.check("A", later), Decision::Reject);
    }

    #[actix_web::test]
    async fn test_keys_are_independent() {
        let backend = backend(1, MINUTE);
        let start = Instant::now();
        assert_eq!(backend.check("A", start), Decision::Admit);
        assert_eq!(backend.check("A", start), Decision::Reject);
        assert_eq!(backend.check("B", start), Decision::Admit);
        assert_eq!(backend.check("B", start), Decision::Reject);
        assert_eq!(log_len(&backend, "A"), 1);
        assert_eq!(log_len(&backend, "B"), 1);
    }

    #[actix_web::test]
    async fn test_reject_does_not_grow_log() {
        let backend = backend(2, Duration::from_secs(10));
        let start = Instant::now();
        backend.check("A", secs(start, 0));
        backend.check("A", secs(start, 5));
        for i in 6..10 {
            assert_eq!(backend.check("A", secs(start, i)), Decision::Reject);
            assert_eq!(log_len(&backend, "A"), 2);
        }
        // Rejections still prune stale entries
        assert_eq!(backend.check("A", secs(start, 12)), Decision::Admit);
        assert_eq!(backend.check("A", secs(start, 14)), Decision::Reject);
        assert_eq!(log_len(&backend, "A"), 2);
    }

    #[actix_web::test]
    async fn test_reset() {
        tokio::time::pause();
        let backend = backend(1, MINUTE);
        let input = SimpleInput {
            key: "KEY1".to_string(),
        };
        // Make first request, should be admitted
        let (decision, _, _) = backend.request(input.clone()).await.unwrap().into_parts();
        assert!(decision.is_admitted());
        // Request again, should be rejected
        let (decision, _, _) = backend.request(input.clone()).await.unwrap().into_parts();
        assert!(decision.is_rejected());
        // Advance time and try again, should now be admitted
        tokio::time::advance(MINUTE).await;
        let (decision, _, _) = backend.request(input).await.unwrap().into_parts();
        assert!(decision.is_admitted());
    }

    #[actix_web::test]
    async fn test_output() {
        tokio::time::pause();
        let backend = backend(2, MINUTE);
        let input = SimpleInput {
            key: "KEY1".to_string(),
        };
        let start = Instant::now();
        // First of 2 should be admitted.
        let (decision, output, _) = backend.request(input.clone()).await.unwrap().into_parts();
        assert!(decision.is_admitted());
        assert_eq!(output.remaining, 1);
        assert_eq!(output.limit, 2);
        assert_eq!(output.period, MINUTE);
        assert_eq!(output.reset, start + MINUTE);
        // Second of 2 should be admitted, reset still follows the oldest entry.
        tokio::time::advance(Duration::from_secs(10)).await;
        let (decision, output, _) = backend.request(input.clone()).await.unwrap().into_parts();
        assert!(decision.is_admitted());
        assert_eq!(output.remaining, 0);
        assert_eq!(output.reset, start + MINUTE);
        // Should be rejected
        let (decision, output, _) = backend.request(input.clone()).await.unwrap().into_parts();
        assert!(decision.is_rejected());
        assert_eq!(output.remaining, 0);
        assert_eq!(output.reset, start + MINUTE);
        // Once the first expires the reset moves to the second entry
        tokio::time::advance(Duration::from_secs(50)).await;
        let (decision, output, _) = backend.request(input).await.unwrap().into_parts();
        assert!(decision.is_admitted());
        assert_eq!(output.remaining, 0);
        assert_eq!(output.reset, start + Duration::from_secs(70));
    }

    #[actix_web::test]
    async fn test_rollback() {
        tokio::time::pause();
        let backend = backend(5, MINUTE);
        let input = SimpleInput {
            key: "KEY1".to_string(),
        };
        let (_, output, rollback) = backend.request(input.clone()).await.unwrap().into_parts();
        assert_eq!(output.remaining, 4);
        backend.rollback(rollback.unwrap()).await.unwrap();
        // Remaining requests should still be the same, since the previous call was excluded
        let (_, output, _) = backend.request(input).await.unwrap().into_parts();
        assert_eq!(output.remaining, 4);
    }

    #[actix_web::test]
    async fn test_remove_key() {
        tokio::time::pause();
        let backend = backend(1, MINUTE);
        let input = SimpleInput {
            key: "KEY1".to_string(),
        };
        let (decision, _, _) = backend.request(input.clone()).await.unwrap().into_parts();
        assert!(decision.is_admitted());
        let (decision, _, _) = backend.request(input.clone()).await.unwrap().into_parts();
        assert!(decision.is_rejected());
        backend.remove_key("KEY1").await.unwrap();
        // Log should have been cleared
        let (decision, _, _) = backend.request(input).await.unwrap().into_parts();
        assert!(decision.is_admitted());
    }

    #[actix_web::test]
    async fn test_sweep() {
        let backend = backend(5, MINUTE);
        let start = Instant::now();
        backend.check("KEY1", start);
        backend.check("KEY2", secs(start, 30));
        assert_eq!(backend.tracked_keys(), 2);
        assert_eq!(backend.sweep(secs(start, 59)), 0);
        // KEY1 has been idle for a full period
        assert_eq!(backend.sweep(secs(start, 60)), 1);
        assert!(!backend.map.contains_key("KEY1"));
        assert_eq!(log_len(&backend, "KEY2"), 1);
        assert_eq!(backend.sweep(secs(start, 90)), 1);
        assert_eq!(backend.tracked_keys(), 0);
    }

    #[actix_web::test]
    async fn test_garbage_collection() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder(Policy::new(1, MINUTE).unwrap())
            .with_gc_interval(Some(MINUTE))
            .build()
            .unwrap();
        let start = Instant::now();
        backend.check("KEY1", start);
        backend.check("KEY2", secs(start, 30));
        assert!(backend.map.contains_key("KEY1"));
        assert!(backend.map.contains_key("KEY2"));
        // Advance time such that the garbage collector runs,
        // idle KEY1 should be cleaned, but KEY2 should remain.
        tokio::time::advance(MINUTE).await;
        assert!(!backend.map.contains_key("KEY1"));
        assert!(backend.map.contains_key("KEY2"));
    }

    #[test]
    fn test_zero_gc_interval() {
        let result = InMemoryBackend::builder(Policy::default())
            .with_gc_interval(Some(Duration::ZERO))
            .build();
        assert_eq!(result.err(), Some(Error::ZeroGcInterval));
    }

    #[actix_web::test]
    async fn test_rejection_has_no_rollback() {
        tokio::time::pause();
        let backend = backend(1, MINUTE);
        let input = SimpleInput {
            key: "KEY1".to_string(),
        };
        let admission = backend.request(input.clone()).await.unwrap();
        assert!(matches!(admission, Admission::Admit { .. }));
        let admission = backend.request(input).await.unwrap();
        assert_eq!(admission.decision(), Decision::Reject);
        assert_eq!(admission.output().remaining, 0);
        assert!(admission.into_parts().2.is_none());
    }

    #[test]
    fn test_concurrent_checks() {
        let backend = backend(100, MINUTE);
        let now = Instant::from_std(std::time::Instant::now());
        let admitted = AtomicU64::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        if backend.check("KEY1", now).is_admitted() {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(admitted.load(Ordering::Relaxed), 100);
        assert_eq!(log_len(&backend, "KEY1"), 100);
    }
}
