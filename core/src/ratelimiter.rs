//! Token-bucket admission control for diagnostic runs.
//!
//! Two kinds of bucket are combined by [`Admission`]: a [`KeyedLimiter`] with one
//! bucket per client and a shared [`RateLimiter`] capping aggregate load.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Bucket sizing: `capacity` tokens of burst, refilled at `refill_per_sec`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

/// What to do with a client whose bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionMode {
    /// Refuse immediately with a retry hint.
    Reject,
    /// Hold the request until a token refills.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limited, retry after {retry_after:?}")]
pub struct RateLimited {
    pub retry_after: Duration,
}

/// A single token bucket. Starts full.
///
/// A refill rate that is zero, negative or NaN means the bucket never limits.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(cfg: BucketConfig) -> Self {
        let refill_per_sec = if cfg.refill_per_sec.is_finite() && cfg.refill_per_sec > 0.0 {
            cfg.refill_per_sec
        } else {
            f64::INFINITY
        };
        let capacity = f64::from(cfg.capacity.max(1));
        TokenBucket { capacity, refill_per_sec, tokens: capacity, last_refill: Instant::now() }
    }

    /// Consume one token, or report how long until one is available.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        if self.refill_per_sec.is_infinite() { return Ok(()); }
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - self.tokens) / self.refill_per_sec;
            Err(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
        }
    }

    /// Whether refill alone would have topped the bucket up by `now`, so that
    /// replacing it with a fresh bucket hands out nothing extra.
    pub fn is_full_at(&self, now: Instant) -> bool {
        if self.refill_per_sec.is_infinite() { return true; }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens + elapsed * self.refill_per_sec >= self.capacity
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

/// Shared bucket; `acquire` waits for a token instead of failing.
pub struct RateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self { RateLimiter { bucket: self.bucket.clone() } }
}

impl RateLimiter {
    pub fn new(cfg: BucketConfig) -> Self {
        RateLimiter { bucket: Arc::new(Mutex::new(TokenBucket::new(cfg))) }
    }

    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.bucket.lock().try_acquire()
    }

    /// Wait until a token is available. Waiters are released in no particular
    /// order as tokens refill.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return,
                Err(w) => w,
            };
            tokio::time::sleep(wait).await;
        }
    }
}

struct Entry {
    bucket: TokenBucket,
    last_seen: Instant,
}

struct KeyedInner {
    buckets: HashMap<String, Entry>,
    last_sweep: Instant,
}

/// One bucket per client key, evicted after `idle` without activity once it
/// has refilled to capacity.
///
/// An evicted client that returns gets a fresh, full bucket, which is exactly
/// what it would have had, so eviction never grants extra quota.
pub struct KeyedLimiter {
    cfg: BucketConfig,
    idle: Duration,
    inner: Mutex<KeyedInner>,
}

impl KeyedLimiter {
    pub fn new(cfg: BucketConfig, idle: Duration) -> Self {
        KeyedLimiter {
            cfg,
            idle,
            inner: Mutex::new(KeyedInner { buckets: HashMap::new(), last_sweep: Instant::now() }),
        }
    }

    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if now.duration_since(inner.last_sweep) >= self.idle {
            Self::evict_idle(&mut inner.buckets, now, self.idle);
            inner.last_sweep = now;
        }
        let cfg = self.cfg;
        let entry = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Entry { bucket: TokenBucket::new(cfg), last_seen: now });
        entry.last_seen = now;
        entry.bucket.try_acquire()
    }

    pub async fn acquire(&self, key: &str) {
        loop {
            let wait = match self.try_acquire(key) {
                Ok(()) => return,
                Err(w) => w,
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Drop buckets idle for at least the expiry window and already refilled.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        Self::evict_idle(&mut inner.buckets, now, self.idle);
        inner.last_sweep = now;
    }

    pub fn len(&self) -> usize { self.inner.lock().buckets.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn evict_idle(buckets: &mut HashMap<String, Entry>, now: Instant, idle: Duration) {
        let before = buckets.len();
        buckets.retain(|_, e| now.duration_since(e.last_seen) < idle || !e.bucket.is_full_at(now));
        let evicted = before - buckets.len();
        if evicted > 0 { debug!(evicted, remaining = buckets.len(), "evicted idle client buckets"); }
    }
}

/// Per-client bucket in front of a global bucket.
///
/// The client check runs first so a refused request never spends a global token.
pub struct Admission {
    client: KeyedLimiter,
    client_mode: AdmissionMode,
    global: RateLimiter,
}

impl Admission {
    pub fn new(client: BucketConfig, client_mode: AdmissionMode, client_idle: Duration, global: BucketConfig) -> Self {
        Admission {
            client: KeyedLimiter::new(client, client_idle),
            client_mode,
            global: RateLimiter::new(global),
        }
    }

    pub async fn admit(&self, client_key: &str) -> Result<(), RateLimited> {
        match self.client_mode {
            AdmissionMode::Reject => {
                if let Err(retry_after) = self.client.try_acquire(client_key) {
                    debug!(client = client_key, ?retry_after, "client over budget");
                    return Err(RateLimited { retry_after });
                }
            }
            AdmissionMode::Wait => self.client.acquire(client_key).await,
        }
        self.global.acquire().await;
        Ok(())
    }

    pub fn clients(&self) -> &KeyedLimiter { &self.client }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(capacity: u32, refill_per_sec: f64) -> BucketConfig {
        BucketConfig { capacity, refill_per_sec }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_refill() {
        let mut b = TokenBucket::new(cfg(2, 1.0));
        let admitted = (0..5).filter(|_| b.try_acquire().is_ok()).count();
        assert_eq!(admitted, 2);
        let wait = b.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.try_acquire().is_ok());
        assert!(b.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_capacity() {
        let mut b = TokenBucket::new(cfg(3, 10.0));
        tokio::time::advance(Duration::from_secs(60)).await;
        let admitted = (0..10).filter(|_| b.try_acquire().is_ok()).count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn zero_rate_means_unlimited() {
        let mut b = TokenBucket::new(cfg(1, 0.0));
        for _ in 0..1000 { assert!(b.try_acquire().is_ok()); }
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_buckets_are_independent() {
        let l = KeyedLimiter::new(cfg(1, 0.5), Duration::from_secs(600));
        assert!(l.try_acquire("198.51.100.1").is_ok());
        assert!(l.try_acquire("198.51.100.1").is_err());
        assert!(l.try_acquire("198.51.100.2").is_ok());
        assert_eq!(l.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_are_evicted() {
        let l = KeyedLimiter::new(cfg(1, 1.0), Duration::from_secs(10));
        l.try_acquire("a").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        l.try_acquire("b").unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        l.sweep();
        assert_eq!(l.len(), 1);
        tokio::time::advance(Duration::from_secs(10)).await;
        l.sweep();
        assert!(l.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_does_not_restore_quota() {
        // Full refill takes 200s, far longer than the idle window.
        let l = KeyedLimiter::new(cfg(2, 0.01), Duration::from_secs(10));
        let mut admitted = 0;
        for _ in 0..5 {
            admitted += (0..3).filter(|_| l.try_acquire("203.0.113.9").is_ok()).count();
            tokio::time::advance(Duration::from_secs(11)).await;
            l.sweep();
            assert_eq!(l.len(), 1);
        }
        // 2 of burst plus 0.55 tokens of refill over 55s.
        assert_eq!(admitted, 2);

        tokio::time::advance(Duration::from_secs(200)).await;
        l.sweep();
        assert!(l.is_empty());
        assert!(l.try_acquire("203.0.113.9").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_idle_window_still_limits() {
        let a = Admission::new(cfg(2, 0.01), AdmissionMode::Reject, Duration::ZERO, cfg(100, 100.0));
        let mut ok = 0;
        for _ in 0..20 {
            if a.admit("client").await.is_ok() { ok += 1; }
        }
        assert_eq!(ok, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_mode_admits_burst_only() {
        let a = Admission::new(cfg(2, 1.0), AdmissionMode::Reject, Duration::from_secs(600), cfg(100, 100.0));
        let mut ok = 0;
        let mut limited = 0;
        for _ in 0..5 {
            match a.admit("client").await {
                Ok(()) => ok += 1,
                Err(RateLimited { retry_after }) => {
                    assert!(retry_after <= Duration::from_secs(1));
                    limited += 1;
                }
            }
        }
        assert_eq!((ok, limited), (2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_mode_delays_instead_of_dropping() {
        let a = Arc::new(Admission::new(cfg(2, 1.0), AdmissionMode::Wait, Duration::from_secs(600), cfg(100, 100.0)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                a.admit("client").await.unwrap();
                Instant::now()
            }));
        }
        let mut done = Vec::new();
        for h in handles { done.push(h.await.unwrap().duration_since(start)); }
        done.sort();
        assert_eq!(done.iter().filter(|d| d.is_zero()).count(), 2);
        // Three more tokens at one per second.
        assert!(done[4] >= Duration::from_secs(3));
        assert!(done[4] < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn global_bucket_caps_all_clients() {
        let a = Admission::new(cfg(10, 10.0), AdmissionMode::Reject, Duration::from_secs(600), cfg(2, 1.0));
        let start = Instant::now();
        for i in 0..3 { a.admit(&format!("client-{i}")).await.unwrap(); }
        assert!(Instant::now().duration_since(start) >= Duration::from_millis(900));
    }
}
