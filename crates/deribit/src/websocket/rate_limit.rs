//! Adaptive token-bucket admission control.
//!
//! Requests cost tokens by operation class; the bucket refills at a fixed
//! rate up to a cap. Server throttling responses (codes 10429/11010) shrink
//! the bucket and raise the backoff multiplier; capacity and refill rate then
//! recover gradually towards their configured originals.
//!
//! All timekeeping is caller-supplied milliseconds on a monotonic scale so
//! the whole module stays deterministic under test.

use crate::common::enums::{DeribitOperationKind, DeribitRateLimitMode};

pub const DEFAULT_REFILL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_INITIAL: f64 = 1.5;
pub const DEFAULT_BACKOFF_MAX: f64 = 10.0;
pub const DEFAULT_BACKOFF_RESET_AFTER_MS: u64 = 60_000;
pub const DEFAULT_RECOVERY_FACTOR: f64 = 0.9;
pub const DEFAULT_RECOVERY_INCREASE: f64 = 0.05;
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_QUEUE_LIMIT: usize = 64;

/// Admission decision for a single request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Tokens deducted; send now.
    Allow,
    /// Insufficient tokens but the wait is short; park and retry after the
    /// refill interval.
    Queue { retry_after_ms: u64 },
    /// The wait is too long; fail fast with a retry hint.
    Reject { retry_after_ms: u64 },
}

/// Classic token bucket; admission state only, no queue storage.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    pub tokens: u64,
    pub capacity: u64,
    pub refill_rate: u64,
    pub refill_interval_ms: u64,
    pub last_refill_ms: u64,
}

impl TokenBucket {
    fn new(capacity: u64, refill_rate: u64, refill_interval_ms: u64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            refill_interval_ms,
            last_refill_ms: now_ms,
        }
    }

    /// Credits whole elapsed refill intervals, saturating at capacity.
    fn refill(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        if elapsed < self.refill_interval_ms {
            return;
        }
        let intervals = elapsed / self.refill_interval_ms;
        self.tokens = self
            .tokens
            .saturating_add(intervals * self.refill_rate)
            .min(self.capacity);
        self.last_refill_ms += intervals * self.refill_interval_ms;
    }
}

/// Backoff and recovery bookkeeping layered over the bucket.
#[derive(Clone, Debug)]
pub struct AdaptiveState {
    pub backoff_multiplier: f64,
    pub backoff_initial: f64,
    pub backoff_max: f64,
    pub backoff_reset_after_ms: u64,
    pub last_429_ms: Option<u64>,
    pub recovery_factor: f64,
    pub recovery_increase: f64,
    pub recovery_interval_ms: u64,
    pub last_recovery_ms: u64,
    pub original_capacity: u64,
    pub original_refill_rate: u64,
}

/// Point-in-time view for observers.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitSnapshot {
    pub mode: DeribitRateLimitMode,
    pub tokens: u64,
    pub capacity: u64,
    pub original_capacity: u64,
    pub refill_rate: u64,
    pub backoff_multiplier: f64,
    pub queue_len: usize,
}

/// Adaptive token-bucket rate limiter for one connection.
#[derive(Clone, Debug)]
pub struct AdaptiveRateLimiter {
    mode: DeribitRateLimitMode,
    bucket: TokenBucket,
    adaptive: AdaptiveState,
    queue_len: usize,
    queue_limit: usize,
}

impl AdaptiveRateLimiter {
    /// Creates a limiter from a mode preset.
    #[must_use]
    pub fn new(mode: DeribitRateLimitMode, now_ms: u64) -> Self {
        let (capacity, refill_rate) = match mode {
            DeribitRateLimitMode::Cautious => (60, 5),
            DeribitRateLimitMode::Normal => (120, 10),
            DeribitRateLimitMode::Aggressive => (200, 15),
        };
        let limiter = Self {
            mode,
            bucket: TokenBucket::new(capacity, refill_rate, DEFAULT_REFILL_INTERVAL_MS, now_ms),
            adaptive: AdaptiveState {
                backoff_multiplier: 1.0,
                backoff_initial: DEFAULT_BACKOFF_INITIAL,
                backoff_max: DEFAULT_BACKOFF_MAX,
                backoff_reset_after_ms: DEFAULT_BACKOFF_RESET_AFTER_MS,
                last_429_ms: None,
                recovery_factor: DEFAULT_RECOVERY_FACTOR,
                recovery_increase: DEFAULT_RECOVERY_INCREASE,
                recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
                last_recovery_ms: now_ms,
                original_capacity: capacity,
                original_refill_rate: refill_rate,
            },
            queue_len: 0,
            queue_limit: DEFAULT_QUEUE_LIMIT,
        };
        tracing::debug!(
            target: "deribit_client",
            mode = %mode,
            capacity,
            refill_rate,
            "rate_limit.init",
        );
        limiter
    }

    #[must_use]
    pub fn mode(&self) -> DeribitRateLimitMode {
        self.mode
    }

    /// The refill interval, which is also the queue retry delay.
    #[must_use]
    pub fn refill_interval_ms(&self) -> u64 {
        self.bucket.refill_interval_ms
    }

    /// Runs one admission check for `kind` at `now_ms`.
    ///
    /// Zero-cost operations bypass the bucket entirely.
    pub fn check(&mut self, kind: DeribitOperationKind, now_ms: u64) -> Admission {
        let cost = kind.cost();
        if cost == 0 {
            return Admission::Allow;
        }

        self.bucket.refill(now_ms);
        self.apply_recovery(now_ms);

        if self.bucket.tokens >= cost {
            self.bucket.tokens -= cost;
            tracing::trace!(
                target: "deribit_client",
                kind = %kind,
                cost,
                tokens = self.bucket.tokens,
                "rate_limit.request_allowed",
            );
            return Admission::Allow;
        }

        let delay =
            (self.bucket.refill_interval_ms as f64 * self.adaptive.backoff_multiplier) as u64;
        tracing::debug!(
            target: "deribit_client",
            kind = %kind,
            cost,
            tokens = self.bucket.tokens,
            retry_after_ms = delay,
            "rate_limit.request_limited",
        );
        if delay < 1_000 {
            Admission::Queue {
                retry_after_ms: self.bucket.refill_interval_ms,
            }
        } else {
            Admission::Reject {
                retry_after_ms: delay,
            }
        }
    }

    /// Applies the penalty for a server throttling response.
    pub fn on_rate_limit_hit(&mut self, now_ms: u64) {
        let adaptive = &mut self.adaptive;
        adaptive.backoff_multiplier =
            (adaptive.backoff_multiplier * adaptive.backoff_initial).min(adaptive.backoff_max);
        self.bucket.capacity =
            (((self.bucket.capacity as f64) * adaptive.recovery_factor) as u64).max(1);
        self.bucket.refill_rate =
            (((self.bucket.refill_rate as f64) * adaptive.recovery_factor) as u64).max(1);
        self.bucket.tokens = 0;
        adaptive.last_429_ms = Some(now_ms);

        tracing::warn!(
            target: "deribit_client",
            capacity = self.bucket.capacity,
            refill_rate = self.bucket.refill_rate,
            backoff_multiplier = adaptive.backoff_multiplier,
            "rate_limit.rate_limit_hit",
        );
    }

    /// Grows a degraded bucket back towards its originals and resets the
    /// backoff multiplier once the quiet period has elapsed.
    fn apply_recovery(&mut self, now_ms: u64) {
        let adaptive = &mut self.adaptive;

        if self.bucket.capacity < adaptive.original_capacity
            && now_ms.saturating_sub(adaptive.last_recovery_ms) >= adaptive.recovery_interval_ms
        {
            let capacity_step =
                (((adaptive.original_capacity as f64) * adaptive.recovery_increase) as u64).max(1);
            let refill_step = (((adaptive.original_refill_rate as f64)
                * adaptive.recovery_increase) as u64)
                .max(1);
            self.bucket.capacity =
                (self.bucket.capacity + capacity_step).min(adaptive.original_capacity);
            self.bucket.refill_rate =
                (self.bucket.refill_rate + refill_step).min(adaptive.original_refill_rate);
            adaptive.last_recovery_ms = now_ms;

            tracing::debug!(
                target: "deribit_client",
                capacity = self.bucket.capacity,
                refill_rate = self.bucket.refill_rate,
                "rate_limit.rate_limit_recovery",
            );
        }

        if adaptive.backoff_multiplier > 1.0
            && let Some(last_429) = adaptive.last_429_ms
            && now_ms.saturating_sub(last_429) >= adaptive.backoff_reset_after_ms
        {
            adaptive.backoff_multiplier = 1.0;
            tracing::debug!(
                target: "deribit_client",
                "rate_limit.rate_limit_recovery",
            );
        }
    }

    /// Reserves a queue slot for a parked request.
    ///
    /// Returns `false` when the queue limit is reached; the caller must then
    /// reject instead of parking.
    pub fn try_enqueue(&mut self) -> bool {
        if self.queue_len >= self.queue_limit {
            return false;
        }
        self.queue_len += 1;
        true
    }

    /// Releases a queue slot after the parked request was retried or dropped.
    pub fn dequeue(&mut self) {
        self.queue_len = self.queue_len.saturating_sub(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            mode: self.mode,
            tokens: self.bucket.tokens,
            capacity: self.bucket.capacity,
            original_capacity: self.adaptive.original_capacity,
            refill_rate: self.bucket.refill_rate,
            backoff_multiplier: self.adaptive.backoff_multiplier,
            queue_len: self.queue_len,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn fresh(mode: DeribitRateLimitMode) -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(mode, 0)
    }

    #[rstest]
    #[case(DeribitRateLimitMode::Cautious, 60, 5)]
    #[case(DeribitRateLimitMode::Normal, 120, 10)]
    #[case(DeribitRateLimitMode::Aggressive, 200, 15)]
    fn test_mode_presets(
        #[case] mode: DeribitRateLimitMode,
        #[case] capacity: u64,
        #[case] refill_rate: u64,
    ) {
        let limiter = fresh(mode);
        let snap = limiter.snapshot();
        assert_eq!(snap.capacity, capacity);
        assert_eq!(snap.tokens, capacity);
        assert_eq!(snap.refill_rate, refill_rate);
    }

    #[rstest]
    fn test_fresh_normal_bucket_admits_24_subscriptions() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        for i in 0..24 {
            assert_eq!(
                limiter.check(DeribitOperationKind::Subscription, 0),
                Admission::Allow,
                "request {i} should be admitted",
            );
        }
        // 24 * 5 tokens drained the bucket; the next one is throttled.
        assert!(matches!(
            limiter.check(DeribitOperationKind::Subscription, 0),
            Admission::Reject { retry_after_ms: 1_000 }
        ));
    }

    #[rstest]
    fn test_zero_cost_bypasses_admission() {
        let mut limiter = fresh(DeribitRateLimitMode::Cautious);
        // Drain completely.
        for _ in 0..60 {
            limiter.check(DeribitOperationKind::Query, 0);
        }
        assert_eq!(
            limiter.check(DeribitOperationKind::HighPriority, 0),
            Admission::Allow
        );
        assert_eq!(limiter.snapshot().tokens, 0);
    }

    #[rstest]
    fn test_refill_credits_whole_intervals() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        for _ in 0..120 {
            limiter.check(DeribitOperationKind::Query, 0);
        }
        assert_eq!(limiter.snapshot().tokens, 0);

        // 2.5 intervals elapse: exactly two refills of 10.
        assert_eq!(limiter.check(DeribitOperationKind::Query, 2_500), Admission::Allow);
        assert_eq!(limiter.snapshot().tokens, 19);
    }

    #[rstest]
    fn test_refill_saturates_at_capacity() {
        let mut limiter = fresh(DeribitRateLimitMode::Cautious);
        limiter.check(DeribitOperationKind::Query, 0);
        limiter.check(DeribitOperationKind::Query, 3_600_000);
        assert_eq!(limiter.snapshot().tokens, 59);
        assert_eq!(limiter.snapshot().capacity, 60);
    }

    #[rstest]
    fn test_rate_limit_hit_shrinks_bucket_and_zeroes_tokens() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        limiter.on_rate_limit_hit(10);

        let snap = limiter.snapshot();
        assert_eq!(snap.capacity, 108);
        assert_eq!(snap.refill_rate, 9);
        assert_eq!(snap.tokens, 0);
        assert!(snap.backoff_multiplier >= 1.5);
    }

    #[rstest]
    fn test_backoff_multiplier_caps_at_max() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        for i in 0..20 {
            limiter.on_rate_limit_hit(i);
        }
        let snap = limiter.snapshot();
        assert!(snap.backoff_multiplier <= DEFAULT_BACKOFF_MAX);
        // Repeated shrinks never lock the bucket out entirely.
        assert!(snap.capacity >= 1);
        assert!(snap.refill_rate >= 1);
    }

    #[rstest]
    fn test_reject_delay_scales_with_multiplier() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        limiter.on_rate_limit_hit(0);
        // Tokens are zero, so the next check is throttled with the scaled delay.
        match limiter.check(DeribitOperationKind::Order, 1) {
            Admission::Reject { retry_after_ms } => assert_eq!(retry_after_ms, 1_500),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[rstest]
    fn test_recovery_grows_capacity_towards_original() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        limiter.on_rate_limit_hit(0);
        assert_eq!(limiter.snapshot().capacity, 108);

        // One recovery interval later the capacity grows by 5% of original.
        limiter.check(DeribitOperationKind::Query, 5_001);
        let snap = limiter.snapshot();
        assert_eq!(snap.capacity, 114);
        assert!(snap.capacity <= snap.original_capacity);
    }

    #[rstest]
    fn test_recovery_caps_at_original() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        limiter.on_rate_limit_hit(0);

        let mut now = 0;
        for _ in 0..10 {
            now += 5_000;
            limiter.check(DeribitOperationKind::Query, now);
        }
        assert_eq!(limiter.snapshot().capacity, 120);
        assert_eq!(limiter.snapshot().refill_rate, 10);
    }

    #[rstest]
    fn test_multiplier_resets_after_quiet_period() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        limiter.on_rate_limit_hit(0);
        assert!(limiter.snapshot().backoff_multiplier > 1.0);

        limiter.check(DeribitOperationKind::Query, 60_001);
        assert_eq!(limiter.snapshot().backoff_multiplier, 1.0);
    }

    #[rstest]
    fn test_tokens_never_exceed_capacity_invariant() {
        let mut limiter = fresh(DeribitRateLimitMode::Aggressive);
        let mut now = 0;
        for step in 0..1_000u64 {
            now += step % 700;
            limiter.check(DeribitOperationKind::Query, now);
            if step % 97 == 0 {
                limiter.on_rate_limit_hit(now);
            }
            let snap = limiter.snapshot();
            assert!(snap.tokens <= snap.capacity);
            assert!(snap.capacity <= snap.original_capacity);
            assert!(snap.backoff_multiplier >= 1.0);
            assert!(snap.backoff_multiplier <= DEFAULT_BACKOFF_MAX);
        }
    }

    #[rstest]
    fn test_queue_slots_bounded() {
        let mut limiter = fresh(DeribitRateLimitMode::Normal);
        for _ in 0..DEFAULT_QUEUE_LIMIT {
            assert!(limiter.try_enqueue());
        }
        assert!(!limiter.try_enqueue());
        limiter.dequeue();
        assert!(limiter.try_enqueue());
    }
}
