//! Request throttle in front of the shared provider
//!
//! Every provider call across all concurrent workers and orchestrator phases
//! goes through one `Throttle`. `acquire` blocks until a virtual token is
//! available under three constraints at once: bucket capacity with
//! continuous fractional refill, strict FIFO among waiters, and a minimum
//! wall-clock spacing between consecutive consumptions.
//!
//! There is no `release`: the latency of the downstream call is the release.
//! `backoff` tightens the limits on 429/402 (up to three levels) and
//! `recover` restores them stepwise after a cooldown.

mod provider;

pub use provider::ThrottledProvider;

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ThrottleSettings;
use crate::llm::RateLimitInfo;

/// Maximum backoff levels stacked by repeated limit errors
const MAX_BACKOFF_LEVEL: u32 = 3;

/// Spacing cap reached at deep backoff
const MAX_SPACING: Duration = Duration::from_secs(5);

/// Refill floor in requests per second
const MIN_REFILL: f64 = 0.1;

/// Cooldown after the last backoff before recovery steps begin
const RECOVERY_COOLDOWN: Duration = Duration::from_secs(10);

/// Guard interval for parked non-head waiters (covers a notify lost between
/// lock release and park)
const WAITER_RECHECK: Duration = Duration::from_millis(50);

struct ThrottleInner {
    /// Current virtual tokens, fractional
    capacity: f64,

    /// Current (possibly backed-off) capacity ceiling
    max_concurrent: f64,

    /// Current refill rate
    refill_per_second: f64,

    /// Current spacing floor
    min_spacing: Duration,

    last_refill: Instant,
    last_consume: Option<Instant>,

    backoff_level: u32,
    last_backoff: Option<Instant>,

    /// FIFO tickets; the front ticket is the only one allowed to consume
    waiters: VecDeque<u64>,
    next_ticket: u64,

    /// Total consumptions, for diagnostics
    consumed: u64,
}

impl ThrottleInner {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.capacity = (self.capacity + elapsed * self.refill_per_second).min(self.max_concurrent);
        self.last_refill = now;
    }

    fn spacing_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_consume?;
        let elapsed = now.duration_since(last);
        if elapsed >= self.min_spacing {
            None
        } else {
            Some(self.min_spacing - elapsed)
        }
    }

    /// Re-derive limits from the original settings for the current level
    fn apply_level(&mut self, original: &ThrottleSettings) {
        let factor = 2u32.pow(self.backoff_level) as f64;
        self.max_concurrent = (original.max_concurrent as f64 / factor).max(1.0);
        self.refill_per_second = (original.refill_per_second / factor).max(MIN_REFILL);
        let spacing = Duration::from_millis(original.min_spacing_ms) * 2u32.pow(self.backoff_level);
        self.min_spacing = spacing.min(MAX_SPACING);
        self.capacity = self.capacity.min(self.max_concurrent);
    }
}

/// Shared request throttle
pub struct Throttle {
    original: ThrottleSettings,
    inner: Mutex<ThrottleInner>,
    notify: Notify,
}

impl Throttle {
    /// Create a throttle from settings; the bucket starts full
    pub fn new(settings: ThrottleSettings) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(ThrottleInner {
                capacity: settings.max_concurrent as f64,
                max_concurrent: settings.max_concurrent as f64,
                refill_per_second: settings.refill_per_second,
                min_spacing: Duration::from_millis(settings.min_spacing_ms),
                last_refill: now,
                last_consume: None,
                backoff_level: 0,
                last_backoff: None,
                waiters: VecDeque::new(),
                next_ticket: 0,
                consumed: 0,
            }),
            original: settings,
            notify: Notify::new(),
        }
    }

    /// Block until one virtual token is consumed
    ///
    /// This is the only suspension point the throttle introduces. Waiters
    /// are served strictly in arrival order; a caller that finds a token
    /// free proceeds immediately only when nobody is queued ahead of it.
    pub async fn acquire(&self) {
        let ticket = {
            let mut inner = self.inner.lock().await;
            let ticket = inner.next_ticket;
            inner.next_ticket += 1;
            inner.waiters.push_back(ticket);
            ticket
        };

        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                inner.refill(now);

                if inner.waiters.front() != Some(&ticket) {
                    // Not at the head; parked until a consumption wakes us
                    None
                } else if inner.capacity < 1.0 {
                    let deficit = 1.0 - inner.capacity;
                    Some(Duration::from_secs_f64(deficit / inner.refill_per_second))
                } else if let Some(remaining) = inner.spacing_remaining(now) {
                    Some(remaining)
                } else {
                    inner.capacity -= 1.0;
                    inner.last_consume = Some(now);
                    inner.consumed += 1;
                    inner.waiters.pop_front();
                    drop(inner);
                    self.notify.notify_waiters();
                    return;
                }
            };

            match wait {
                Some(d) => tokio::time::sleep(d.max(Duration::from_millis(1))).await,
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(WAITER_RECHECK) => {}
                    }
                }
            }
        }
    }

    /// Tighten limits after a 429/402: halve capacity (min 1), double
    /// spacing (cap 5 s), halve refill (min 0.1/s), up to three levels
    pub async fn backoff(&self) {
        let mut inner = self.inner.lock().await;
        if inner.backoff_level < MAX_BACKOFF_LEVEL {
            inner.backoff_level += 1;
        }
        inner.last_backoff = Some(Instant::now());
        inner.apply_level(&self.original);
        warn!(
            level = inner.backoff_level,
            max_concurrent = inner.max_concurrent,
            spacing_ms = inner.min_spacing.as_millis() as u64,
            "throttle backing off"
        );
    }

    /// Step back toward the original configuration after a success, once the
    /// cooldown from the last backoff has passed
    pub async fn recover(&self) {
        let mut inner = self.inner.lock().await;
        if inner.backoff_level == 0 {
            return;
        }
        let cooled = inner
            .last_backoff
            .map(|t| t.elapsed() >= RECOVERY_COOLDOWN)
            .unwrap_or(true);
        if !cooled {
            return;
        }
        inner.backoff_level -= 1;
        inner.apply_level(&self.original);
        debug!(level = inner.backoff_level, "throttle recovering");
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Preemptively narrow limits from provider-reported headroom
    pub async fn feed_rate_limit_info(&self, info: &RateLimitInfo) {
        let mut inner = self.inner.lock().await;

        if let Some(remaining) = info.remaining_requests {
            // Never let the bucket promise more than the server will accept
            inner.capacity = inner.capacity.min(remaining as f64);

            if remaining <= 2 {
                if let Some(reset) = info.reset_seconds {
                    let spread = Duration::from_secs_f64(reset / (remaining.max(1) as f64));
                    inner.min_spacing = inner.min_spacing.max(spread).min(MAX_SPACING);
                }
                debug!(remaining, "throttle tightened from rate-limit headroom");
            }
        }

        if info.remaining_tokens == Some(0) {
            inner.capacity = 0.0;
        }
    }

    /// Current backoff level (0 = original limits)
    pub async fn backoff_level(&self) -> u32 {
        self.inner.lock().await.backoff_level
    }

    /// Total tokens consumed so far
    pub async fn consumed(&self) -> u64 {
        self.inner.lock().await.consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn settings(max_concurrent: u32, refill: f64, spacing_ms: u64) -> ThrottleSettings {
        ThrottleSettings {
            max_concurrent,
            refill_per_second: refill,
            min_spacing_ms: spacing_ms,
        }
    }

    #[tokio::test]
    async fn test_acquire_immediate_when_free() {
        let throttle = Throttle::new(settings(2, 10.0, 0));
        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(throttle.consumed().await, 2);
    }

    #[tokio::test]
    async fn test_spacing_enforced() {
        let throttle = Throttle::new(settings(4, 100.0, 80));
        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        throttle.acquire().await;
        // Two spacing gaps of 80ms each
        assert!(start.elapsed() >= Duration::from_millis(160));
    }

    #[tokio::test]
    async fn test_refill_gates_capacity() {
        // One token, refilled at 20/s: second acquire waits ~50ms
        let throttle = Throttle::new(settings(1, 20.0, 0));
        throttle.acquire().await;
        let start = Instant::now();
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let throttle = Arc::new(Throttle::new(settings(1, 50.0, 10)));
        let sequence = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for i in 0..4u64 {
            let throttle = throttle.clone();
            let sequence = sequence.clone();
            handles.push(tokio::spawn(async move {
                // Stagger arrival so queue order is deterministic
                tokio::time::sleep(Duration::from_millis(i * 20)).await;
                throttle.acquire().await;
                (i, sequence.fetch_add(1, Ordering::SeqCst))
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        results.sort_by_key(|(arrival, _)| *arrival);

        // Consumption order must match arrival order
        for (arrival, consumed_at) in results {
            assert_eq!(arrival, consumed_at, "caller {} consumed out of order", arrival);
        }
    }

    #[tokio::test]
    async fn test_backoff_tightens_and_caps() {
        let throttle = Throttle::new(settings(8, 2.0, 400));

        throttle.backoff().await;
        throttle.backoff().await;
        throttle.backoff().await;
        throttle.backoff().await; // beyond the cap, clamped

        assert_eq!(throttle.backoff_level().await, 3);

        let inner = throttle.inner.lock().await;
        assert!((inner.max_concurrent - 1.0).abs() < f64::EPSILON);
        assert!((inner.refill_per_second - 0.25).abs() < 1e-9);
        // 400ms * 2^3 = 3200ms, under the 5s cap
        assert_eq!(inner.min_spacing, Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn test_spacing_capped_at_five_seconds() {
        let throttle = Throttle::new(settings(4, 1.0, 4000));
        throttle.backoff().await;
        let inner = throttle.inner.lock().await;
        assert_eq!(inner.min_spacing, MAX_SPACING);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_waits_for_cooldown() {
        let throttle = Throttle::new(settings(4, 2.0, 100));
        throttle.backoff().await;
        assert_eq!(throttle.backoff_level().await, 1);

        // Within cooldown: no recovery
        throttle.recover().await;
        assert_eq!(throttle.backoff_level().await, 1);

        tokio::time::advance(RECOVERY_COOLDOWN + Duration::from_millis(10)).await;

        throttle.recover().await;
        assert_eq!(throttle.backoff_level().await, 0);
    }

    #[tokio::test]
    async fn test_feed_rate_limit_info_clamps_capacity() {
        let throttle = Throttle::new(settings(8, 2.0, 0));
        throttle
            .feed_rate_limit_info(&RateLimitInfo {
                remaining_requests: Some(1),
                remaining_tokens: None,
                reset_seconds: Some(4.0),
            })
            .await;

        let inner = throttle.inner.lock().await;
        assert!(inner.capacity <= 1.0);
        assert!(inner.min_spacing >= Duration::from_secs(4));
    }
}
