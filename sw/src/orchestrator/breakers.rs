//! Circuit breakers and the adaptive dispatch stagger
//!
//! Two breakers, two failure classes: clustered rate limits pause all
//! dispatching for a fixed window; a run of quality rejections inside one
//! wave bypasses the judge for the rest of that wave. Both self-heal.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

/// Rate-limit events inside this window trip the breaker
const RATE_WINDOW: Duration = Duration::from_secs(30);

/// Events within the window needed to trip
const RATE_THRESHOLD: usize = 3;

/// How long dispatching pauses once tripped
const RATE_PAUSE: Duration = Duration::from_secs(15);

/// Rate-limit circuit breaker with a sliding event window
pub struct RateLimitBreaker {
    events: VecDeque<Instant>,
    open_until: Option<Instant>,
}

impl Default for RateLimitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitBreaker {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            open_until: None,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a rate-limit event. Returns `Some((recent_count, pause))`
    /// when this event trips the breaker open.
    pub fn record(&mut self) -> Option<(usize, Duration)> {
        let now = Instant::now();
        self.prune(now);
        self.events.push_back(now);

        if self.open_until.is_none() && self.events.len() >= RATE_THRESHOLD {
            self.open_until = Some(now + RATE_PAUSE);
            warn!(recent = self.events.len(), pause_secs = RATE_PAUSE.as_secs(), "rate-limit breaker opened");
            return Some((self.events.len(), RATE_PAUSE));
        }
        None
    }

    /// Whether dispatching is currently paused. Returns `closed = true`
    /// exactly once on the first check after the deadline passes.
    pub fn check(&mut self) -> BreakerState {
        match self.open_until {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    self.open_until = None;
                    info!("rate-limit breaker closed");
                    BreakerState::JustClosed
                } else {
                    BreakerState::Open {
                        remaining: deadline - now,
                    }
                }
            }
            None => BreakerState::Closed,
        }
    }

    /// Recent events in the sliding window (for the adaptive stagger)
    pub fn recent_count(&mut self) -> usize {
        self.prune(Instant::now());
        self.events.len()
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { remaining: Duration },
    /// The deadline passed since the last check; emit `circuit.closed`
    JustClosed,
}

/// Quality-gate circuit breaker: consecutive non-pre-flight rejections
/// within one wave bypass the judge for the remainder of that wave
pub struct QualityBreaker {
    consecutive: u32,
    threshold: u32,
    open: bool,
}

impl QualityBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
            open: false,
        }
    }

    /// Record a non-pre-flight rejection. Returns true when this one trips
    /// the breaker.
    pub fn record_rejection(&mut self) -> bool {
        self.consecutive += 1;
        if !self.open && self.consecutive >= self.threshold {
            self.open = true;
            warn!(consecutive = self.consecutive, "quality-gate breaker opened; judging bypassed for this wave");
            return true;
        }
        false
    }

    /// Any passed gate resets the streak (within-wave reset)
    pub fn record_pass(&mut self) {
        self.consecutive = 0;
    }

    /// Wave boundary: streak and open state both reset
    pub fn reset_wave(&mut self) {
        self.consecutive = 0;
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Dispatch stagger that grows with recent rate-limit pressure
pub struct AdaptiveStagger {
    base: Duration,
}

/// Cap on the adaptive stagger
const MAX_STAGGER: Duration = Duration::from_secs(10);

impl AdaptiveStagger {
    pub fn new(base: Duration) -> Self {
        Self { base }
    }

    /// Current stagger: base times (1 + recent rate-limit events), with
    /// ±20% jitter so dispatch bursts do not align across runs
    pub fn current(&self, recent_rate_limits: usize) -> Duration {
        let scaled = (self.base * (1 + recent_rate_limits as u32)).min(MAX_STAGGER);
        scaled.mul_f64(rand::Rng::random_range(&mut rand::rng(), 0.8..1.2))
    }
}
