//! Per-client admission state for each rate-limiting algorithm.
//!
//! Every state is advanced lazily: nothing runs in the background, each
//! check first catches the state up to `now` and then decides.

use super::{RateLimitResult, RateLimitStrategy};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Sub-buckets per window for the sliding window counter.
const COUNTER_BUCKETS: u64 = 10;

/// Rate parameters shared by every client of one limiter.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub rate: u32,
    pub window: Duration,
    pub burst: u32,
    /// Reference point for sub-bucket numbering.
    pub epoch: Instant,
}

impl Limits {
    /// Units replenished per second.
    fn per_second(&self) -> f64 {
        self.rate as f64 / self.window.as_secs_f64()
    }

    fn secs(value: f64) -> Duration {
        Duration::from_secs_f64(value.max(0.0))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum BucketState {
    TokenBucket {
        tokens: f64,
        last_refill: Instant,
    },
    LeakyBucket {
        level: f64,
        last_leak: Instant,
    },
    FixedWindow {
        window_start: Instant,
        count: u32,
    },
    SlidingWindowLog {
        log: VecDeque<Instant>,
    },
    SlidingWindowCounter {
        buckets: BTreeMap<u64, u32>,
    },
}

impl BucketState {
    /// Fresh state: full bucket, empty windows.
    pub fn new(strategy: RateLimitStrategy, limits: &Limits, now: Instant) -> Self {
        match strategy {
            RateLimitStrategy::TokenBucket => BucketState::TokenBucket {
                tokens: limits.burst as f64,
                last_refill: now,
            },
            RateLimitStrategy::LeakyBucket => BucketState::LeakyBucket {
                level: 0.0,
                last_leak: now,
            },
            RateLimitStrategy::FixedWindow => BucketState::FixedWindow {
                window_start: now,
                count: 0,
            },
            RateLimitStrategy::SlidingWindowLog => BucketState::SlidingWindowLog {
                log: VecDeque::new(),
            },
            RateLimitStrategy::SlidingWindowCounter => BucketState::SlidingWindowCounter {
                buckets: BTreeMap::new(),
            },
        }
    }

    /// Units currently available to this client.
    pub fn available(&mut self, limits: &Limits, now: Instant) -> f64 {
        self.advance(limits, now);
        match self {
            BucketState::TokenBucket { tokens, .. } => *tokens,
            BucketState::LeakyBucket { level, .. } => limits.burst as f64 - *level,
            BucketState::FixedWindow { count, .. } => limits.rate.saturating_sub(*count) as f64,
            BucketState::SlidingWindowLog { log } => {
                limits.rate.saturating_sub(log.len() as u32) as f64
            }
            BucketState::SlidingWindowCounter { buckets } => {
                limits.rate.saturating_sub(buckets.values().sum::<u32>()) as f64
            }
        }
    }

    fn advance(&mut self, limits: &Limits, now: Instant) {
        match self {
            BucketState::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.saturating_duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * limits.per_second()).min(limits.burst as f64);
                *last_refill = now;
            }
            BucketState::LeakyBucket { level, last_leak } => {
                let elapsed = now.saturating_duration_since(*last_leak).as_secs_f64();
                *level = (*level - elapsed * limits.per_second()).max(0.0);
                *last_leak = now;
            }
            BucketState::FixedWindow {
                window_start,
                count,
            } => {
                let elapsed = now.saturating_duration_since(*window_start);
                if elapsed >= limits.window {
                    // Keep windows aligned to the first request.
                    let window = limits.window.as_nanos().max(1);
                    let elapsed = elapsed.as_nanos();
                    *window_start += from_nanos(elapsed - elapsed % window);
                    *count = 0;
                }
            }
            BucketState::SlidingWindowLog { log } => {
                while log
                    .front()
                    .is_some_and(|t| now.saturating_duration_since(*t) >= limits.window)
                {
                    log.pop_front();
                }
            }
            BucketState::SlidingWindowCounter { buckets } => {
                let current = counter_bucket(limits, now);
                let oldest_kept = current.saturating_sub(COUNTER_BUCKETS - 1);
                buckets.retain(|&b, _| b >= oldest_kept);
            }
        }
    }

    /// Try to spend `cost` units at `now`.
    pub fn check(&mut self, limits: &Limits, now: Instant, cost: u32) -> RateLimitResult {
        self.advance(limits, now);
        let cost_f = cost as f64;
        let per_second = limits.per_second();

        match self {
            BucketState::TokenBucket { tokens, .. } => {
                let allowed = *tokens >= cost_f;
                let retry_after = if allowed {
                    *tokens -= cost_f;
                    None
                } else {
                    Some(Limits::secs((cost_f - *tokens) / per_second))
                };
                RateLimitResult {
                    allowed,
                    remaining: tokens.floor() as u32,
                    retry_after,
                    reset_after: Limits::secs((limits.burst as f64 - *tokens) / per_second),
                }
            }
            BucketState::LeakyBucket { level, .. } => {
                let capacity = limits.burst as f64;
                let allowed = *level + cost_f <= capacity;
                let retry_after = if allowed {
                    *level += cost_f;
                    None
                } else {
                    Some(Limits::secs((*level + cost_f - capacity) / per_second))
                };
                RateLimitResult {
                    allowed,
                    remaining: (capacity - *level).max(0.0).floor() as u32,
                    retry_after,
                    reset_after: Limits::secs(*level / per_second),
                }
            }
            BucketState::FixedWindow {
                window_start,
                count,
            } => {
                let reset_after = (*window_start + limits.window).saturating_duration_since(now);
                let allowed = count.saturating_add(cost) <= limits.rate;
                if allowed {
                    *count += cost;
                }
                RateLimitResult {
                    allowed,
                    remaining: limits.rate.saturating_sub(*count),
                    retry_after: (!allowed).then_some(reset_after),
                    reset_after,
                }
            }
            BucketState::SlidingWindowLog { log } => {
                let allowed = log.len() as u64 + cost as u64 <= limits.rate as u64;
                if allowed {
                    log.extend(std::iter::repeat(now).take(cost as usize));
                }
                // The oldest entry is the next to leave the window.
                let until_oldest_expires = log
                    .front()
                    .map(|t| (*t + limits.window).saturating_duration_since(now))
                    .unwrap_or_default();
                RateLimitResult {
                    allowed,
                    remaining: limits.rate.saturating_sub(log.len() as u32),
                    retry_after: (!allowed).then_some(until_oldest_expires),
                    reset_after: log
                        .back()
                        .map(|t| (*t + limits.window).saturating_duration_since(now))
                        .unwrap_or_default(),
                }
            }
            BucketState::SlidingWindowCounter { buckets } => {
                let current = counter_bucket(limits, now);
                let bucket_len = from_nanos(bucket_nanos(limits));
                let total: u32 = buckets.values().sum();
                let allowed = total.saturating_add(cost) <= limits.rate;
                if allowed {
                    *buckets.entry(current).or_insert(0) += cost;
                }
                let used = if allowed { total + cost } else { total };

                // A sub-bucket leaves the window COUNTER_BUCKETS buckets after it opened.
                let expiry_of = |bucket: u64| {
                    let opened_plus_window = bucket.saturating_add(COUNTER_BUCKETS) as u128;
                    let expires =
                        limits.epoch + from_nanos(bucket_nanos(limits).saturating_mul(opened_plus_window));
                    expires.saturating_duration_since(now)
                };
                let retry_after = if allowed {
                    None
                } else {
                    Some(
                        buckets
                            .keys()
                            .next()
                            .map(|&b| expiry_of(b))
                            .unwrap_or(bucket_len),
                    )
                };
                RateLimitResult {
                    allowed,
                    remaining: limits.rate.saturating_sub(used),
                    retry_after,
                    reset_after: buckets
                        .keys()
                        .next_back()
                        .map(|&b| expiry_of(b))
                        .unwrap_or_default(),
                }
            }
        }
    }
}

fn bucket_nanos(limits: &Limits) -> u128 {
    (limits.window.as_nanos() / COUNTER_BUCKETS as u128).max(1)
}

fn counter_bucket(limits: &Limits, now: Instant) -> u64 {
    let index = now.saturating_duration_since(limits.epoch).as_nanos() / bucket_nanos(limits);
    u64::try_from(index).unwrap_or(u64::MAX)
}

/// Saturates at roughly 584 years.
fn from_nanos(nanos: u128) -> Duration {
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rate: u32, burst: u32) -> Limits {
        Limits {
            rate,
            window: Duration::from_secs(1),
            burst,
            epoch: Instant::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refills_up_to_capacity() {
        let limits = limits(10, 10);
        let now = Instant::now();
        let mut state = BucketState::new(RateLimitStrategy::TokenBucket, &limits, now);

        assert!(state.check(&limits, now, 10).allowed);
        let denied = state.check(&limits, now, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(100)));

        let later = now + Duration::from_secs(60);
        assert_eq!(state.available(&limits, later), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaky_bucket_drains() {
        let limits = limits(2, 4);
        let now = Instant::now();
        let mut state = BucketState::new(RateLimitStrategy::LeakyBucket, &limits, now);

        for _ in 0..4 {
            assert!(state.check(&limits, now, 1).allowed);
        }
        let denied = state.check(&limits, now, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(500)));

        assert!(state.check(&limits, now + Duration::from_millis(500), 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_resets_on_boundary() {
        let limits = limits(3, 3);
        let start = Instant::now();
        let mut state = BucketState::new(RateLimitStrategy::FixedWindow, &limits, start);

        for _ in 0..3 {
            assert!(state.check(&limits, start, 1).allowed);
        }
        let at = start + Duration::from_millis(400);
        let denied = state.check(&limits, at, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(600)));

        assert!(state.check(&limits, start + Duration::from_millis(2500), 1).allowed);
    }

    const SIXTY_DAYS: Duration = Duration::from_secs(60 * 24 * 60 * 60);

    fn tiny_window() -> Limits {
        Limits {
            window: Duration::from_millis(10),
            ..limits(1, 1)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_bucket_numbering_after_long_uptime() {
        let limits = tiny_window();
        // Over u32::MAX one-millisecond sub-buckets since the epoch.
        let now = limits.epoch + SIXTY_DAYS;
        let mut state = BucketState::new(RateLimitStrategy::SlidingWindowCounter, &limits, now);

        assert!(state.check(&limits, now, 1).allowed);
        let denied = state.check(&limits, now, 1);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(10)));
        assert!(state.check(&limits, now + Duration::from_millis(10), 1).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_alignment_after_long_uptime() {
        let limits = tiny_window();
        let start = limits.epoch;
        let mut state = BucketState::new(RateLimitStrategy::FixedWindow, &limits, start);
        assert!(state.check(&limits, start, 1).allowed);

        let later = start + SIXTY_DAYS + Duration::from_millis(4);
        assert!(state.check(&limits, later, 1).allowed);
        let denied = state.check(&limits, later, 1);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_counter_expires_sub_buckets() {
        let limits = limits(4, 4);
        let start = limits.epoch;
        let mut state = BucketState::new(RateLimitStrategy::SlidingWindowCounter, &limits, start);

        assert!(state.check(&limits, start, 2).allowed);
        assert!(state.check(&limits, start + Duration::from_millis(500), 2).allowed);
        let denied = state.check(&limits, start + Duration::from_millis(600), 1);
        assert!(!denied.allowed);
        // The first sub-bucket leaves the window one second after it opened.
        assert_eq!(denied.retry_after, Some(Duration::from_millis(400)));

        assert!(state.check(&limits, start + Duration::from_millis(1000), 2).allowed);
        assert!(!state.check(&limits, start + Duration::from_millis(1000), 1).allowed);
    }
}
