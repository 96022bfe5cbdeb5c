//! Per-session sliding-window rate limiter with exponential backoff.
//!
//! Each session key keeps the timestamps of its accepted requests. The window
//! is pruned before every count. When the count reaches `max_per_window` a
//! backoff of `window_ms * 2^strikes` (capped at [`MAX_BACKOFF_MS`]) starts,
//! and every check for that key is rejected until it ends. Strikes accumulate
//! across consecutive episodes and reset after a full quiet window following
//! the last backoff.

use crate::clock::Clock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const MAX_BACKOFF_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_per_window")]
    pub max_per_window: u32,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_per_window() -> u32 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_per_window: default_max_per_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitVerdict {
    Allowed,
    Limited { retry_after_ms: u64, reason: String },
}

impl RateLimitVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitVerdict::Allowed)
    }
}

#[derive(Debug, Default)]
struct KeyState {
    timestamps: VecDeque<i64>,
    backoff_until: i64,
    strikes: u32,
}

/// Owned limiter state. Construct one per manager; nothing is process-global.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn backoff_for(&self, strikes: u32) -> u64 {
        let factor = 2u64.saturating_pow(strikes);
        self.config
            .window_ms
            .saturating_mul(factor)
            .min(MAX_BACKOFF_MS)
    }

    /// Check and, when allowed, record one request for `key`.
    pub fn check(&self, key: &str) -> RateLimitVerdict {
        let now = self.clock.now_ms();
        let window = self.config.window_ms as i64;
        let max = self.config.max_per_window as usize;

        let Ok(mut keys) = self.keys.lock() else {
            return RateLimitVerdict::Limited {
                retry_after_ms: self.config.window_ms,
                reason: "rate limiter state unavailable".to_string(),
            };
        };
        let state = keys.entry(key.to_string()).or_default();

        if state.backoff_until > now {
            let remaining = (state.backoff_until - now) as u64;
            return RateLimitVerdict::Limited {
                retry_after_ms: remaining,
                reason: format!(
                    "backoff active for '{}': retry in {}ms",
                    key, remaining
                ),
            };
        }

        while state
            .timestamps
            .front()
            .is_some_and(|&ts| ts <= now - window)
        {
            state.timestamps.pop_front();
        }

        if state.strikes > 0 && now - state.backoff_until >= window {
            state.strikes = 0;
        }

        let count = state.timestamps.len();
        if count >= max {
            let over = (count - max + 1) as u32;
            state.strikes = state.strikes.saturating_add(over);
            let backoff = self.backoff_for(state.strikes);
            state.backoff_until = now + backoff as i64;
            return RateLimitVerdict::Limited {
                retry_after_ms: backoff,
                reason: format!(
                    "{} requests within {}ms for '{}' (max {}): backing off {}ms",
                    count, self.config.window_ms, key, max, backoff
                ),
            };
        }

        state.timestamps.push_back(now);
        RateLimitVerdict::Allowed
    }

    /// Forget all state for a key.
    pub fn reset(&self, key: &str) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max: u32, window_ms: u64) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let limiter = RateLimiter::new(
            RateLimitConfig {
                window_ms,
                max_per_window: max,
            },
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    fn retry_after(verdict: RateLimitVerdict) -> u64 {
        match verdict {
            RateLimitVerdict::Limited { retry_after_ms, .. } => retry_after_ms,
            RateLimitVerdict::Allowed => panic!("expected a rate-limited verdict"),
        }
    }

    #[test]
    fn test_n_plus_one_request_rejected() {
        let (limiter, _clock) = limiter(3, 1_000);
        for _ in 0..3 {
            assert!(limiter.check("session").is_allowed());
        }
        assert_eq!(retry_after(limiter.check("session")), 2_000);
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter(1, 1_000);
        assert!(limiter.check("a").is_allowed());
        assert!(!limiter.check("a").is_allowed());
        assert!(limiter.check("b").is_allowed());
    }

    #[test]
    fn test_backoff_rejects_regardless_of_window() {
        let (limiter, clock) = limiter(1, 1_000);
        assert!(limiter.check("k").is_allowed());
        assert_eq!(retry_after(limiter.check("k")), 2_000);
        // The window has emptied, but the backoff still applies.
        clock.advance(1_500);
        assert_eq!(retry_after(limiter.check("k")), 500);
    }

    #[test]
    fn test_stale_entries_are_pruned() {
        let (limiter, clock) = limiter(2, 1_000);
        assert!(limiter.check("k").is_allowed());
        assert!(limiter.check("k").is_allowed());
        clock.advance(1_000);
        assert!(limiter.check("k").is_allowed());
    }

    #[test]
    fn test_backoff_strictly_increases_until_cap() {
        let (limiter, clock) = limiter(2, 1_000);
        let mut previous = 0;
        let mut seen_cap = false;
        for _ in 0..12 {
            assert!(limiter.check("k").is_allowed());
            assert!(limiter.check("k").is_allowed());
            let backoff = retry_after(limiter.check("k"));
            assert!(backoff <= MAX_BACKOFF_MS);
            if previous < MAX_BACKOFF_MS {
                assert!(backoff > previous, "backoff {} not above {}", backoff, previous);
            } else {
                assert_eq!(backoff, MAX_BACKOFF_MS);
                seen_cap = true;
            }
            previous = backoff;
            clock.advance(backoff as i64);
        }
        assert!(seen_cap);
    }

    #[test]
    fn test_strikes_reset_after_quiet_window() {
        let (limiter, clock) = limiter(1, 1_000);
        assert!(limiter.check("k").is_allowed());
        assert_eq!(retry_after(limiter.check("k")), 2_000);
        clock.advance(2_000 + 1_000);
        assert!(limiter.check("k").is_allowed());
        assert_eq!(retry_after(limiter.check("k")), 2_000);
    }

    #[test]
    fn test_reset_clears_key() {
        let (limiter, _clock) = limiter(1, 1_000);
        assert!(limiter.check("k").is_allowed());
        assert!(!limiter.check("k").is_allowed());
        limiter.reset("k");
        assert!(limiter.check("k").is_allowed());
    }
}
