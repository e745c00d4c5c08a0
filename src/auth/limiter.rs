//! auth/limiter.rs
//! Fixed-window rate limiter for key-management operations.
//!
//! Dashboard traffic is loopback-only, so a single global window is enough;
//! the cap exists to stop runaway scripts from hammering bcrypt, not to be
//! a fair multi-tenant limiter.

use std::sync::Mutex;

use chrono::Utc;

/// Default cap for key-management calls.
pub const KEY_MANAGEMENT_RATE_LIMIT: u32 = 20;

pub struct RateLimiter {
    max_per_minute: u32,
    // (minute epoch, count within that minute)
    window: Mutex<(i64, u32)>,
}

impl RateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self { max_per_minute, window: Mutex::new((0, 0)) }
    }

    /// Record one call. Returns `false` when the current minute's budget is
    /// exhausted (HTTP 429 in the façade taxonomy).
    pub fn allow(&self) -> bool {
        self.allow_at(Utc::now().timestamp())
    }

    fn allow_at(&self, now_secs: i64) -> bool {
        let minute = now_secs.div_euclid(60);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.0 != minute {
            *window = (minute, 0);
        }
        if window.1 >= self.max_per_minute {
            return false;
        }
        window.1 += 1;
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(KEY_MANAGEMENT_RATE_LIMIT)
    }
}
