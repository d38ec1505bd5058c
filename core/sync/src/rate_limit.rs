//! Sliding-window rate limiting for remote calls.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use minutesync_common::{Error, Result};

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    /// Calls allowed per window.
    pub max_calls: usize,
    /// Window length.
    #[serde(with = "crate::duration_ms")]
    pub window: Duration,
    /// Longest a caller may wait for a slot.
    #[serde(with = "crate::duration_ms")]
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 10,
            window: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

/// Admits at most `max_calls` per sliding `window`.
///
/// Callers that cannot get a slot wait; after `max_wait` they fail with
/// `RateLimitTimeout`.
pub struct RateLimiter {
    config: RateLimitConfig,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.max_calls.max(1);
        Self {
            config,
            calls: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Wait for a call slot.
    ///
    /// # Errors
    /// - `RateLimitTimeout` if no slot frees up within `max_wait`
    pub async fn acquire(&self) -> Result<()> {
        let started = Instant::now();
        let max_calls = self.config.max_calls.max(1);

        loop {
            let wait = {
                let mut calls = self.calls.lock().await;
                let now = Instant::now();
                while calls
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.config.window)
                {
                    calls.pop_front();
                }

                if calls.len() < max_calls {
                    calls.push_back(now);
                    return Ok(());
                }

                match calls.front() {
                    Some(oldest) => (*oldest + self.config.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            if started.elapsed() + wait > self.config.max_wait {
                return Err(Error::RateLimitTimeout(self.config.max_wait));
            }
            debug!("Rate limit reached, waiting {:?}", wait);
            sleep(wait).await;
        }
    }

    /// Calls recorded in the current window.
    pub async fn in_flight(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|t| now.duration_since(**t) < self.config.window)
            .count()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
