//! Per-provider request pacing and backoff tracking.
//!
//! One lazily-created async mutex per provider serializes callers of the
//! same provider; the pacing sleep happens while that mutex is held, which
//! is exactly what spaces concurrent callers out. Backoff windows are
//! checked without sleeping — a provider inside its window fails fast with
//! [`RateLimitError`] so the cascade can move on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngExt;
use tokio::sync::Mutex as AsyncMutex;

/// A provider is inside a backoff window; the call was not attempted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("provider {provider} is in backoff until {until}")]
pub struct RateLimitError {
    pub provider: String,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ProviderState {
    last_request: Option<Instant>,
    backoff_until: Option<DateTime<Utc>>,
}

/// Rate limiter shared by all providers of one cascade.
///
/// Constructed once per process and passed by reference; per-provider
/// state is created lazily and never removed.
pub struct RateLimiter {
    jitter: (f64, f64),
    states: Mutex<HashMap<String, Arc<AsyncMutex<ProviderState>>>>,
}

impl RateLimiter {
    pub fn new(jitter: (f64, f64)) -> Self {
        Self {
            jitter,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn state(&self, provider: &str) -> Arc<AsyncMutex<ProviderState>> {
        self.states
            .lock()
            .entry(provider.to_string())
            .or_default()
            .clone()
    }

    /// Gate one outbound call: fail fast if the provider is in backoff,
    /// otherwise sleep out the remainder of the jittered pacing interval.
    ///
    /// An expired backoff window is cleared on the way through.
    pub async fn wait_if_needed(&self, provider: &str, rps: f64) -> Result<(), RateLimitError> {
        let state = self.state(provider);
        let mut guard = state.lock().await;

        if let Some(until) = guard.backoff_until {
            if Utc::now() < until {
                return Err(RateLimitError {
                    provider: provider.to_string(),
                    until,
                });
            }
            guard.backoff_until = None;
        }

        if rps > 0.0 {
            let min_interval = 1.0 / rps;
            let jitter_mult = rand::rng().random_range(self.jitter.0..=self.jitter.1);
            let target = Duration::from_secs_f64(min_interval * jitter_mult);
            if let Some(last) = guard.last_request {
                let elapsed = last.elapsed();
                if elapsed < target {
                    tokio::time::sleep(target - elapsed).await;
                }
            }
        }

        guard.last_request = Some(Instant::now());
        Ok(())
    }

    /// Record a backoff window for a provider; returns the expiry.
    pub async fn set_backoff(&self, provider: &str, minutes: i64) -> DateTime<Utc> {
        let until = Utc::now() + chrono::Duration::minutes(minutes);
        self.state(provider).lock().await.backoff_until = Some(until);
        until
    }

    /// Drop a provider's backoff window.
    pub async fn clear_backoff(&self, provider: &str) {
        self.state(provider).lock().await.backoff_until = None;
    }

    /// Current backoff expiry, if the provider is inside a window.
    /// Expired windows are cleared.
    pub async fn backoff_until(&self, provider: &str) -> Option<DateTime<Utc>> {
        let state = self.state(provider);
        let mut guard = state.lock().await;
        match guard.backoff_until {
            Some(until) if until > Utc::now() => Some(until),
            Some(_) => {
                guard.backoff_until = None;
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_fails_fast() {
        let limiter = RateLimiter::new((0.7, 1.3));
        limiter.set_backoff("duckduckgo", 15).await;

        let err = limiter
            .wait_if_needed("duckduckgo", 10.0)
            .await
            .unwrap_err();
        assert_eq!(err.provider, "duckduckgo");
        assert!(err.until > Utc::now());

        // Other providers are unaffected
        limiter.wait_if_needed("wikipedia", 1000.0).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_backoff_is_cleared() {
        let limiter = RateLimiter::new((0.7, 1.3));
        limiter.set_backoff("duckduckgo", -1).await;

        assert!(limiter.backoff_until("duckduckgo").await.is_none());
        limiter.wait_if_needed("duckduckgo", 1000.0).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_spaces_out_calls() {
        let limiter = RateLimiter::new((1.0, 1.0));

        // First call goes through immediately
        limiter.wait_if_needed("wikipedia", 2.0).await.unwrap();

        // Second call must wait out the ~500ms interval; with the tokio
        // clock paused, sleep only completes via auto-advance.
        let before = tokio::time::Instant::now();
        limiter.wait_if_needed("wikipedia", 2.0).await.unwrap();
        let waited = before.elapsed();
        assert!(waited >= Duration::from_millis(400), "waited {:?}", waited);
    }

    #[tokio::test]
    async fn test_clear_backoff() {
        let limiter = RateLimiter::new((0.7, 1.3));
        limiter.set_backoff("google_cse", 60).await;
        limiter.clear_backoff("google_cse").await;
        assert!(limiter.backoff_until("google_cse").await.is_none());
    }
}
