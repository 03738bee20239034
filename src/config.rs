//! Search cascade configuration.
//!
//! `SearchConfig::default()` carries the production constants; `from_env`
//! overlays the Google CSE credentials (and the quota override) from the
//! environment so deployments can enable the metered provider without a
//! rebuild.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::search::providers::{DUCKDUCKGO, GOOGLE_CSE, WIKIDATA, WIKIPEDIA};

/// Env var holding the Google Custom Search Engine API key.
pub const ENV_GOOGLE_CSE_API_KEY: &str = "GOOGLE_CUSTOM_SEARCH_ENGINE_API";
/// Env var holding the Google Custom Search Engine id.
pub const ENV_GOOGLE_CSE_ID: &str = "GOOGLE_CUSTOM_SEARCH_ENGINE_ID";
/// Optional env override for the metered provider's daily quota.
pub const ENV_GOOGLE_CSE_DAILY_LIMIT: &str = "GOOGLE_CSE_DAILY_LIMIT";

/// Credentials for the metered Google CSE provider.
#[derive(Debug, Clone)]
pub struct GoogleCseCredentials {
    pub api_key: String,
    pub engine_id: String,
}

/// Tunables for the provider cascade, rate limiter, and result cache.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Steady-state requests per second, per provider name.
    pub rate_limits: HashMap<String, f64>,
    /// Pacing fallback for providers missing from `rate_limits`.
    pub default_rps: f64,
    /// Uniform jitter multiplier range applied to the pacing interval.
    pub jitter: (f64, f64),
    /// Fixed backoff applied on an explicit 429.
    pub backoff_base_minutes: i64,
    /// Cap for the exponential backoff ladder.
    pub backoff_max_minutes: i64,
    /// Server-error attempts after which backoff is abandoned.
    pub backoff_max_attempts: u32,
    /// Duration of the soft block applied when the scraping provider goes quiet.
    pub soft_block_minutes: i64,
    /// Empty responses within the trailing window that trigger a soft block.
    pub soft_block_threshold: u32,
    /// Trailing window for the soft-block heuristic.
    pub soft_block_window_minutes: i64,
    /// Daily request quota for the metered provider (ok/empty responses count).
    pub metered_daily_quota: u32,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
    /// Google CSE credentials; the provider is left out of the cascade when unset.
    pub google_cse: Option<GoogleCseCredentials>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(WIKIPEDIA.to_string(), 0.3);
        rate_limits.insert(WIKIDATA.to_string(), 0.3);
        // Scraping and metered endpoints get a much more conservative pace.
        rate_limits.insert(DUCKDUCKGO.to_string(), 0.1);
        rate_limits.insert(GOOGLE_CSE.to_string(), 0.1);

        Self {
            rate_limits,
            default_rps: 0.5,
            jitter: (0.7, 1.3),
            backoff_base_minutes: 15,
            backoff_max_minutes: 60,
            backoff_max_attempts: 5,
            soft_block_minutes: 5,
            soft_block_threshold: 3,
            soft_block_window_minutes: 30,
            metered_daily_quota: 100,
            http_timeout: Duration::from_secs(15),
            google_cse: None,
        }
    }
}

impl SearchConfig {
    /// Default configuration with Google CSE credentials (and quota
    /// override) pulled from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let api_key = env::var(ENV_GOOGLE_CSE_API_KEY).ok().filter(|v| !v.is_empty());
        let engine_id = env::var(ENV_GOOGLE_CSE_ID).ok().filter(|v| !v.is_empty());
        config.google_cse = match (api_key, engine_id) {
            (Some(api_key), Some(engine_id)) => Some(GoogleCseCredentials { api_key, engine_id }),
            (Some(_), None) => {
                log::warn!("{} set but {} missing; Google CSE disabled", ENV_GOOGLE_CSE_API_KEY, ENV_GOOGLE_CSE_ID);
                None
            }
            (None, Some(_)) => {
                log::warn!("{} set but {} missing; Google CSE disabled", ENV_GOOGLE_CSE_ID, ENV_GOOGLE_CSE_API_KEY);
                None
            }
            (None, None) => None,
        };

        if let Some(quota) = env::var(ENV_GOOGLE_CSE_DAILY_LIMIT)
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.metered_daily_quota = quota;
        }

        config
    }

    /// Steady-state pace for a provider.
    pub fn rps_for(&self, provider: &str) -> f64 {
        self.rate_limits
            .get(provider)
            .copied()
            .unwrap_or(self.default_rps)
    }
}
