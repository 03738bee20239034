//! Web search: provider implementations, rate limiting, and the cascade.

pub mod cascade;
pub mod providers;
pub mod rate_limiter;

pub use cascade::{FailReason, FailedProvider, SearchCascade, SearchOptions, SearchOutcome};
pub use providers::{ProviderReply, SearchProvider};
pub use rate_limiter::{RateLimitError, RateLimiter};

use serde::{Deserialize, Serialize};

/// One normalized search hit, as persisted in the result cache.
///
/// Field names are the wire format of `results_json` — snake_case, stable
/// across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub relevance_score: f64,
    pub fetch_timestamp: String,
    #[serde(default)]
    pub source_metadata: serde_json::Value,
}
