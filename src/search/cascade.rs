//! Provider cascade: cache check, ordered fallback, backoff and quota gates.
//!
//! One `search` call walks the provider list in order and stops at the
//! first `ok` response. Providers inside a backoff window or over quota
//! are skipped without consuming a pacing slot; 429s and 5xx responses
//! write backoff state and fall through to the next provider. Every
//! attempt is persisted to the result cache, whatever its classification —
//! the cascade itself never fails on a provider error, it always returns a
//! structured outcome.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::SearchConfig;
use crate::db::{DbError, EntityDb, SearchStatus};
use crate::entity::EntityHint;
use crate::normalize::normalize_text;
use crate::search::providers::{
    DuckDuckGoProvider, GoogleCseProvider, SearchProvider, WikidataProvider, WikipediaProvider,
};
use crate::search::rate_limiter::RateLimiter;
use crate::search::SearchResult;

/// Options for one cascade query.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    /// Bypass the cache and hit providers even on a valid cached result.
    pub force_refresh: bool,
    /// Allow a fuzzy (FTS) cache match when the exact key misses.
    pub fuzzy: bool,
    /// Entity-type hint; `symbol` drops the wiki providers.
    pub hint: Option<EntityHint>,
}

/// Why a provider did not produce the answer for this query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// Skipped: inside a backoff window.
    Backoff,
    /// Skipped: daily quota exhausted.
    Quota,
    /// Responded with HTTP 429.
    RateLimited,
    /// Responded with a 5xx.
    ServerError,
    /// Responded, but with an error or unusable payload.
    Error,
    /// Responded with zero results.
    Empty,
}

/// One provider's failure/skip record for a query.
#[derive(Debug, Clone, Serialize)]
pub struct FailedProvider {
    pub provider: String,
    pub reason: FailReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured outcome of one cascade query.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub query: String,
    pub normalized_query: String,
    /// Winning provider name, or `"none"` when every provider failed.
    pub provider: String,
    pub results: Vec<SearchResult>,
    pub status: SearchStatus,
    /// True when the answer came from the cache without a provider call.
    pub cached: bool,
    /// True when the cache hit came through the fuzzy (FTS) path.
    pub fuzzy_hit: bool,
    pub failed_providers: Vec<FailedProvider>,
}

/// Orchestrates RateLimiter + ResultCache + the ordered provider list.
pub struct SearchCascade {
    db: Arc<Mutex<EntityDb>>,
    limiter: Arc<RateLimiter>,
    providers: Vec<Arc<dyn SearchProvider>>,
    config: SearchConfig,
}

impl SearchCascade {
    /// Build the production cascade: DuckDuckGo first, then Google CSE
    /// (only when credentials are configured), then Wikipedia and Wikidata.
    pub fn new(db: Arc<Mutex<EntityDb>>, config: SearchConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("failed to build HTTP client with timeout: {}", e);
                reqwest::Client::new()
            });
        let mut providers: Vec<Arc<dyn SearchProvider>> =
            vec![Arc::new(DuckDuckGoProvider::new(client.clone()))];
        if let Some(credentials) = config.google_cse.clone() {
            providers.push(Arc::new(GoogleCseProvider::new(
                client.clone(),
                credentials,
            )));
        } else {
            log::debug!("Google CSE credentials not configured; provider disabled");
        }
        providers.push(Arc::new(WikipediaProvider::new(client.clone())));
        providers.push(Arc::new(WikidataProvider::new(client)));

        Self::with_providers(db, config, providers)
    }

    /// Cascade over an explicit provider list. Used by tests and by
    /// embedders that bring their own backends.
    pub fn with_providers(
        db: Arc<Mutex<EntityDb>>,
        config: SearchConfig,
        providers: Vec<Arc<dyn SearchProvider>>,
    ) -> Self {
        Self {
            db,
            limiter: Arc::new(RateLimiter::new(config.jitter)),
            providers,
            config,
        }
    }

    /// The shared rate limiter (pacing and backoff state).
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Answer one query: cache first, then the provider cascade.
    pub async fn search(&self, query: &str, opts: SearchOptions) -> Result<SearchOutcome, DbError> {
        let normalized = normalize_text(query);

        if !opts.force_refresh {
            let exact = self
                .db
                .lock()
                .cache_get(&normalized, None, false, true)?;
            let (record, fuzzy_hit) = match exact {
                Some(record) => (Some(record), false),
                None if opts.fuzzy => (
                    self.db.lock().cache_get(&normalized, None, true, true)?,
                    true,
                ),
                None => (None, false),
            };
            if let Some(record) = record {
                if record.status == SearchStatus::Ok {
                    log::debug!(
                        "cache hit for {:?} via {}{}",
                        normalized,
                        record.provider,
                        if fuzzy_hit { " (fuzzy)" } else { "" }
                    );
                    return Ok(SearchOutcome {
                        query: query.to_string(),
                        normalized_query: normalized,
                        provider: record.provider,
                        results: record.results,
                        status: record.status,
                        cached: true,
                        fuzzy_hit,
                        failed_providers: Vec::new(),
                    });
                }
            }
        }

        self.run_providers(query, &normalized, opts.hint).await
    }

    /// Walk the provider list in order, stopping at the first `ok`.
    async fn run_providers(
        &self,
        query: &str,
        normalized: &str,
        hint: Option<EntityHint>,
    ) -> Result<SearchOutcome, DbError> {
        let mut failed: Vec<FailedProvider> = Vec::new();

        for provider in self.providers.iter().filter(|p| p.handles(hint)) {
            let name = provider.name();

            // Backoff gate: in-memory window or the persisted mirror.
            let in_backoff = match self.limiter.backoff_until(name).await {
                Some(until) => Some(until),
                None => self.db.lock().provider_in_backoff(name)?,
            };
            if let Some(until) = in_backoff {
                log::debug!("skipping {}: in backoff until {}", name, until);
                failed.push(FailedProvider {
                    provider: name.to_string(),
                    reason: FailReason::Backoff,
                    error: None,
                });
                continue;
            }

            // Quota gate for metered providers: preempt without a network
            // attempt and without consuming a pacing slot.
            if provider.metered() {
                let used = self.db.lock().cache_daily_usage(name)?;
                if used >= self.config.metered_daily_quota {
                    log::warn!(
                        "skipping {}: daily quota exhausted ({}/{})",
                        name,
                        used,
                        self.config.metered_daily_quota
                    );
                    failed.push(FailedProvider {
                        provider: name.to_string(),
                        reason: FailReason::Quota,
                        error: None,
                    });
                    continue;
                }
            }

            if let Err(e) = self
                .limiter
                .wait_if_needed(name, self.config.rps_for(name))
                .await
            {
                // A backoff window set by a concurrent caller after our gate
                // check; treated the same as the gate.
                log::debug!("skipping {}: {}", name, e);
                failed.push(FailedProvider {
                    provider: name.to_string(),
                    reason: FailReason::Backoff,
                    error: None,
                });
                continue;
            }

            log::info!("searching {} for {:?}", name, normalized);
            let reply = provider.search(normalized).await;

            // Explicit rate-limit signal: fixed backoff, try the next provider.
            if reply.http_code == Some(429) {
                let until = self
                    .limiter
                    .set_backoff(name, self.config.backoff_base_minutes)
                    .await;
                log::warn!("{} rate limited; backing off until {}", name, until);
                self.db.lock().cache_save(
                    name,
                    normalized,
                    &[],
                    SearchStatus::RateLimited,
                    Some(429),
                    reply.error.as_deref(),
                    Some(&until.to_rfc3339()),
                )?;
                failed.push(FailedProvider {
                    provider: name.to_string(),
                    reason: FailReason::RateLimited,
                    error: reply.error,
                });
                continue;
            }

            // Server errors: exponential backoff on the persistent attempt
            // counter, capped and abandoned after the attempt limit.
            if let Some(code) = reply.http_code.filter(|c| (500..600).contains(c)) {
                let attempts = self.db.lock().cache_bump_attempts(name, normalized)?;
                if attempts < self.config.backoff_max_attempts {
                    let minutes = self.exponential_backoff_minutes(attempts);
                    let until = self.limiter.set_backoff(name, minutes).await;
                    log::warn!(
                        "{} returned HTTP {} (attempt {}); backing off {}m",
                        name,
                        code,
                        attempts,
                        minutes
                    );
                    self.db.lock().cache_save(
                        name,
                        normalized,
                        &[],
                        SearchStatus::Error,
                        Some(code),
                        reply.error.as_deref(),
                        Some(&until.to_rfc3339()),
                    )?;
                } else {
                    log::warn!(
                        "{} returned HTTP {} (attempt {}); backoff abandoned",
                        name,
                        code,
                        attempts
                    );
                    self.db.lock().cache_save(
                        name,
                        normalized,
                        &[],
                        SearchStatus::Error,
                        Some(code),
                        reply.error.as_deref(),
                        None,
                    )?;
                }
                failed.push(FailedProvider {
                    provider: name.to_string(),
                    reason: FailReason::ServerError,
                    error: reply.error,
                });
                continue;
            }

            // Classify the response.
            let status = if reply.error.is_some() {
                SearchStatus::Error
            } else if reply.results.is_empty() {
                SearchStatus::Empty
            } else {
                SearchStatus::Ok
            };

            // Repeated empties from a scraping provider usually mean a
            // silent block, not genuinely missing data: short soft block.
            let mut backoff_until = None;
            if status == SearchStatus::Empty && provider.scraping() {
                let recent = self
                    .db
                    .lock()
                    .cache_recent_empty_count(name, self.config.soft_block_window_minutes)?;
                if recent + 1 >= self.config.soft_block_threshold {
                    let until = self
                        .limiter
                        .set_backoff(name, self.config.soft_block_minutes)
                        .await;
                    log::warn!(
                        "{} returned {} empties in {}m; soft-blocking until {}",
                        name,
                        recent + 1,
                        self.config.soft_block_window_minutes,
                        until
                    );
                    backoff_until = Some(until.to_rfc3339());
                }
            }

            self.db.lock().cache_save(
                name,
                normalized,
                &reply.results,
                status,
                reply.http_code,
                reply.error.as_deref(),
                backoff_until.as_deref(),
            )?;

            match status {
                SearchStatus::Ok => {
                    return Ok(SearchOutcome {
                        query: query.to_string(),
                        normalized_query: normalized.to_string(),
                        provider: name.to_string(),
                        results: reply.results,
                        status,
                        cached: false,
                        fuzzy_hit: false,
                        failed_providers: failed,
                    });
                }
                SearchStatus::Error => {
                    log::warn!(
                        "{} failed for {:?}: {}",
                        name,
                        normalized,
                        reply.error.as_deref().unwrap_or("unknown error")
                    );
                    failed.push(FailedProvider {
                        provider: name.to_string(),
                        reason: FailReason::Error,
                        error: reply.error,
                    });
                }
                _ => failed.push(FailedProvider {
                    provider: name.to_string(),
                    reason: FailReason::Empty,
                    error: None,
                }),
            }
        }

        Ok(SearchOutcome {
            query: query.to_string(),
            normalized_query: normalized.to_string(),
            provider: "none".to_string(),
            results: Vec::new(),
            status: SearchStatus::Empty,
            cached: false,
            fuzzy_hit: false,
            failed_providers: failed,
        })
    }

    /// `min(2^attempts × base, max)` minutes.
    fn exponential_backoff_minutes(&self, attempts: u32) -> i64 {
        let factor = 1i64.checked_shl(attempts).unwrap_or(i64::MAX);
        factor
            .saturating_mul(self.config.backoff_base_minutes)
            .min(self.config.backoff_max_minutes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::db::test_util::open_temp_db;
    use crate::search::providers::ProviderReply;
    use crate::search::SearchResult;

    /// Scripted provider: returns a fixed reply and counts calls.
    struct ScriptedProvider {
        name: &'static str,
        reply: ProviderReply,
        calls: AtomicUsize,
        scraping: bool,
        metered: bool,
    }

    impl ScriptedProvider {
        fn new(name: &'static str, reply: ProviderReply) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply,
                calls: AtomicUsize::new(0),
                scraping: false,
                metered: false,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SearchProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn scraping(&self) -> bool {
            self.scraping
        }

        fn metered(&self) -> bool {
            self.metered
        }

        async fn search(&self, _query: &str) -> ProviderReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn ok_reply(title: &str) -> ProviderReply {
        ProviderReply {
            results: vec![SearchResult {
                title: title.to_string(),
                url: "https://example.com".to_string(),
                snippet: "snippet".to_string(),
                relevance_score: 1.0,
                fetch_timestamp: Utc::now().to_rfc3339(),
                source_metadata: serde_json::json!({}),
            }],
            http_code: Some(200),
            error: None,
        }
    }

    fn empty_reply() -> ProviderReply {
        ProviderReply {
            results: Vec::new(),
            http_code: Some(200),
            error: None,
        }
    }

    fn fast_config() -> SearchConfig {
        let mut config = SearchConfig::default();
        // No pacing delays in tests
        config.rate_limits.clear();
        config.default_rps = 10_000.0;
        config
    }

    fn cascade_with(providers: Vec<Arc<dyn SearchProvider>>) -> (tempfile::TempDir, SearchCascade) {
        let (dir, db) = open_temp_db();
        let cascade =
            SearchCascade::with_providers(Arc::new(Mutex::new(db)), fast_config(), providers);
        (dir, cascade)
    }

    #[tokio::test]
    async fn test_short_circuit_on_first_success() {
        let first = ScriptedProvider::new("alpha", ok_reply("hit"));
        let second = ScriptedProvider::new("beta", ok_reply("unused"));
        let (_dir, cascade) =
            cascade_with(vec![first.clone() as Arc<dyn SearchProvider>, second.clone()]);

        let outcome = cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");

        assert_eq!(outcome.provider, "alpha");
        assert_eq!(outcome.status, SearchStatus::Ok);
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
        assert!(outcome.failed_providers.is_empty());
    }

    #[tokio::test]
    async fn test_falls_through_empty_to_next_provider() {
        let first = ScriptedProvider::new("alpha", empty_reply());
        let second = ScriptedProvider::new("beta", ok_reply("hit"));
        let (_dir, cascade) =
            cascade_with(vec![first.clone() as Arc<dyn SearchProvider>, second.clone()]);

        let outcome = cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");

        assert_eq!(outcome.provider, "beta");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(outcome.failed_providers.len(), 1);
        assert_eq!(outcome.failed_providers[0].reason, FailReason::Empty);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_providers() {
        let provider = ScriptedProvider::new("alpha", ok_reply("hit"));
        let (_dir, cascade) = cascade_with(vec![provider.clone() as Arc<dyn SearchProvider>]);

        let first = cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");
        assert!(!first.cached);

        let second = cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");
        assert!(second.cached);
        assert_eq!(second.provider, "alpha");
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let provider = ScriptedProvider::new("alpha", ok_reply("hit"));
        let (_dir, cascade) = cascade_with(vec![provider.clone() as Arc<dyn SearchProvider>]);

        cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");
        let refreshed = cascade
            .search(
                "Apple",
                SearchOptions {
                    force_refresh: true,
                    ..Default::default()
                },
            )
            .await
            .expect("search");

        assert!(!refreshed.cached);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_cached_empty_is_retried() {
        // An empty cached row must not satisfy the next lookup
        let provider = ScriptedProvider::new("alpha", empty_reply());
        let (_dir, cascade) = cascade_with(vec![provider.clone() as Arc<dyn SearchProvider>]);

        cascade
            .search("Unknown GmbH", SearchOptions::default())
            .await
            .expect("search");
        cascade
            .search("Unknown GmbH", SearchOptions::default())
            .await
            .expect("search");

        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_429_sets_backoff_and_skips_until_expiry() {
        let limited = ScriptedProvider::new(
            "alpha",
            ProviderReply {
                results: Vec::new(),
                http_code: Some(429),
                error: Some("too many requests".to_string()),
            },
        );
        let (_dir, cascade) = cascade_with(vec![limited.clone() as Arc<dyn SearchProvider>]);

        let outcome = cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");
        assert_eq!(outcome.provider, "none");
        assert_eq!(outcome.failed_providers[0].reason, FailReason::RateLimited);
        assert_eq!(limited.calls(), 1);

        // Within the window: skipped with reason=backoff, no call made
        let outcome = cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");
        assert_eq!(outcome.failed_providers[0].reason, FailReason::Backoff);
        assert_eq!(limited.calls(), 1);

        // After the window elapses the provider is attempted again
        cascade.limiter().clear_backoff("alpha").await;
        cascade
            .db
            .lock()
            .conn_ref()
            .execute("UPDATE web_search_cache SET backoff_until_utc = NULL", [])
            .expect("clear persisted backoff");
        let outcome = cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");
        assert_eq!(outcome.failed_providers[0].reason, FailReason::RateLimited);
        assert_eq!(limited.calls(), 2);
    }

    #[tokio::test]
    async fn test_5xx_bumps_attempts_and_abandons_backoff_at_cap() {
        let broken = ScriptedProvider::new(
            "alpha",
            ProviderReply {
                results: Vec::new(),
                http_code: Some(503),
                error: Some("service unavailable".to_string()),
            },
        );
        let (_dir, cascade) = cascade_with(vec![broken.clone() as Arc<dyn SearchProvider>]);

        for expected_attempts in 1..=6u32 {
            // Clear backoff so each round actually reaches the provider
            cascade.limiter().clear_backoff("alpha").await;
            cascade
                .db
                .lock()
                .conn_ref()
                .execute("UPDATE web_search_cache SET backoff_until_utc = NULL", [])
                .expect("clear persisted backoff");

            let outcome = cascade
                .search("Apple", SearchOptions::default())
                .await
                .expect("search");
            assert_eq!(outcome.failed_providers[0].reason, FailReason::ServerError);

            let attempts: i64 = cascade
                .db
                .lock()
                .conn_ref()
                .query_row("SELECT attempts FROM web_search_cache", [], |row| row.get(0))
                .expect("attempts");
            assert_eq!(attempts as u32, expected_attempts);

            // Below the cap a backoff window is written; at or above it,
            // the ladder is abandoned
            let in_backoff = cascade.limiter().backoff_until("alpha").await.is_some();
            assert_eq!(in_backoff, expected_attempts < 5);
        }
        assert_eq!(broken.calls(), 6);
    }

    #[tokio::test]
    async fn test_quota_preempts_metered_provider() {
        let metered = Arc::new(ScriptedProvider {
            name: "metered",
            reply: ok_reply("hit"),
            calls: AtomicUsize::new(0),
            scraping: false,
            metered: true,
        });
        let (_dir, cascade) = cascade_with(vec![metered.clone() as Arc<dyn SearchProvider>]);

        // Fill today's quota with ok/empty rows
        {
            let db = cascade.db.lock();
            for i in 0..100 {
                db.cache_save(
                    "metered",
                    &format!("query {}", i),
                    &[],
                    SearchStatus::Empty,
                    Some(200),
                    None,
                    None,
                )
                .expect("seed quota");
            }
        }

        let outcome = cascade
            .search("Apple", SearchOptions::default())
            .await
            .expect("search");
        assert_eq!(outcome.provider, "none");
        assert_eq!(outcome.failed_providers[0].reason, FailReason::Quota);
        assert_eq!(metered.calls(), 0);
    }

    #[tokio::test]
    async fn test_soft_block_after_repeated_empties() {
        let quiet = Arc::new(ScriptedProvider {
            name: "scraper",
            reply: empty_reply(),
            calls: AtomicUsize::new(0),
            scraping: true,
            metered: false,
        });
        let (_dir, cascade) = cascade_with(vec![quiet.clone() as Arc<dyn SearchProvider>]);

        // Two prior empties within the window
        cascade
            .search("query one", SearchOptions::default())
            .await
            .expect("search");
        cascade
            .search("query two", SearchOptions::default())
            .await
            .expect("search");
        assert!(cascade.limiter().backoff_until("scraper").await.is_none());

        // Third empty trips the soft block
        cascade
            .search("query three", SearchOptions::default())
            .await
            .expect("search");
        assert!(cascade.limiter().backoff_until("scraper").await.is_some());
        assert_eq!(quiet.calls(), 3);

        // And the next query is skipped outright
        let outcome = cascade
            .search("query four", SearchOptions::default())
            .await
            .expect("search");
        assert_eq!(outcome.failed_providers[0].reason, FailReason::Backoff);
        assert_eq!(quiet.calls(), 3);
    }

    #[tokio::test]
    async fn test_symbol_hint_filters_providers() {
        struct SymbolShy {
            inner: Arc<ScriptedProvider>,
        }

        #[async_trait]
        impl SearchProvider for SymbolShy {
            fn name(&self) -> &'static str {
                self.inner.name
            }
            fn handles(&self, hint: Option<EntityHint>) -> bool {
                hint != Some(EntityHint::Symbol)
            }
            async fn search(&self, query: &str) -> ProviderReply {
                self.inner.search(query).await
            }
        }

        let shy = ScriptedProvider::new("wiki_like", ok_reply("unused"));
        let general = ScriptedProvider::new("general", ok_reply("hit"));
        let (_dir, cascade) = cascade_with(vec![
            Arc::new(SymbolShy { inner: shy.clone() }) as Arc<dyn SearchProvider>,
            general.clone(),
        ]);

        let outcome = cascade
            .search(
                "AAPL",
                SearchOptions {
                    hint: Some(EntityHint::Symbol),
                    ..Default::default()
                },
            )
            .await
            .expect("search");

        assert_eq!(outcome.provider, "general");
        assert_eq!(shy.calls(), 0);
        assert_eq!(general.calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_cascade_returns_structured_empty() {
        let first = ScriptedProvider::new("alpha", empty_reply());
        let second = ScriptedProvider::new(
            "beta",
            ProviderReply {
                results: Vec::new(),
                http_code: Some(200),
                error: Some("unusable payload".to_string()),
            },
        );
        let (_dir, cascade) =
            cascade_with(vec![first as Arc<dyn SearchProvider>, second]);

        let outcome = cascade
            .search("Nobody Knows Inc", SearchOptions::default())
            .await
            .expect("search");

        assert_eq!(outcome.provider, "none");
        assert_eq!(outcome.status, SearchStatus::Empty);
        assert_eq!(outcome.failed_providers.len(), 2);
        assert_eq!(outcome.failed_providers[0].reason, FailReason::Empty);
        assert_eq!(outcome.failed_providers[1].reason, FailReason::Error);
    }
}
