use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::entities::fts_escape;
use super::*;
use crate::search::SearchResult;

/// Column list for `web_search_cache`, in `map_cache_row` order.
const CACHE_COLUMNS: &str = "provider, normalized_query, results_json, status, \
     http_code, error, fetched_at_utc, attempts, backoff_until_utc";

/// Same columns prefixed with the `c` table alias, for joins against the
/// FTS table (which shares the `normalized_query` column name).
const CACHE_COLUMNS_C: &str = "c.provider, c.normalized_query, c.results_json, c.status, \
     c.http_code, c.error, c.fetched_at_utc, c.attempts, c.backoff_until_utc";

/// Rank expression implementing the read priority: an `ok` row that
/// actually has results wins over anything else; recency breaks ties.
const CACHE_PRIORITY: &str = "CASE WHEN status = 'ok' AND results_json NOT IN ('[]', '') \
     THEN 0 ELSE 1 END, fetched_at_utc DESC";

fn map_cache_row(row: &Row<'_>) -> rusqlite::Result<CacheRecord> {
    let results_json: String = row.get(2)?;
    let results: Vec<SearchResult> = serde_json::from_str(&results_json).unwrap_or_default();
    Ok(CacheRecord {
        provider: row.get(0)?,
        normalized_query: row.get(1)?,
        results,
        status: SearchStatus::from_str_lossy(&row.get::<_, String>(3)?),
        http_code: row.get::<_, Option<i64>>(4)?.map(|c| c as u16),
        error: row.get(5)?,
        fetched_at_utc: row.get(6)?,
        attempts: row.get::<_, i64>(7)? as u32,
        backoff_until_utc: row.get(8)?,
    })
}

impl EntityDb {
    // =========================================================================
    // Web search cache
    // =========================================================================

    /// Best cached record for a query.
    ///
    /// The exact path matches `normalized_query` equality (optionally pinned
    /// to one provider); the fuzzy path goes through the FTS index instead.
    /// When several rows qualify, `ok`-with-results wins, then the most
    /// recent fetch. With `filter_empty`, rows whose status is
    /// `empty`/`error`/`ratelimited` are treated as cache misses so the
    /// cascade retries providers instead of trusting a known-bad result.
    pub fn cache_get(
        &self,
        normalized_query: &str,
        provider: Option<&str>,
        fuzzy: bool,
        filter_empty: bool,
    ) -> Result<Option<CacheRecord>, DbError> {
        let filter_clause = if filter_empty {
            "AND status NOT IN ('empty', 'error', 'ratelimited')"
        } else {
            ""
        };

        if fuzzy {
            let escaped = fts_escape(normalized_query);
            if escaped.is_empty() {
                return Ok(None);
            }
            let filter_clause = if filter_empty {
                "AND c.status NOT IN ('empty', 'error', 'ratelimited')"
            } else {
                ""
            };
            let sql = format!(
                "SELECT {cols} FROM web_search_cache_fts
                 JOIN web_search_cache c ON c.cache_id = web_search_cache_fts.rowid
                 WHERE web_search_cache_fts MATCH ?1 {provider} {filter}
                 ORDER BY CASE WHEN c.status = 'ok' AND c.results_json NOT IN ('[]', '')
                          THEN 0 ELSE 1 END,
                          c.fetched_at_utc DESC
                 LIMIT 1",
                cols = CACHE_COLUMNS_C,
                provider = provider.map(|_| "AND c.provider = ?2").unwrap_or(""),
                filter = filter_clause,
            );
            let record = match provider {
                Some(p) => self
                    .conn
                    .query_row(&sql, params![escaped, p], map_cache_row)
                    .optional()?,
                None => self
                    .conn
                    .query_row(&sql, params![escaped], map_cache_row)
                    .optional()?,
            };
            return Ok(record);
        }

        let sql = format!(
            "SELECT {cols} FROM web_search_cache
             WHERE normalized_query = ?1 {provider} {filter}
             ORDER BY {priority} LIMIT 1",
            cols = CACHE_COLUMNS,
            provider = provider.map(|_| "AND provider = ?2").unwrap_or(""),
            filter = filter_clause,
            priority = CACHE_PRIORITY,
        );
        let record = match provider {
            Some(p) => self
                .conn
                .query_row(&sql, params![normalized_query, p], map_cache_row)
                .optional()?,
            None => self
                .conn
                .query_row(&sql, params![normalized_query], map_cache_row)
                .optional()?,
        };
        Ok(record)
    }

    /// Upsert the cache row for `(provider, normalized_query)`.
    ///
    /// Overwrites the classification and results but preserves the
    /// persistent `attempts` counter; `backoff_until` is only replaced when
    /// a new value is supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn cache_save(
        &self,
        provider: &str,
        normalized_query: &str,
        results: &[SearchResult],
        status: SearchStatus,
        http_code: Option<u16>,
        error: Option<&str>,
        backoff_until: Option<&str>,
    ) -> Result<(), DbError> {
        let results_json = serde_json::to_string(results)?;
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO web_search_cache (
                provider, normalized_query, results_json, status, http_code,
                error, fetched_at_utc, attempts, backoff_until_utc
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
             ON CONFLICT(provider, normalized_query) DO UPDATE SET
                results_json = excluded.results_json,
                status = excluded.status,
                http_code = excluded.http_code,
                error = excluded.error,
                fetched_at_utc = excluded.fetched_at_utc,
                backoff_until_utc = COALESCE(excluded.backoff_until_utc,
                                             web_search_cache.backoff_until_utc)",
            params![
                provider,
                normalized_query,
                results_json,
                status.as_str(),
                http_code.map(|c| c as i64),
                error,
                now,
                backoff_until,
            ],
        )?;
        Ok(())
    }

    /// Quota accounting: completed lookups (`ok` or `empty`) for a provider
    /// on the current UTC day. Rate-limited and error attempts do not
    /// consume quota.
    pub fn cache_daily_usage(&self, provider: &str) -> Result<u32, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM web_search_cache
             WHERE provider = ?1
               AND status IN ('ok', 'empty')
               AND date(fetched_at_utc) = date('now')",
            params![provider],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Empty responses from a provider within the trailing window, feeding
    /// the soft-block heuristic.
    pub fn cache_recent_empty_count(&self, provider: &str, minutes: i64) -> Result<u32, DbError> {
        let cutoff = (Utc::now() - Duration::minutes(minutes)).to_rfc3339();
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM web_search_cache
             WHERE provider = ?1
               AND status = 'empty'
               AND datetime(fetched_at_utc) >= datetime(?2)",
            params![provider, cutoff],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Increment the persistent attempt counter for `(provider, query)` and
    /// return the new count. Creates a `pending` row when none exists yet,
    /// so the exponential backoff ladder survives process restarts.
    pub fn cache_bump_attempts(
        &self,
        provider: &str,
        normalized_query: &str,
    ) -> Result<u32, DbError> {
        self.with_transaction(|db| {
            let now = Utc::now().to_rfc3339();
            db.conn.execute(
                "INSERT INTO web_search_cache
                    (provider, normalized_query, results_json, status, fetched_at_utc, attempts)
                 VALUES (?1, ?2, '[]', 'pending', ?3, 0)
                 ON CONFLICT(provider, normalized_query) DO NOTHING",
                params![provider, normalized_query, now],
            )?;
            db.conn.execute(
                "UPDATE web_search_cache SET attempts = attempts + 1
                 WHERE provider = ?1 AND normalized_query = ?2",
                params![provider, normalized_query],
            )?;
            let attempts: i64 = db.conn.query_row(
                "SELECT attempts FROM web_search_cache
                 WHERE provider = ?1 AND normalized_query = ?2",
                params![provider, normalized_query],
                |row| row.get(0),
            )?;
            Ok(attempts as u32)
        })
    }

    /// Persisted backoff expiry for a provider, if one is still in the
    /// future. This is the restart-surviving mirror of the limiter's
    /// in-memory windows.
    pub fn provider_in_backoff(&self, provider: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let until: Option<String> = self.conn.query_row(
            "SELECT MAX(backoff_until_utc) FROM web_search_cache
             WHERE provider = ?1 AND backoff_until_utc IS NOT NULL",
            params![provider],
            |row| row.get(0),
        )?;
        Ok(until
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .filter(|dt| *dt > Utc::now()))
    }
}
