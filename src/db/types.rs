//! Shared type definitions for the database layer.

use serde::Serialize;
use thiserror::Error;

use crate::entity::{DbEntity, EntityType};
use crate::search::SearchResult;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{entity_type:?} with key {key:?} already exists")]
    DuplicateEntity { entity_type: EntityType, key: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// Fields for a new organization entity. `canonical_full` is the
/// uniqueness key; everything else is optional company-info data.
#[derive(Debug, Clone, Default)]
pub struct NewOrg {
    pub canonical_full: String,
    pub display_name: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub website: Option<String>,
    pub ir_website: Option<String>,
    pub phone: Option<String>,
    pub address1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub full_time_employees: Option<i64>,
    pub long_business_summary: Option<String>,
}

/// Fields for a new person entity. Raw `(given, family)` is the
/// uniqueness key; the `_norm` derivatives come from `normalize_name`.
#[derive(Debug, Clone, Default)]
pub struct NewPerson {
    pub canonical_full: String,
    pub display_name: Option<String>,
    pub given: String,
    pub middle: Option<String>,
    pub family: String,
    pub given_norm: Option<String>,
    pub family_norm: Option<String>,
    pub given_initial: Option<String>,
    pub given_prefix3: Option<String>,
    pub middle_initials: Option<String>,
    pub full_norm_no_honor: Option<String>,
}

/// Fields for a new alias row. When `normalized` is `None` the store
/// derives it with `normalize_text` at insert time.
#[derive(Debug, Clone)]
pub struct NewAlias {
    pub entity_id: i64,
    pub alias_text: String,
    pub alias_type: String,
    pub normalized: Option<String>,
    pub lang: Option<String>,
    pub script: Option<String>,
    pub source: Option<String>,
    pub confidence: f64,
    pub primary_exchange: Option<String>,
    pub is_primary: bool,
}

impl NewAlias {
    /// Alias with the common defaults (confidence 1.0, not primary).
    pub fn new(entity_id: i64, alias_text: impl Into<String>, alias_type: impl Into<String>) -> Self {
        Self {
            entity_id,
            alias_text: alias_text.into(),
            alias_type: alias_type.into(),
            normalized: None,
            lang: None,
            script: None,
            source: None,
            confidence: 1.0,
            primary_exchange: None,
            is_primary: false,
        }
    }
}

/// A row from the `aliases` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAlias {
    pub alias_id: i64,
    pub entity_id: i64,
    pub alias_text: String,
    pub alias_type: String,
    pub normalized: Option<String>,
    pub lang: Option<String>,
    pub script: Option<String>,
    pub source: Option<String>,
    pub confidence: f64,
    pub primary_exchange: Option<String>,
    pub is_primary: bool,
    pub created_at: String,
}

/// An alias hit joined with its owning entity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasMatch {
    pub alias: DbAlias,
    pub entity: DbEntity,
}

/// Fields for a new affiliation edge.
#[derive(Debug, Clone, Default)]
pub struct NewAffiliation {
    pub person_id: i64,
    pub org_id: i64,
    pub role_title: String,
    pub symbol_alias_id: Option<i64>,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
    pub source: Option<String>,
    pub confidence: Option<f64>,
}

/// A person's affiliation joined with the org entity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AffiliationView {
    pub affiliation_id: i64,
    pub org: DbEntity,
    pub role_title: String,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
    pub source: Option<String>,
    pub confidence: Option<f64>,
}

/// Classification of a cached provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    Ok,
    Empty,
    Error,
    RateLimited,
    Pending,
}

impl SearchStatus {
    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchStatus::Ok => "ok",
            SearchStatus::Empty => "empty",
            SearchStatus::Error => "error",
            SearchStatus::RateLimited => "ratelimited",
            SearchStatus::Pending => "pending",
        }
    }

    /// Parse from SQL string; the schema CHECK constraint rules out
    /// anything else, unknown values decode as error.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "ok" => SearchStatus::Ok,
            "empty" => SearchStatus::Empty,
            "ratelimited" => SearchStatus::RateLimited,
            "pending" => SearchStatus::Pending,
            _ => SearchStatus::Error,
        }
    }
}

/// A row from the `web_search_cache` table, results decoded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub provider: String,
    pub normalized_query: String,
    pub results: Vec<SearchResult>,
    pub status: SearchStatus,
    pub http_code: Option<u16>,
    pub error: Option<String>,
    pub fetched_at_utc: String,
    pub attempts: u32,
    pub backoff_until_utc: Option<String>,
}
