//! Entity grounding engine.
//!
//! Resolves free-text names (company names, stock symbols, person names
//! pulled out of news text) into canonical, deduplicated entity records.
//! Resolution tries the local alias store first — exact alias match,
//! person-name match, then FTS fuzzy match — and falls back to a cascade
//! of web search providers with per-provider rate limiting, backoff
//! windows, daily quota accounting, and a persistent result cache.
//!
//! The only entry point external stages use is [`EntityResolver`]:
//!
//! ```no_run
//! use grounder::{EntityDb, EntityHint, EntityResolver, SearchConfig};
//!
//! # async fn demo() -> Result<(), grounder::DbError> {
//! let db = EntityDb::open()?;
//! let resolver = EntityResolver::new(db, SearchConfig::from_env());
//! let resolution = resolver.resolve("Tim Cook", Some(EntityHint::Person)).await?;
//! println!("{} via {}", resolution.name, resolution.source_type.as_str());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod entity;
mod migrations;
pub mod normalize;
pub mod resolver;
pub mod search;

pub use config::{GoogleCseCredentials, SearchConfig};
pub use db::{DbError, EntityDb};
pub use entity::{DbEntity, EntityHint, EntityType};
pub use resolver::{
    EntityResolver, OfficerRecord, OrgRecord, PopulateStats, Resolution, SourceType,
};
pub use search::{
    RateLimitError, RateLimiter, SearchCascade, SearchOptions, SearchOutcome, SearchResult,
};
