//! Top-level resolution façade.
//!
//! `resolve` turns a free-text name into a canonical entity (or raw web
//! results) through a fixed stage order: exact alias match, person-name
//! match (when hinted), fuzzy alias match, then the web search cascade.
//! The first non-empty stage wins and tags the result with its provenance.
//!
//! `populate_from_record` is the grounding pipeline's write path: it turns
//! one structured company-info record (org + officers) into entities,
//! aliases, and affiliations, idempotently.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::SearchConfig;
use crate::db::{
    AliasMatch, DbError, EntityDb, NewAffiliation, NewAlias, NewOrg, NewPerson, SearchStatus,
};
use crate::entity::{DbEntity, EntityHint};
use crate::normalize::{normalize_name, normalize_text};
use crate::search::{SearchCascade, SearchOptions, SearchResult};

/// Which stage produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    AliasExact,
    InfosPerson,
    AliasFuzzy,
    WebSearch,
    WebSearchFuzzy,
    NotFound,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::AliasExact => "alias-exact",
            SourceType::InfosPerson => "infos-person",
            SourceType::AliasFuzzy => "alias-fuzzy",
            SourceType::WebSearch => "web-search",
            SourceType::WebSearchFuzzy => "web-search-fuzzy",
            SourceType::NotFound => "not-found",
        }
    }
}

/// Outcome of resolving one name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// The name as asked.
    pub name: String,
    pub source_type: SourceType,
    /// The canonical entity, when a local stage matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<DbEntity>,
    /// Raw provider results, when the web cascade answered.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<SearchResult>,
    /// Winning provider, for web-search resolutions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub confidence: f64,
}

impl Resolution {
    fn not_found(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source_type: SourceType::NotFound,
            entity: None,
            results: Vec::new(),
            provider: None,
            confidence: 0.0,
        }
    }
}

/// One structured company-info record, as delivered by market-data
/// ingestion. Field names mirror the upstream info payload.
#[derive(Debug, Clone, Default)]
pub struct OrgRecord {
    pub symbol: String,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub display_name: Option<String>,
    pub website: Option<String>,
    pub ir_website: Option<String>,
    pub phone: Option<String>,
    pub address1: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub country: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub full_time_employees: Option<i64>,
    pub long_business_summary: Option<String>,
    pub primary_exchange: Option<String>,
}

/// One officer entry from a company-info record.
#[derive(Debug, Clone)]
pub struct OfficerRecord {
    pub name: String,
    pub title: Option<String>,
}

/// Counts from one `populate_from_record` run. Only newly created rows are
/// counted, so a re-run over the same input reports zeros.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulateStats {
    pub orgs_created: usize,
    pub persons_created: usize,
    pub aliases_created: usize,
    pub affiliations_created: usize,
    pub errors: Vec<String>,
}

/// The resolution engine façade: identity store first, cascade second.
pub struct EntityResolver {
    db: Arc<Mutex<EntityDb>>,
    cascade: SearchCascade,
}

impl EntityResolver {
    pub fn new(db: EntityDb, config: SearchConfig) -> Self {
        let db = Arc::new(Mutex::new(db));
        let cascade = SearchCascade::new(db.clone(), config);
        Self { db, cascade }
    }

    /// Resolver over an existing cascade (tests inject scripted providers
    /// this way).
    pub fn with_cascade(db: Arc<Mutex<EntityDb>>, cascade: SearchCascade) -> Self {
        Self { db, cascade }
    }

    /// Shared handle to the identity store.
    pub fn db(&self) -> &Arc<Mutex<EntityDb>> {
        &self.db
    }

    /// Resolve a free-text name to a canonical entity, falling back to the
    /// web cascade when the local store has no match.
    pub async fn resolve(
        &self,
        name: &str,
        hint: Option<EntityHint>,
    ) -> Result<Resolution, DbError> {
        // (a) Exact alias match
        let exact = self.db.lock().find_exact(name)?;
        if let Some(m) = exact.into_iter().next() {
            log::debug!("resolved {:?} via exact alias {:?}", name, m.alias.alias_text);
            return Ok(Resolution {
                name: name.to_string(),
                source_type: SourceType::AliasExact,
                confidence: m.alias.confidence,
                entity: Some(m.entity),
                results: Vec::new(),
                provider: None,
            });
        }

        // (b) Person-name match, only when the caller says this is a person.
        // Given-name equality first; a miss falls back to the prefix
        // derivatives so "Tim Cook" still finds "Timothy Cook".
        if hint == Some(EntityHint::Person) {
            let parts = normalize_name(name);
            if let Some(family_norm) = parts.family_norm.as_deref() {
                let mut confidence = if parts.given_norm.is_some() { 0.9 } else { 0.7 };
                let mut persons =
                    self.db
                        .lock()
                        .find_person(family_norm, parts.given_norm.as_deref(), None)?;
                if persons.is_empty() && parts.given_prefix3.is_some() {
                    persons = self.db.lock().find_person(
                        family_norm,
                        None,
                        parts.given_prefix3.as_deref(),
                    )?;
                    confidence = 0.8;
                }
                if let Some(person) = persons.into_iter().next() {
                    log::debug!("resolved {:?} via person-name match", name);
                    return Ok(Resolution {
                        name: name.to_string(),
                        source_type: SourceType::InfosPerson,
                        confidence,
                        entity: Some(person),
                        results: Vec::new(),
                        provider: None,
                    });
                }
            }
        }

        // (c) Fuzzy alias match over the FTS index
        let fuzzy = self.db.lock().find_fuzzy(name)?;
        if let Some(m) = best_fuzzy_match(name, fuzzy) {
            log::debug!("resolved {:?} via fuzzy alias {:?}", name, m.alias.alias_text);
            return Ok(Resolution {
                name: name.to_string(),
                source_type: SourceType::AliasFuzzy,
                confidence: m.alias.confidence,
                entity: Some(m.entity),
                results: Vec::new(),
                provider: None,
            });
        }

        // (d) Web search cascade
        let outcome = self
            .cascade
            .search(
                name,
                SearchOptions {
                    fuzzy: true,
                    hint,
                    ..Default::default()
                },
            )
            .await?;
        if outcome.status == SearchStatus::Ok && !outcome.results.is_empty() {
            let source_type = if outcome.cached && outcome.fuzzy_hit {
                SourceType::WebSearchFuzzy
            } else {
                SourceType::WebSearch
            };
            let confidence = outcome.results[0].relevance_score.clamp(0.0, 1.0);
            return Ok(Resolution {
                name: name.to_string(),
                source_type,
                confidence,
                entity: None,
                results: outcome.results,
                provider: Some(outcome.provider),
            });
        }

        log::debug!("{:?} not found in any stage", name);
        Ok(Resolution::not_found(name))
    }

    /// Ground one company-info record: upsert the org and its aliases, then
    /// each officer as a person with an affiliation edge. Safe to re-run
    /// over the same input — every write path is idempotent by key.
    ///
    /// A failure on one officer is logged and recorded in the stats without
    /// aborting the record; a failure storing the org aborts the record.
    pub fn populate_from_record(
        &self,
        org: &OrgRecord,
        officers: &[OfficerRecord],
    ) -> Result<PopulateStats, DbError> {
        let mut stats = PopulateStats::default();
        let db = self.db.lock();

        let canonical = org
            .long_name
            .as_deref()
            .or(org.short_name.as_deref())
            .or(org.display_name.as_deref())
            .unwrap_or(org.symbol.as_str())
            .to_string();

        let fields = NewOrg {
            canonical_full: canonical.clone(),
            display_name: org
                .display_name
                .clone()
                .or_else(|| org.short_name.clone())
                .or_else(|| Some(org.symbol.clone())),
            sector: org.sector.clone(),
            industry: org.industry.clone(),
            website: org.website.clone(),
            ir_website: org.ir_website.clone(),
            phone: org.phone.clone(),
            address1: org.address1.clone(),
            city: org.city.clone(),
            state: org.state.clone(),
            zip: org.zip.clone(),
            country: org.country.clone(),
            full_time_employees: org.full_time_employees,
            long_business_summary: org.long_business_summary.clone(),
        };
        let org_id = match db.get_org_by_canonical(&canonical)? {
            Some(existing) => {
                // Re-population refreshes the whole company-info field set
                db.update_org(existing.entity_id, &fields)?;
                existing.entity_id
            }
            None => {
                let id = db.insert_org(&fields)?;
                stats.orgs_created += 1;
                id
            }
        };

        // The canonical name itself is an alias so exact resolution works
        // without special-casing.
        let mut canonical_alias = NewAlias::new(org_id, canonical.clone(), "canonical_full");
        canonical_alias.source = Some("infos".to_string());
        if db.insert_alias(&canonical_alias)? {
            stats.aliases_created += 1;
        }

        if org.symbol != canonical {
            let mut symbol_alias = NewAlias::new(org_id, org.symbol.clone(), "symbol");
            symbol_alias.normalized = Some(org.symbol.to_lowercase());
            symbol_alias.is_primary = true;
            symbol_alias.primary_exchange = org.primary_exchange.clone();
            symbol_alias.source = Some("infos".to_string());
            if db.insert_alias(&symbol_alias)? {
                stats.aliases_created += 1;
            }
        }
        let symbol_alias_id = db.alias_id(org_id, &org.symbol, "symbol")?;

        for (alias_type, text) in [
            ("long_name", org.long_name.as_deref()),
            ("short_name", org.short_name.as_deref()),
            ("display_name", org.display_name.as_deref()),
        ] {
            let Some(text) = text else { continue };
            if text == canonical {
                continue;
            }
            let mut alias = NewAlias::new(org_id, text, alias_type);
            alias.source = Some("infos".to_string());
            if db.insert_alias(&alias)? {
                stats.aliases_created += 1;
            }
        }

        for officer in officers {
            if let Err(e) = self.populate_officer(&db, org_id, symbol_alias_id, officer, &mut stats)
            {
                let msg = format!("officer {:?}: {}", officer.name, e);
                log::warn!("populate {}: {}", org.symbol, msg);
                stats.errors.push(msg);
            }
        }

        Ok(stats)
    }

    fn populate_officer(
        &self,
        db: &EntityDb,
        org_id: i64,
        symbol_alias_id: Option<i64>,
        officer: &OfficerRecord,
        stats: &mut PopulateStats,
    ) -> Result<(), DbError> {
        let parts = normalize_name(&officer.name);
        // Need at least a given and a family name to key a person
        let (Some(given), Some(family)) = (parts.given.clone(), parts.family.clone()) else {
            log::debug!("skipping officer {:?}: not enough name tokens", officer.name);
            return Ok(());
        };

        let person_id = match db.get_person_by_key(&given, &family)? {
            Some(existing) => existing.entity_id,
            None => {
                let id = db.insert_person(&NewPerson {
                    canonical_full: officer.name.clone(),
                    display_name: Some(format!("{} {}", given, family)),
                    given,
                    middle: parts.middle.clone(),
                    family,
                    given_norm: parts.given_norm.clone(),
                    family_norm: parts.family_norm.clone(),
                    given_initial: parts.given_initial.clone(),
                    given_prefix3: parts.given_prefix3.clone(),
                    middle_initials: parts.middle_initials.clone(),
                    full_norm_no_honor: parts.full_norm_no_honor.clone(),
                })?;
                stats.persons_created += 1;
                id
            }
        };

        let mut name_alias = NewAlias::new(person_id, officer.name.clone(), "canonical_full");
        name_alias.source = Some("infos".to_string());
        if db.insert_alias(&name_alias)? {
            stats.aliases_created += 1;
        }
        if let Some(full_norm) = parts.full_norm_no_honor.as_deref() {
            if full_norm != officer.name {
                let mut norm_alias = NewAlias::new(person_id, full_norm, "full_norm_no_honor");
                norm_alias.source = Some("infos".to_string());
                if db.insert_alias(&norm_alias)? {
                    stats.aliases_created += 1;
                }
            }
        }

        let (_, created) = db.insert_affiliation(&NewAffiliation {
            person_id,
            org_id,
            role_title: officer.title.clone().unwrap_or_default(),
            symbol_alias_id,
            valid_from: None,
            valid_to: None,
            source: Some("infos".to_string()),
            confidence: Some(1.0),
        })?;
        if created {
            stats.affiliations_created += 1;
        }

        Ok(())
    }
}

/// Pick the winning fuzzy match. The store already orders by confidence
/// and primacy; Jaro-Winkler similarity against the folded query breaks
/// the remaining ties.
fn best_fuzzy_match(query: &str, matches: Vec<AliasMatch>) -> Option<AliasMatch> {
    let folded = normalize_text(query);
    matches.into_iter().max_by(|a, b| {
        let key = |m: &AliasMatch| {
            (
                m.alias.confidence,
                m.alias.is_primary as u8 as f64,
                strsim::jaro_winkler(m.alias.normalized.as_deref().unwrap_or(""), &folded),
            )
        };
        let (ac, ap, asim) = key(a);
        let (bc, bp, bsim) = key(b);
        (ac, ap, asim)
            .partial_cmp(&(bc, bp, bsim))
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}
