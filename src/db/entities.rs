use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::entity::{DbEntity, EntityType};
use crate::normalize::normalize_text;

/// Column list for `entities`, in `map_entity_row` order.
const ENTITY_COLUMNS: &[&str] = &[
    "entity_id",
    "entity_type",
    "canonical_full",
    "display_name",
    "sector",
    "industry",
    "website",
    "ir_website",
    "phone",
    "address1",
    "city",
    "state",
    "zip",
    "country",
    "full_time_employees",
    "long_business_summary",
    "given",
    "middle",
    "family",
    "given_norm",
    "family_norm",
    "given_initial",
    "given_prefix3",
    "middle_initials",
    "full_norm_no_honor",
    "created_at",
    "updated_at",
];

/// Column list for `aliases`, in `map_alias_row` order.
const ALIAS_COLUMNS: &[&str] = &[
    "alias_id",
    "entity_id",
    "alias_text",
    "alias_type",
    "normalized",
    "lang",
    "script",
    "source",
    "confidence",
    "primary_exchange",
    "is_primary",
    "created_at",
];

fn columns(prefix: &str, names: &[&str]) -> String {
    names
        .iter()
        .map(|c| format!("{}.{}", prefix, c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Escape free text for an FTS5 MATCH expression.
///
/// Tokens are stripped to alphanumerics and double-quoted so query syntax
/// characters (`"*^:-()`) are treated as data, never as operators — a
/// malformed query must degrade to no results, not an SQL error. Returns
/// an empty string when nothing searchable remains.
pub fn fts_escape(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{}\"", token))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(super) fn map_entity_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<DbEntity> {
    Ok(DbEntity {
        entity_id: row.get(offset)?,
        entity_type: EntityType::from_str_lossy(&row.get::<_, String>(offset + 1)?),
        canonical_full: row.get(offset + 2)?,
        display_name: row.get(offset + 3)?,
        sector: row.get(offset + 4)?,
        industry: row.get(offset + 5)?,
        website: row.get(offset + 6)?,
        ir_website: row.get(offset + 7)?,
        phone: row.get(offset + 8)?,
        address1: row.get(offset + 9)?,
        city: row.get(offset + 10)?,
        state: row.get(offset + 11)?,
        zip: row.get(offset + 12)?,
        country: row.get(offset + 13)?,
        full_time_employees: row.get(offset + 14)?,
        long_business_summary: row.get(offset + 15)?,
        given: row.get(offset + 16)?,
        middle: row.get(offset + 17)?,
        family: row.get(offset + 18)?,
        given_norm: row.get(offset + 19)?,
        family_norm: row.get(offset + 20)?,
        given_initial: row.get(offset + 21)?,
        given_prefix3: row.get(offset + 22)?,
        middle_initials: row.get(offset + 23)?,
        full_norm_no_honor: row.get(offset + 24)?,
        created_at: row.get(offset + 25)?,
        updated_at: row.get(offset + 26)?,
    })
}

fn map_alias_row(row: &Row<'_>) -> rusqlite::Result<DbAlias> {
    Ok(DbAlias {
        alias_id: row.get(0)?,
        entity_id: row.get(1)?,
        alias_text: row.get(2)?,
        alias_type: row.get(3)?,
        normalized: row.get(4)?,
        lang: row.get(5)?,
        script: row.get(6)?,
        source: row.get(7)?,
        confidence: row.get(8)?,
        primary_exchange: row.get(9)?,
        is_primary: row.get::<_, i64>(10)? != 0,
        created_at: row.get(11)?,
    })
}

fn map_alias_match(row: &Row<'_>) -> rusqlite::Result<AliasMatch> {
    Ok(AliasMatch {
        alias: map_alias_row(row)?,
        entity: map_entity_row(row, ALIAS_COLUMNS.len())?,
    })
}

impl EntityDb {
    // =========================================================================
    // Entities
    // =========================================================================

    /// Insert a new organization. Fails with `DuplicateEntity` when an org
    /// with the same canonical name exists — callers look up before
    /// inserting; re-population reuses the existing row.
    pub fn insert_org(&self, org: &NewOrg) -> Result<i64, DbError> {
        if self.get_org_by_canonical(&org.canonical_full)?.is_some() {
            return Err(DbError::DuplicateEntity {
                entity_type: EntityType::Org,
                key: org.canonical_full.clone(),
            });
        }

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO entities (
                entity_type, canonical_full, display_name, sector, industry,
                website, ir_website, phone, address1, city, state, zip, country,
                full_time_employees, long_business_summary, created_at, updated_at
             ) VALUES ('org', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                org.canonical_full,
                org.display_name,
                org.sector,
                org.industry,
                org.website,
                org.ir_website,
                org.phone,
                org.address1,
                org.city,
                org.state,
                org.zip,
                org.country,
                org.full_time_employees,
                org.long_business_summary,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Insert a new person. Fails with `DuplicateEntity` when a person with
    /// the same raw `(given, family)` key exists.
    pub fn insert_person(&self, person: &NewPerson) -> Result<i64, DbError> {
        if self.get_person_by_key(&person.given, &person.family)?.is_some() {
            return Err(DbError::DuplicateEntity {
                entity_type: EntityType::Person,
                key: format!("{} {}", person.given, person.family),
            });
        }

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO entities (
                entity_type, canonical_full, display_name, given, middle, family,
                given_norm, family_norm, given_initial, given_prefix3,
                middle_initials, full_norm_no_honor, created_at, updated_at
             ) VALUES ('person', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                person.canonical_full,
                person.display_name,
                person.given,
                person.middle,
                person.family,
                person.given_norm,
                person.family_norm,
                person.given_initial,
                person.given_prefix3,
                person.middle_initials,
                person.full_norm_no_honor,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Replace an existing org's company-info fields. Re-population
    /// refreshes the whole field set by key, never a partial subset.
    pub fn update_org(&self, entity_id: i64, org: &NewOrg) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE entities SET
                display_name = ?2, sector = ?3, industry = ?4, website = ?5,
                ir_website = ?6, phone = ?7, address1 = ?8, city = ?9,
                state = ?10, zip = ?11, country = ?12, full_time_employees = ?13,
                long_business_summary = ?14, updated_at = ?15
             WHERE entity_id = ?1 AND entity_type = 'org'",
            params![
                entity_id,
                org.display_name,
                org.sector,
                org.industry,
                org.website,
                org.ir_website,
                org.phone,
                org.address1,
                org.city,
                org.state,
                org.zip,
                org.country,
                org.full_time_employees,
                org.long_business_summary,
                now,
            ],
        )?;
        Ok(())
    }

    /// Look up an org by its canonical name (the org uniqueness key).
    pub fn get_org_by_canonical(&self, canonical_full: &str) -> Result<Option<DbEntity>, DbError> {
        let sql = format!(
            "SELECT {} FROM entities WHERE entity_type = 'org' AND canonical_full = ?1",
            ENTITY_COLUMNS.join(", ")
        );
        Ok(self
            .conn
            .query_row(&sql, params![canonical_full], |row| map_entity_row(row, 0))
            .optional()?)
    }

    /// Look up a person by the raw `(given, family)` uniqueness key.
    pub fn get_person_by_key(&self, given: &str, family: &str) -> Result<Option<DbEntity>, DbError> {
        let sql = format!(
            "SELECT {} FROM entities WHERE entity_type = 'person' AND given = ?1 AND family = ?2",
            ENTITY_COLUMNS.join(", ")
        );
        Ok(self
            .conn
            .query_row(&sql, params![given, family], |row| map_entity_row(row, 0))
            .optional()?)
    }

    /// Fetch an entity by id.
    pub fn get_entity(&self, entity_id: i64) -> Result<Option<DbEntity>, DbError> {
        let sql = format!(
            "SELECT {} FROM entities WHERE entity_id = ?1",
            ENTITY_COLUMNS.join(", ")
        );
        Ok(self
            .conn
            .query_row(&sql, params![entity_id], |row| map_entity_row(row, 0))
            .optional()?)
    }

    // =========================================================================
    // Alias lookup
    // =========================================================================

    /// Exact alias lookup: equality on `aliases.normalized` after folding
    /// the input. Ordered by confidence descending.
    pub fn find_exact(&self, alias_text: &str) -> Result<Vec<AliasMatch>, DbError> {
        let normalized = normalize_text(alias_text);
        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {}, {} FROM aliases a
             JOIN entities e ON e.entity_id = a.entity_id
             WHERE a.normalized = ?1
             ORDER BY a.confidence DESC, a.is_primary DESC, a.alias_id",
            columns("a", ALIAS_COLUMNS),
            columns("e", ENTITY_COLUMNS),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![normalized], map_alias_match)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fuzzy alias lookup through the FTS index (tokenized match, not
    /// substring). Malformed query characters are stripped by `fts_escape`
    /// rather than surfacing an FTS syntax error.
    pub fn find_fuzzy(&self, alias_text: &str) -> Result<Vec<AliasMatch>, DbError> {
        let escaped = fts_escape(alias_text);
        if escaped.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {}, {} FROM aliases_fts
             JOIN aliases a ON a.alias_id = aliases_fts.rowid
             JOIN entities e ON e.entity_id = a.entity_id
             WHERE aliases_fts MATCH ?1
             ORDER BY a.confidence DESC, a.is_primary DESC, a.alias_id",
            columns("a", ALIAS_COLUMNS),
            columns("e", ENTITY_COLUMNS),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![escaped], map_alias_match)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Person lookup by name derivatives. `family` is always required and
    /// matched on `family_norm`; `given` narrows on `given_norm`; failing
    /// that, a prefix of normalized length ≤2 narrows on `given_initial`
    /// and a longer one on `given_prefix3`.
    pub fn find_person(
        &self,
        family: &str,
        given: Option<&str>,
        given_prefix: Option<&str>,
    ) -> Result<Vec<DbEntity>, DbError> {
        let family_norm = normalize_text(family);
        if family_norm.is_empty() {
            return Ok(Vec::new());
        }

        let base = format!(
            "SELECT {} FROM entities WHERE entity_type = 'person' AND family_norm = ?1",
            ENTITY_COLUMNS.join(", ")
        );

        let given_norm = given.map(normalize_text).filter(|g| !g.is_empty());
        if let Some(given_norm) = given_norm {
            let sql = format!("{} AND given_norm = ?2 ORDER BY entity_id", base);
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params![family_norm, given_norm], |row| {
                map_entity_row(row, 0)
            })?;
            return Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?);
        }

        let prefix = given_prefix.map(normalize_text).filter(|p| !p.is_empty());
        if let Some(prefix) = prefix {
            if prefix.chars().count() <= 2 {
                let initial: String = prefix.chars().take(1).collect();
                let sql = format!("{} AND given_initial = ?2 ORDER BY entity_id", base);
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![family_norm, initial], |row| {
                    map_entity_row(row, 0)
                })?;
                return Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?);
            }
            let prefix3: String = prefix.chars().take(3).collect();
            let sql = format!("{} AND given_prefix3 = ?2 ORDER BY entity_id", base);
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(params![family_norm, prefix3], |row| {
                map_entity_row(row, 0)
            })?;
            return Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?);
        }

        let sql = format!("{} ORDER BY entity_id", base);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![family_norm], |row| map_entity_row(row, 0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // =========================================================================
    // Alias insertion
    // =========================================================================

    /// Insert an alias. Re-inserting an existing `(entity_id, alias_text,
    /// alias_type)` is a silent no-op so re-population stays idempotent.
    /// Returns true when a row was actually inserted.
    pub fn insert_alias(&self, alias: &NewAlias) -> Result<bool, DbError> {
        let normalized = match &alias.normalized {
            Some(n) => n.clone(),
            None => normalize_text(&alias.alias_text),
        };
        let now = Utc::now().to_rfc3339();
        let inserted = self.conn.execute(
            "INSERT INTO aliases (
                entity_id, alias_text, alias_type, normalized, lang, script,
                source, confidence, primary_exchange, is_primary, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(entity_id, alias_text, alias_type) DO NOTHING",
            params![
                alias.entity_id,
                alias.alias_text,
                alias.alias_type,
                normalized,
                alias.lang,
                alias.script,
                alias.source,
                alias.confidence,
                alias.primary_exchange,
                alias.is_primary as i64,
                now,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Insert a batch of aliases in one transaction. Within-batch and
    /// against-store duplicates are skipped silently; returns the count of
    /// rows actually inserted.
    pub fn insert_aliases_batch(&self, aliases: &[NewAlias]) -> Result<usize, DbError> {
        self.with_transaction(|db| {
            let mut inserted = 0;
            for alias in aliases {
                if db.insert_alias(alias)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    /// Look up an alias row id by its uniqueness key.
    pub fn alias_id(
        &self,
        entity_id: i64,
        alias_text: &str,
        alias_type: &str,
    ) -> Result<Option<i64>, DbError> {
        Ok(self
            .conn
            .query_row(
                "SELECT alias_id FROM aliases
                 WHERE entity_id = ?1 AND alias_text = ?2 AND alias_type = ?3",
                params![entity_id, alias_text, alias_type],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// All aliases of one entity, highest confidence first.
    pub fn aliases_for_entity(&self, entity_id: i64) -> Result<Vec<DbAlias>, DbError> {
        let sql = format!(
            "SELECT {} FROM aliases WHERE entity_id = ?1
             ORDER BY confidence DESC, is_primary DESC, alias_id",
            ALIAS_COLUMNS.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity_id], map_alias_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::open_temp_db;
    use super::*;

    fn org(canonical: &str) -> NewOrg {
        NewOrg {
            canonical_full: canonical.to_string(),
            display_name: Some(canonical.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_org_rejects_duplicate_canonical() {
        let (_dir, db) = open_temp_db();
        db.insert_org(&org("Apple Inc.")).expect("first insert");
        let err = db.insert_org(&org("Apple Inc.")).unwrap_err();
        assert!(matches!(err, DbError::DuplicateEntity { .. }));
    }

    #[test]
    fn test_insert_person_rejects_duplicate_key() {
        let (_dir, db) = open_temp_db();
        let person = NewPerson {
            canonical_full: "Timothy D. Cook".to_string(),
            given: "Timothy".to_string(),
            family: "Cook".to_string(),
            given_norm: Some("timothy".to_string()),
            family_norm: Some("cook".to_string()),
            ..Default::default()
        };
        db.insert_person(&person).expect("first insert");
        let err = db.insert_person(&person).unwrap_err();
        assert!(matches!(err, DbError::DuplicateEntity { .. }));
    }

    #[test]
    fn test_alias_reinsert_is_silent_noop() {
        let (_dir, db) = open_temp_db();
        let id = db.insert_org(&org("Apple Inc.")).expect("insert org");
        let alias = NewAlias::new(id, "AAPL", "symbol");
        assert!(db.insert_alias(&alias).expect("first insert"));
        assert!(!db.insert_alias(&alias).expect("second insert"));

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM aliases", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn test_batch_insert_counts_only_new_rows() {
        let (_dir, db) = open_temp_db();
        let id = db.insert_org(&org("Apple Inc.")).expect("insert org");
        let batch = vec![
            NewAlias::new(id, "AAPL", "symbol"),
            NewAlias::new(id, "Apple", "short_name"),
            // Within-batch duplicate must not raise
            NewAlias::new(id, "AAPL", "symbol"),
        ];
        assert_eq!(db.insert_aliases_batch(&batch).expect("batch"), 2);
    }

    #[test]
    fn test_find_exact_folds_case_and_diacritics() {
        let (_dir, db) = open_temp_db();
        let id = db.insert_org(&org("Nestlé S.A.")).expect("insert org");
        db.insert_alias(&NewAlias::new(id, "Nestlé", "short_name"))
            .expect("insert alias");

        let matches = db.find_exact("nestle").expect("find");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity.entity_id, id);
    }

    #[test]
    fn test_find_exact_orders_by_confidence() {
        let (_dir, db) = open_temp_db();
        let a = db.insert_org(&org("Alpha Corp")).expect("insert");
        let b = db.insert_org(&org("Beta Corp")).expect("insert");
        let mut low = NewAlias::new(a, "ACME", "short_name");
        low.confidence = 0.4;
        let mut high = NewAlias::new(b, "acme", "short_name");
        high.confidence = 0.9;
        db.insert_alias(&low).expect("insert low");
        db.insert_alias(&high).expect("insert high");

        let matches = db.find_exact("ACME").expect("find");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].entity.entity_id, b);
    }

    #[test]
    fn test_find_fuzzy_matches_tokens() {
        let (_dir, db) = open_temp_db();
        let id = db.insert_org(&org("Apple Inc.")).expect("insert org");
        db.insert_alias(&NewAlias::new(id, "Apple Inc.", "long_name"))
            .expect("insert alias");

        // Tokenized match: a single token of the alias is enough
        let matches = db.find_fuzzy("Apple").expect("find");
        assert_eq!(matches.len(), 1);

        // Not a substring match
        assert!(db.find_fuzzy("Appl").expect("find").is_empty());
    }

    #[test]
    fn test_find_fuzzy_never_raises_on_fts_syntax() {
        let (_dir, db) = open_temp_db();
        for query in ["\"unbalanced", "a AND OR *", "(((", "col:value", "-"] {
            db.find_fuzzy(query).expect("must not raise");
        }
    }

    #[test]
    fn test_fts_escape_strips_operators() {
        assert_eq!(fts_escape("Apple Inc."), "\"Apple\" \"Inc\"");
        assert_eq!(fts_escape("\"quoted\" -neg"), "\"quoted\" \"neg\"");
        assert_eq!(fts_escape("(((*"), "");
    }

    fn seed_person(db: &EntityDb, given: &str, family: &str) -> i64 {
        let parts = crate::normalize::normalize_name(&format!("{} {}", given, family));
        db.insert_person(&NewPerson {
            canonical_full: format!("{} {}", given, family),
            display_name: Some(format!("{} {}", given, family)),
            given: given.to_string(),
            family: family.to_string(),
            given_norm: parts.given_norm,
            family_norm: parts.family_norm,
            given_initial: parts.given_initial,
            given_prefix3: parts.given_prefix3,
            middle_initials: parts.middle_initials,
            full_norm_no_honor: parts.full_norm_no_honor,
            middle: None,
        })
        .expect("insert person")
    }

    #[test]
    fn test_find_person_by_family_only() {
        let (_dir, db) = open_temp_db();
        seed_person(&db, "Timothy", "Cook");
        seed_person(&db, "Jane", "Cook");
        seed_person(&db, "John", "Doe");

        let found = db.find_person("Cook", None, None).expect("find");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_find_person_with_given_name() {
        let (_dir, db) = open_temp_db();
        let tim = seed_person(&db, "Timothy", "Cook");
        seed_person(&db, "Jane", "Cook");

        let found = db.find_person("Cook", Some("Timothy"), None).expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id, tim);
    }

    #[test]
    fn test_find_person_with_prefix() {
        let (_dir, db) = open_temp_db();
        let tim = seed_person(&db, "Timothy", "Cook");
        seed_person(&db, "Jane", "Cook");

        // Short prefix matches on the initial
        let found = db.find_person("Cook", None, Some("T")).expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id, tim);

        // Longer prefix matches on given_prefix3
        let found = db.find_person("Cook", None, Some("Tim")).expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id, tim);

        assert!(db.find_person("Cook", None, Some("Bob")).expect("find").is_empty());
    }

    #[test]
    fn test_alias_cascade_on_entity_delete() {
        let (_dir, db) = open_temp_db();
        let id = db.insert_org(&org("Apple Inc.")).expect("insert org");
        db.insert_alias(&NewAlias::new(id, "AAPL", "symbol"))
            .expect("insert alias");

        db.conn_ref()
            .execute("DELETE FROM entities WHERE entity_id = ?1", params![id])
            .expect("delete entity");
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM aliases", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }
}
