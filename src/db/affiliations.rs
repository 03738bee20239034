use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::entities::map_entity_row;
use super::*;

impl EntityDb {
    // =========================================================================
    // Affiliations (person ↔ org edges)
    // =========================================================================

    /// Insert a person↔org affiliation. Idempotent: when the
    /// `(person_id, org_id, role_title)` triple already exists the existing
    /// row id is returned and nothing is written. The bool is true when a
    /// row was actually created.
    pub fn insert_affiliation(&self, aff: &NewAffiliation) -> Result<(i64, bool), DbError> {
        if let Some(existing) = self
            .conn
            .query_row(
                "SELECT affiliation_id FROM affiliations
                 WHERE person_id = ?1 AND org_id = ?2 AND role_title = ?3",
                params![aff.person_id, aff.org_id, aff.role_title],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok((existing, false));
        }

        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO affiliations (
                person_id, org_id, role_title, symbol_alias_id,
                valid_from, valid_to, source, confidence, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                aff.person_id,
                aff.org_id,
                aff.role_title,
                aff.symbol_alias_id,
                aff.valid_from,
                aff.valid_to,
                aff.source,
                aff.confidence,
                now,
            ],
        )?;
        Ok((self.conn.last_insert_rowid(), true))
    }

    /// List a person's affiliations joined with the org entity.
    /// `active_only` keeps only open-ended roles (`valid_to IS NULL`).
    pub fn find_affiliations(
        &self,
        person_id: i64,
        active_only: bool,
    ) -> Result<Vec<AffiliationView>, DbError> {
        let active_clause = if active_only {
            "AND af.valid_to IS NULL"
        } else {
            ""
        };
        let sql = format!(
            "SELECT af.affiliation_id, af.role_title, af.valid_from, af.valid_to,
                    af.source, af.confidence,
                    o.entity_id, o.entity_type, o.canonical_full, o.display_name,
                    o.sector, o.industry, o.website, o.ir_website, o.phone,
                    o.address1, o.city, o.state, o.zip, o.country,
                    o.full_time_employees, o.long_business_summary,
                    o.given, o.middle, o.family, o.given_norm, o.family_norm,
                    o.given_initial, o.given_prefix3, o.middle_initials,
                    o.full_norm_no_honor, o.created_at, o.updated_at
             FROM affiliations af
             JOIN entities o ON o.entity_id = af.org_id
             WHERE af.person_id = ?1 {}
             ORDER BY af.confidence DESC, af.affiliation_id",
            active_clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![person_id], |row| {
            Ok(AffiliationView {
                affiliation_id: row.get(0)?,
                role_title: row.get(1)?,
                valid_from: row.get(2)?,
                valid_to: row.get(3)?,
                source: row.get(4)?,
                confidence: row.get(5)?,
                org: map_entity_row(row, 6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
