//! Canonical entity records.
//!
//! One `entities` row per real-world org or person. Orgs carry the
//! company-info fields; persons carry the name decomposition the matcher
//! indexes. The uniqueness key differs by type: `canonical_full` for orgs,
//! raw `(given, family)` for persons.

use serde::{Deserialize, Serialize};

/// Discriminant for the `entities` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Org,
    Person,
}

impl EntityType {
    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Org => "org",
            EntityType::Person => "person",
        }
    }

    /// Parse from SQL string. The schema CHECK constraint makes anything
    /// else unreachable; unknown values decode as org.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "person" => EntityType::Person,
            _ => EntityType::Org,
        }
    }
}

/// Caller-supplied hint about what kind of thing a name refers to.
///
/// Steers the resolver (person-name matching) and the cascade (ticker-like
/// strings skip the wiki providers, which handle them poorly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityHint {
    Org,
    Person,
    Symbol,
}

impl EntityHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityHint::Org => "org",
            EntityHint::Person => "person",
            EntityHint::Symbol => "symbol",
        }
    }
}

/// A row from the `entities` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbEntity {
    pub entity_id: i64,
    pub entity_type: EntityType,
    pub canonical_full: String,
    pub display_name: Option<String>,

    // Org fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ir_website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_time_employees: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_business_summary: Option<String>,

    // Person fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_norm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_norm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_initial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_prefix3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_initials: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_norm_no_honor: Option<String>,

    pub created_at: String,
    pub updated_at: String,
}
