//! Name and query normalization.
//!
//! Two pure functions feed the matcher and the cache keys: `normalize_text`
//! folds case, diacritics, and whitespace; `normalize_name` decomposes a
//! person name into the derivatives the identity store indexes
//! (family/given normals, initial, 3-char prefix, middle initials).

use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Honorifics, executive titles, ranks, degrees, and generational suffixes
/// stripped before a name is decomposed. Applied in order, case-insensitive.
const TITLE_PATTERNS: &[&str] = &[
    r"\b(?:Mr\.?|Mrs\.?|Ms\.?|Miss|Dr\.?|Prof\.?|Professor|Sir|Dame|Lord|Lady)\b",
    r"\b(?:CEO|CTO|CFO|COO|President|Chairman|Chairwoman|Director)\b",
    r"\b(?:General|Admiral|Captain|Major|Colonel|Lieutenant)\b",
    r"\b(?:Ph\.?\s?D\.?|PhD|M\.D\.?|MD|J\.D\.?|JD|M\.B\.A\.?|MBA|B\.A\.?|BA|M\.S\.?|MS|B\.S\.?|BS)\b",
    r"\b(?:Sr\.?|Jr\.?|III|IV|V)\b",
];

fn title_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        TITLE_PATTERNS
            .iter()
            .map(|p| Regex::new(&format!("(?i){}", p)).expect("title pattern is valid"))
            .collect()
    })
}

fn edge_punct_regexes() -> &'static (Regex, Regex) {
    static REGEXES: OnceLock<(Regex, Regex)> = OnceLock::new();
    REGEXES.get_or_init(|| {
        (
            Regex::new(r"^\W+").expect("leading punctuation pattern is valid"),
            Regex::new(r"\W+$").expect("trailing punctuation pattern is valid"),
        )
    })
}

/// Fold a string for matching and cache keys: NFKD-decompose, drop
/// combining marks, lowercase, collapse whitespace, trim.
///
/// Pure and total — empty input yields empty output.
pub fn normalize_text(text: &str) -> String {
    let stripped: String = text.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of decomposing a person name.
///
/// Raw fields (`given`, `middle`, `family`) keep the original casing with
/// honorifics removed; the `_norm` fields are `normalize_text` folds.
/// A single-token input is treated as family-name-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameParts {
    pub given: Option<String>,
    pub middle: Option<String>,
    pub family: Option<String>,
    pub given_norm: Option<String>,
    pub family_norm: Option<String>,
    pub given_initial: Option<String>,
    pub given_prefix3: Option<String>,
    pub middle_initials: Option<String>,
    pub full_norm_no_honor: Option<String>,
}

/// Decompose a person's full name into matching derivatives.
///
/// Strips honorific/title/degree/suffix patterns, trims stray punctuation,
/// then splits on whitespace: last token is the family name, first token
/// the given name, and with three or more tokens each middle token
/// contributes the normalized first character of the token to
/// `middle_initials`.
pub fn normalize_name(full_name: &str) -> NameParts {
    let mut parts = NameParts::default();

    let mut name = full_name.trim().to_string();
    if name.is_empty() {
        return parts;
    }

    for re in title_regexes() {
        name = re.replace_all(&name, "").into_owned();
    }

    let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let (leading, trailing) = edge_punct_regexes();
    let name = leading.replace(&name, "").into_owned();
    let name = trailing.replace(&name, "").into_owned();
    if name.is_empty() {
        return parts;
    }

    let tokens: Vec<&str> = name.split_whitespace().collect();
    if tokens.is_empty() {
        return parts;
    }

    let family = tokens[tokens.len() - 1];
    parts.family_norm = non_empty(normalize_text(family));
    if tokens.len() == 1 {
        // Family-name-only: no given-name derivatives.
        return parts;
    }
    parts.family = Some(family.to_string());

    let given = tokens[0];
    parts.given = Some(given.to_string());
    parts.given_norm = non_empty(normalize_text(given));

    if let Some(first) = given.chars().next() {
        parts.given_initial = non_empty(normalize_text(&first.to_string()));
    }
    let prefix: String = given.chars().take(3).collect();
    parts.given_prefix3 = non_empty(normalize_text(&prefix));

    if tokens.len() > 2 {
        let middle_tokens = &tokens[1..tokens.len() - 1];
        parts.middle = Some(middle_tokens.join(" "));
        let initials: String = middle_tokens
            .iter()
            .filter_map(|t| t.replace('.', "").chars().next())
            .map(|c| normalize_text(&c.to_string()))
            .collect();
        parts.middle_initials = non_empty(initials);
    }

    let full: Vec<&str> = [
        parts.given_norm.as_deref(),
        parts.middle_initials.as_deref(),
        parts.family_norm.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !full.is_empty() {
        parts.full_norm_no_honor = Some(full.join(" "));
    }

    parts
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text_folds_diacritics_and_case() {
        assert_eq!(normalize_text("José  María"), "jose maria");
        assert_eq!(normalize_text("  Čapek "), "capek");
        assert_eq!(normalize_text("MÜLLER"), "muller");
    }

    #[test]
    fn test_normalize_text_empty() {
        assert_eq!(normalize_text(""), "");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn test_normalize_name_with_honorific_and_middle() {
        let parts = normalize_name("Mr. Timothy D. Cook");
        assert_eq!(parts.given_norm.as_deref(), Some("timothy"));
        assert_eq!(parts.family_norm.as_deref(), Some("cook"));
        assert_eq!(parts.middle_initials.as_deref(), Some("d"));
        assert_eq!(parts.full_norm_no_honor.as_deref(), Some("timothy d cook"));
        assert_eq!(parts.given_initial.as_deref(), Some("t"));
        assert_eq!(parts.given_prefix3.as_deref(), Some("tim"));
    }

    #[test]
    fn test_normalize_name_degree_suffix() {
        let parts = normalize_name("Mr. August Specht Ph.D.");
        assert_eq!(parts.given_norm.as_deref(), Some("august"));
        assert_eq!(parts.family_norm.as_deref(), Some("specht"));
        assert_eq!(parts.middle_initials, None);
        assert_eq!(parts.full_norm_no_honor.as_deref(), Some("august specht"));
    }

    #[test]
    fn test_normalize_name_empty_input() {
        assert_eq!(normalize_name(""), NameParts::default());
        assert_eq!(normalize_name("   "), NameParts::default());
        // Nothing left after stripping titles
        assert_eq!(normalize_name("Mr. CEO"), NameParts::default());
    }

    #[test]
    fn test_normalize_name_single_token_is_family_only() {
        let parts = normalize_name("Cook");
        assert_eq!(parts.family_norm.as_deref(), Some("cook"));
        assert_eq!(parts.given, None);
        assert_eq!(parts.given_norm, None);
        assert_eq!(parts.given_initial, None);
        assert_eq!(parts.full_norm_no_honor, None);
    }

    #[test]
    fn test_normalize_name_diacritics() {
        let parts = normalize_name("Prof. María José García-López");
        assert_eq!(parts.given_norm.as_deref(), Some("maria"));
        assert_eq!(parts.family_norm.as_deref(), Some("garcia-lopez"));
        assert_eq!(parts.middle_initials.as_deref(), Some("j"));
    }

    #[test]
    fn test_normalize_name_short_given() {
        let parts = normalize_name("T. Cook");
        assert_eq!(parts.given.as_deref(), Some("T."));
        assert_eq!(parts.given_initial.as_deref(), Some("t"));
        // Prefix takes at most the first three chars; "T." folds to "t."
        assert_eq!(parts.given_prefix3.as_deref(), Some("t."));
        assert_eq!(parts.family_norm.as_deref(), Some("cook"));
    }

    #[test]
    fn test_normalize_name_multiple_middles() {
        let parts = normalize_name("CEO John A. B. Doe");
        assert_eq!(parts.given_norm.as_deref(), Some("john"));
        assert_eq!(parts.middle_initials.as_deref(), Some("ab"));
        assert_eq!(parts.family_norm.as_deref(), Some("doe"));
        assert_eq!(parts.full_norm_no_honor.as_deref(), Some("john ab doe"));
    }
}
