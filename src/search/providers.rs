//! Web search providers.
//!
//! Four implementations behind one trait: DuckDuckGo (HTML scraping),
//! Google CSE (metered JSON API), Wikipedia (search + extracts API), and
//! Wikidata (SPARQL). Provider failures are data, not panics — every
//! `search` returns a [`ProviderReply`] carrying results, the HTTP status,
//! and an optional error message, mirroring what the cascade persists.
//!
//! Response parsing is split into pure functions so it can be exercised
//! against canned fixtures without a network.

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::GoogleCseCredentials;
use crate::entity::EntityHint;
use crate::search::SearchResult;

pub const DUCKDUCKGO: &str = "duckduckgo";
pub const GOOGLE_CSE: &str = "google_cse";
pub const WIKIPEDIA: &str = "wikipedia";
pub const WIKIDATA: &str = "wikidata";

const WIKIPEDIA_API: &str = "https://en.wikipedia.org/w/api.php";
const WIKIDATA_SPARQL: &str = "https://query.wikidata.org/sparql";
const DUCKDUCKGO_HTML: &str = "https://html.duckduckgo.com/html/";
const GOOGLE_CSE_API: &str = "https://www.googleapis.com/customsearch/v1";

/// UA for the API providers.
const API_USER_AGENT: &str = "grounder/0.3 (news entity grounding; +https://github.com)";
/// Browser-style UA for the scraping provider.
const SCRAPE_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Outcome of one provider call: results plus the raw signals the cascade
/// classifies on.
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub results: Vec<SearchResult>,
    pub http_code: Option<u16>,
    pub error: Option<String>,
}

impl ProviderReply {
    fn ok(results: Vec<SearchResult>, http_code: u16) -> Self {
        Self {
            results,
            http_code: Some(http_code),
            error: None,
        }
    }

    fn failed(http_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            http_code,
            error: Some(error.into()),
        }
    }
}

/// A single external search backend.
///
/// The cascade filters and schedules providers through the capability
/// methods instead of matching on concrete types.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this provider is worth querying for the given hint.
    fn handles(&self, hint: Option<EntityHint>) -> bool {
        let _ = hint;
        true
    }

    /// Metered providers are subject to the daily quota gate.
    fn metered(&self) -> bool {
        false
    }

    /// Scraping providers are subject to the empty-response soft-block
    /// heuristic (repeated empties usually mean a silent block).
    fn scraping(&self) -> bool {
        false
    }

    async fn search(&self, query: &str) -> ProviderReply;
}

fn make_result(
    provider: &str,
    title: String,
    url: String,
    snippet: String,
    relevance_score: f64,
    extra: Value,
) -> SearchResult {
    let mut metadata = json!({ "provider": provider });
    if let (Some(meta), Some(extra)) = (metadata.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            meta.insert(k.clone(), v.clone());
        }
    }
    SearchResult {
        title,
        url,
        snippet,
        relevance_score,
        fetch_timestamp: Utc::now().to_rfc3339(),
        source_metadata: metadata,
    }
}

/// Map a completed HTTP response to the (status, body) pair the parsers
/// consume, converting 429 and non-success codes into failed replies.
async fn read_response(response: reqwest::Response) -> Result<(u16, String), ProviderReply> {
    let code = response.status().as_u16();
    if code == 429 {
        return Err(ProviderReply::failed(Some(429), "rate limited (HTTP 429)"));
    }
    if !response.status().is_success() {
        return Err(ProviderReply::failed(Some(code), format!("HTTP {}", code)));
    }
    match response.text().await {
        Ok(body) => Ok((code, body)),
        Err(e) => Err(ProviderReply::failed(Some(code), e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// DuckDuckGo (HTML scraping, fragile by nature)
// ---------------------------------------------------------------------------

pub struct DuckDuckGoProvider {
    client: Client,
}

impl DuckDuckGoProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoProvider {
    fn name(&self) -> &'static str {
        DUCKDUCKGO
    }

    fn scraping(&self) -> bool {
        true
    }

    async fn search(&self, query: &str) -> ProviderReply {
        let response = match self
            .client
            .get(DUCKDUCKGO_HTML)
            .query(&[("q", query)])
            .header(reqwest::header::USER_AGENT, SCRAPE_USER_AGENT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProviderReply::failed(None, e.to_string()),
        };
        let (code, body) = match read_response(response).await {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };
        ProviderReply::ok(parse_duckduckgo_html(&body), code)
    }
}

fn ddg_result_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
            .expect("ddg result pattern is valid")
    })
}

fn ddg_snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)class="result__snippet"[^>]*>(.*?)</a>"#)
            .expect("ddg snippet pattern is valid")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"))
}

/// Strip markup and decode the handful of entities DDG emits.
fn clean_html_text(fragment: &str) -> String {
    let stripped = tag_re().replace_all(fragment, "");
    stripped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unwrap DDG's `/l/?uddg=<encoded>` redirect links to the target URL.
fn unwrap_ddg_url(href: &str) -> String {
    let absolute = if href.starts_with("//") {
        format!("https:{}", href)
    } else if href.starts_with('/') {
        format!("https://duckduckgo.com{}", href)
    } else {
        href.to_string()
    };
    if let Ok(parsed) = url::Url::parse(&absolute) {
        if parsed.path().starts_with("/l/") {
            if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
                return target.into_owned();
            }
        }
    }
    absolute
}

/// Extract results from the DDG HTML SERP. The markup is not an API and
/// changes without notice; selectors are matched loosely on class names.
/// The page is split into per-result blocks so a missing snippet in one
/// result cannot shift the pairing for the rest.
pub(crate) fn parse_duckduckgo_html(html: &str) -> Vec<SearchResult> {
    html.split("<div class=\"result")
        .skip(1)
        .filter_map(|block| {
            let caps = ddg_result_re().captures(block)?;
            let url = unwrap_ddg_url(&caps[1]);
            let title = clean_html_text(&caps[2]);
            let snippet = ddg_snippet_re()
                .captures(block)
                .map(|c| clean_html_text(&c[1]))
                .unwrap_or_default();
            Some((title, url, snippet))
        })
        .enumerate()
        .map(|(i, (title, url, snippet))| {
            let score = (1.0 - i as f64 * 0.15).max(0.1);
            make_result(DUCKDUCKGO, title, url, snippet, score, json!({}))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Wikipedia (search API + intro extracts)
// ---------------------------------------------------------------------------

pub struct WikipediaProvider {
    client: Client,
}

impl WikipediaProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchProvider for WikipediaProvider {
    fn name(&self) -> &'static str {
        WIKIPEDIA
    }

    /// Wiki search performs poorly on ticker-like strings.
    fn handles(&self, hint: Option<EntityHint>) -> bool {
        hint != Some(EntityHint::Symbol)
    }

    async fn search(&self, query: &str) -> ProviderReply {
        // Step 1: title search with snippets.
        let response = match self
            .client
            .get(WIKIPEDIA_API)
            .query(&[
                ("action", "query"),
                ("list", "search"),
                ("srsearch", query),
                ("srlimit", "10"),
                ("srnamespace", "0"),
                ("format", "json"),
            ])
            .header(reqwest::header::USER_AGENT, API_USER_AGENT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProviderReply::failed(None, e.to_string()),
        };
        let (code, body) = match read_response(response).await {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };
        let data: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => return ProviderReply::failed(Some(code), format!("parse error: {}", e)),
        };

        let search_hits = match data["query"]["search"].as_array() {
            Some(hits) if !hits.is_empty() => hits.clone(),
            _ => return ProviderReply::ok(Vec::new(), code),
        };

        // Step 2: intro extracts for the top pages only, to keep the call
        // count down. A failure here degrades to search snippets.
        let top_titles: Vec<&str> = search_hits
            .iter()
            .take(5)
            .filter_map(|hit| hit["title"].as_str())
            .collect();
        let extracts = self.fetch_extracts(&top_titles).await;

        ProviderReply::ok(build_wikipedia_results(&search_hits, &extracts), code)
    }
}

impl WikipediaProvider {
    async fn fetch_extracts(&self, titles: &[&str]) -> Value {
        if titles.is_empty() {
            return Value::Null;
        }
        let joined = titles.join("|");
        let response = self
            .client
            .get(WIKIPEDIA_API)
            .query(&[
                ("action", "query"),
                ("prop", "extracts"),
                ("exintro", "1"),
                ("exsentences", "5"),
                ("explaintext", "1"),
                ("titles", joined.as_str()),
                ("format", "json"),
            ])
            .header(reqwest::header::USER_AGENT, API_USER_AGENT)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => r.json().await.unwrap_or(Value::Null),
            Ok(r) => {
                log::debug!("wikipedia extracts request returned HTTP {}", r.status());
                Value::Null
            }
            Err(e) => {
                log::debug!("wikipedia extracts request failed: {}", e);
                Value::Null
            }
        }
    }
}

/// Merge search hits with intro extracts into ranked results.
pub(crate) fn build_wikipedia_results(search_hits: &[Value], extracts: &Value) -> Vec<SearchResult> {
    let pages = extracts["query"]["pages"].as_object();

    search_hits
        .iter()
        .enumerate()
        .filter_map(|(i, hit)| {
            let title = hit["title"].as_str()?;
            // Search snippets come back with <span class="searchmatch"> markup
            let mut snippet = clean_html_text(hit["snippet"].as_str().unwrap_or(""));

            if let Some(pages) = pages {
                for page in pages.values() {
                    if page["title"].as_str() == Some(title) {
                        if let Some(extract) = page["extract"].as_str() {
                            snippet = extract.split_whitespace().collect::<Vec<_>>().join(" ");
                        }
                        break;
                    }
                }
            }

            let url = format!("https://en.wikipedia.org/wiki/{}", title.replace(' ', "_"));
            let score = (1.0 - i as f64 * 0.1).max(0.1);
            let extra = json!({ "page_id": hit["pageid"] });
            Some(make_result(
                WIKIPEDIA,
                title.to_string(),
                url,
                snippet,
                score,
                extra,
            ))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Wikidata (SPARQL over labels and alt-labels)
// ---------------------------------------------------------------------------

pub struct WikidataProvider {
    client: Client,
}

impl WikidataProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchProvider for WikidataProvider {
    fn name(&self) -> &'static str {
        WIKIDATA
    }

    fn handles(&self, hint: Option<EntityHint>) -> bool {
        hint != Some(EntityHint::Symbol)
    }

    async fn search(&self, query: &str) -> ProviderReply {
        let sparql = wikidata_sparql(query);
        let response = match self
            .client
            .get(WIKIDATA_SPARQL)
            .query(&[("query", sparql.as_str()), ("format", "json")])
            .header(reqwest::header::USER_AGENT, API_USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/sparql-results+json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProviderReply::failed(None, e.to_string()),
        };
        let (code, body) = match read_response(response).await {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };
        let data: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => return ProviderReply::failed(Some(code), format!("parse error: {}", e)),
        };
        ProviderReply::ok(parse_wikidata_bindings(&data), code)
    }
}

/// Label/alt-label lookup with an optional English Wikipedia sitelink.
fn wikidata_sparql(query: &str) -> String {
    let escaped = query.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"SELECT DISTINCT ?item ?itemLabel ?itemDescription ?article WHERE {{
  {{ ?item rdfs:label "{q}"@en . }}
  UNION
  {{ ?item skos:altLabel "{q}"@en . }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language "en" . }}
  OPTIONAL {{
    ?article schema:about ?item .
    ?article schema:inLanguage "en" .
    ?article schema:isPartOf <https://en.wikipedia.org/> .
  }}
}}
LIMIT 10"#,
        q = escaped
    )
}

pub(crate) fn parse_wikidata_bindings(data: &Value) -> Vec<SearchResult> {
    let bindings = match data["results"]["bindings"].as_array() {
        Some(b) => b,
        None => return Vec::new(),
    };

    bindings
        .iter()
        .enumerate()
        .map(|(i, binding)| {
            let item = binding["item"]["value"].as_str().unwrap_or("");
            let label = binding["itemLabel"]["value"].as_str().unwrap_or("");
            let desc = binding["itemDescription"]["value"].as_str().unwrap_or("");
            let article = binding["article"]["value"].as_str().unwrap_or("");

            // Prefer the Wikipedia sitelink when one exists
            let url = if article.is_empty() { item } else { article };
            let snippet = if desc.is_empty() {
                let qid = item.rsplit('/').next().unwrap_or(item);
                format!(
                    "Wikidata entity: {}",
                    if label.is_empty() { qid } else { label }
                )
            } else {
                desc.to_string()
            };

            let title = if label.is_empty() { "Unknown" } else { label };
            let score = (1.0 - i as f64 * 0.1).max(0.1);
            make_result(
                WIKIDATA,
                title.to_string(),
                url.to_string(),
                snippet,
                score,
                json!({ "wikidata_id": item }),
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Google CSE (metered: 100 queries/day on the free tier)
// ---------------------------------------------------------------------------

pub struct GoogleCseProvider {
    client: Client,
    credentials: GoogleCseCredentials,
}

impl GoogleCseProvider {
    pub fn new(client: Client, credentials: GoogleCseCredentials) -> Self {
        Self {
            client,
            credentials,
        }
    }
}

#[async_trait]
impl SearchProvider for GoogleCseProvider {
    fn name(&self) -> &'static str {
        GOOGLE_CSE
    }

    fn metered(&self) -> bool {
        true
    }

    async fn search(&self, query: &str) -> ProviderReply {
        let response = match self
            .client
            .get(GOOGLE_CSE_API)
            .query(&[
                ("key", self.credentials.api_key.as_str()),
                ("cx", self.credentials.engine_id.as_str()),
                ("q", query),
                ("num", "10"),
            ])
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProviderReply::failed(None, e.to_string()),
        };
        let (code, body) = match read_response(response).await {
            Ok(pair) => pair,
            Err(reply) => return reply,
        };
        let data: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(e) => return ProviderReply::failed(Some(code), format!("parse error: {}", e)),
        };
        ProviderReply::ok(parse_google_cse_items(&data), code)
    }
}

pub(crate) fn parse_google_cse_items(data: &Value) -> Vec<SearchResult> {
    let items = match data["items"].as_array() {
        Some(items) => items,
        None => return Vec::new(),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let title = item["title"].as_str().unwrap_or("").to_string();
            let url = item["link"].as_str().unwrap_or("").to_string();
            let snippet = item["snippet"].as_str().unwrap_or("").to_string();
            let score = (1.0 - i as f64 * 0.1).max(0.1);
            make_result(GOOGLE_CSE, title, url, snippet, score, json!({}))
        })
        .collect()
}
