//! Pure normalization of raw feed entries (plus optionally fetched HTML)
//! into canonical [`Document`]s.

use crate::error::NormalizeError;
use crate::feed::FeedEntry;
use crate::models::Document;
use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Upper bound on extracted full text, in characters. Whole-document
/// embedding degrades past this point; the hash covers the same capped text
/// so change detection stays consistent with what was embedded.
pub const FULL_TEXT_CHAR_CAP: usize = 20_000;

/// arXiv RSS summaries carry an announcement preamble before this marker.
const ABSTRACT_MARKER: &str = "Abstract:";

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn script_style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|nav|header|footer)\b.*?</(script|style|nav|header|footer)>")
            .expect("static regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"))
}

/// Strips markup, scripts, and navigation boilerplate from an HTML document,
/// leaving collapsed plain text.
pub fn strip_html(html: &str) -> String {
    let without_blocks = script_style_re().replace_all(html, " ");
    let without_tags = tag_re().replace_all(&without_blocks, " ");
    let decoded = without_tags
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");
    normalize_whitespace(&decoded)
}

/// Digest over the exact text that gets embedded. Hash equality is treated
/// as content equality across re-ingestions.
pub fn content_hash(title: &str, abstract_text: &str, full_text: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(abstract_text.as_bytes());
    if let Some(full_text) = full_text {
        hasher.update(b"\n");
        hasher.update(full_text.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Extracts the bare arXiv id from a `guid` value such as
/// `oai:arXiv.org:2401.01234v1`.
pub fn extract_external_id(raw: &str) -> Result<String, NormalizeError> {
    let id = raw.rsplit(':').next().unwrap_or_default().trim();
    if id.is_empty() || id.contains('/') || id.contains(' ') {
        return Err(NormalizeError::MalformedId(raw.to_string()));
    }
    Ok(id.to_string())
}

/// Canonicalizes one feed entry. Pure function of its inputs: no I/O, no
/// clock. Missing external id or title is a permanent failure; the entry is
/// skipped and reported, never retried.
pub fn normalize(entry: &FeedEntry, raw_html: Option<&str>) -> Result<Document, NormalizeError> {
    let raw_id = entry
        .id
        .as_deref()
        .ok_or(NormalizeError::MissingField("guid"))?;
    let external_id = extract_external_id(raw_id)?;

    let title = entry
        .title
        .as_deref()
        .map(normalize_whitespace)
        .filter(|title| !title.is_empty())
        .ok_or(NormalizeError::MissingField("title"))?;

    let abstract_text = entry
        .summary
        .as_deref()
        .map(extract_abstract)
        .filter(|text| !text.is_empty())
        .ok_or(NormalizeError::MissingField("description"))?;

    let published_raw = entry
        .published
        .as_deref()
        .ok_or(NormalizeError::MissingField("pubDate"))?;
    let published_at = DateTime::parse_from_rfc2822(published_raw)
        .map_err(|_| NormalizeError::MalformedDate(published_raw.to_string()))?
        .with_timezone(&Utc);

    let full_text = raw_html.map(strip_html).filter(|text| !text.is_empty()).map(cap_full_text);

    let authors = entry
        .authors
        .iter()
        .map(|author| normalize_whitespace(author))
        .filter(|author| !author.is_empty())
        .collect();

    let source_url = entry
        .link
        .clone()
        .unwrap_or_else(|| format!("{}/abs/{external_id}", crate::models::ARXIV_BASE_URL));

    let content_hash = content_hash(&title, &abstract_text, full_text.as_deref());

    Ok(Document {
        external_id,
        title,
        abstract_text,
        authors,
        categories: entry.categories.clone(),
        published_at,
        source_url,
        full_text,
        content_hash,
    })
}

fn extract_abstract(summary: &str) -> String {
    let body = match summary.rsplit_once(ABSTRACT_MARKER) {
        Some((_, body)) => body,
        None => summary,
    };
    normalize_whitespace(body)
}

fn cap_full_text(text: String) -> String {
    if text.chars().count() <= FULL_TEXT_CHAR_CAP {
        return text;
    }
    text.chars().take(FULL_TEXT_CHAR_CAP).collect()
}
