//! arXiv RSS 2.0 feed handling: the HTTP fetcher and the feed parser that
//! turns raw bytes into structured entries for the normalizer.

use crate::error::{FeedError, FetchError};
use crate::models::{Category, ARXIV_BASE_URL};
use crate::traits::Fetcher;
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use std::time::Duration;

/// One raw feed item, fields exactly as they appeared in the feed. Nothing
/// is validated here; the normalizer decides what is mandatory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedEntry {
    /// The `guid` element, e.g. `oai:arXiv.org:2401.01234v1`.
    pub id: Option<String>,
    pub title: Option<String>,
    /// The `description` element, usually `... Abstract: <text>`.
    pub summary: Option<String>,
    pub authors: Vec<String>,
    pub link: Option<String>,
    /// The `pubDate` element, RFC 2822.
    pub published: Option<String>,
    pub categories: Vec<String>,
}

/// Feed URL for one or more categories, e.g.
/// `https://arxiv.org/rss/cs.AI+math.ST`.
pub fn arxiv_feed_url(categories: &[Category]) -> String {
    let joined = categories
        .iter()
        .map(Category::to_string)
        .collect::<Vec<_>>()
        .join("+");
    format!("{ARXIV_BASE_URL}/rss/{joined}")
}

/// Parses an arXiv RSS 2.0 document into its items. An empty channel is a
/// valid feed with zero entries; a document without an `rss`/`channel` root
/// is malformed.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<FeedEntry>, FeedError> {
    let text = std::str::from_utf8(bytes)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut entry = FeedEntry::default();
    let mut in_item = false;
    let mut saw_channel = false;
    let mut current_tag: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => match start.name().as_ref() {
                b"rss" | b"channel" => saw_channel = true,
                b"item" => {
                    in_item = true;
                    entry = FeedEntry::default();
                }
                name if in_item => {
                    current_tag = Some(String::from_utf8_lossy(name).into_owned());
                }
                _ => {}
            },
            Event::Text(text) => {
                if in_item {
                    let value = text.unescape()?.into_owned();
                    apply_field(&mut entry, current_tag.as_deref(), &value);
                }
            }
            Event::CData(data) => {
                if in_item {
                    let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    apply_field(&mut entry, current_tag.as_deref(), &value);
                }
            }
            Event::End(end) => match end.name().as_ref() {
                b"item" => {
                    in_item = false;
                    entries.push(std::mem::take(&mut entry));
                }
                _ => current_tag = None,
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_channel {
        return Err(FeedError::Malformed(
            "document has no rss channel".to_string(),
        ));
    }

    Ok(entries)
}

fn apply_field(entry: &mut FeedEntry, tag: Option<&str>, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }

    match tag {
        Some("guid") => entry.id = Some(value.to_string()),
        Some("title") => entry.title = Some(value.to_string()),
        Some("description") => {
            // Descriptions can span several text nodes around inline markup.
            match &mut entry.summary {
                Some(summary) => {
                    summary.push(' ');
                    summary.push_str(value);
                }
                None => entry.summary = Some(value.to_string()),
            }
        }
        Some("dc:creator") | Some("creator") => {
            entry
                .authors
                .extend(value.split(", ").map(str::to_string));
        }
        Some("link") => entry.link = Some(value.to_string()),
        Some("pubDate") => entry.published = Some(value.to_string()),
        Some("category") => entry.categories.push(value.to_string()),
        _ => {}
    }
}

/// Default reqwest-backed fetcher for feeds and linked HTML documents.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("arxivist/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = url::Url::parse(url)?;
        let response = self.client.get(parsed).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}
