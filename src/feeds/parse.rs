//! Feed document parsing and entry normalization.
//!
//! Handles both RSS 2.0 and Atom. Titles are entity-decoded, tag-stripped and
//! whitespace-collapsed before they reach the rest of the pipeline; entries
//! without a usable title or absolute URL are dropped here.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// A single parsed feed entry, before categorization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub title: String,
    pub url: String,
    /// None when the feed omitted the date or it was unparseable.
    pub published: Option<DateTime<Utc>>,
}

/// Parse result for one document.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub entries: Vec<RawEntry>,
    /// Feed-advertised cache TTL (`<ttl>` minutes), if present.
    pub ttl: Option<Duration>,
}

// ---- RSS 2.0 ----

#[derive(Debug, Deserialize)]
struct Rss {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    ttl: Option<u64>,
    #[serde(default)]
    item: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

// ---- Atom ----

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<AtomText>,
    #[serde(default)]
    link: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomText {
    #[serde(rename = "$text")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

/// Parse an XML document, trying RSS 2.0 first, then Atom.
///
/// The root element is checked by name: with every struct field optional or
/// defaulted, serde would otherwise accept any XML as an empty Atom feed.
pub fn parse_feed(xml: &str) -> Result<ParsedFeed> {
    let has_root = |name: &str| {
        xml.contains(&format!("<{name}>")) || xml.contains(&format!("<{name} "))
    };

    if has_root("rss") || has_root("channel") {
        if let Ok(rss) = from_str::<Rss>(xml) {
            let entries = rss
                .channel
                .item
                .into_iter()
                .filter_map(|it| make_entry(it.title, it.link, it.pub_date.as_deref()))
                .collect();
            return Ok(ParsedFeed {
                entries,
                ttl: rss.channel.ttl.map(|m| Duration::from_secs(m * 60)),
            });
        }
    }

    if has_root("feed") {
        if let Ok(atom) = from_str::<AtomFeed>(xml) {
            let entries = atom
                .entry
                .into_iter()
                .filter_map(|e| {
                    // Prefer rel="alternate" links; fall back to the first href.
                    let link = e
                        .link
                        .iter()
                        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
                        .or_else(|| e.link.first())
                        .and_then(|l| l.href.clone());
                    let date = e.published.as_deref().or(e.updated.as_deref());
                    make_entry(e.title.and_then(|t| t.value), link, date)
                })
                .collect();
            return Ok(ParsedFeed { entries, ttl: None });
        }
    }

    Err(anyhow!("document is neither RSS 2.0 nor Atom"))
}

fn make_entry(title: Option<String>, link: Option<String>, date: Option<&str>) -> Option<RawEntry> {
    let title = normalize_title(&title?);
    if title.is_empty() {
        return None;
    }
    let url = link?.trim().to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }
    Some(RawEntry {
        title,
        url,
        published: date.and_then(parse_date),
    })
}

/// Normalize a headline: entity-decode, strip tags, collapse whitespace.
pub fn normalize_title(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // Headline length cap; ellipsis on truncation.
    if out.chars().count() > 300 {
        out = out.chars().take(297).collect::<String>() + "...";
    }
    out
}

/// Parse a feed timestamp. RFC 2822 first (RSS convention), then RFC 3339
/// (Atom), then a couple of naive fallbacks seen in the wild.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) =
        time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc2822)
    {
        return from_unix(dt.unix_timestamp());
    }
    if let Ok(dt) =
        time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
    {
        return from_unix(dt.unix_timestamp());
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d %b %Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

fn from_unix(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

/// Stable identity of a `(title, source)` pair.
///
/// SHA-256 truncated to 16 hex chars; the hash must be stable across
/// processes because it is persisted in the delivery log for a week.
pub fn fingerprint(title: &str, source_id: &str) -> String {
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    let norm = re_ws
        .replace_all(title.trim(), " ")
        .to_lowercase();

    let mut hasher = Sha256::new();
    hasher.update(norm.as_bytes());
    hasher.update(b"|");
    hasher.update(source_id.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}
