//! Per-category story selection.
//!
//! Pure ranking logic plus a thin engine that wires the feed cache and the
//! dedup store together. The engine always returns exactly five entries,
//! padding with placeholders when the category is starved, and never writes
//! to the dedup store itself — marking happens only after transport ack.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::feeds::{Category, FeedFetcher, Item};
use crate::store::Store;

pub const DIGEST_ITEMS: usize = 5;
pub const PER_SOURCE_CAP: usize = 3;
pub const HORIZON_HOURS: i64 = 3;
pub const FALLBACK_HORIZON_HOURS: i64 = 48;

/// One slot in a category block.
#[derive(Debug, Clone)]
pub enum Picked {
    Story(Item),
    /// Deficit filler; carries no fingerprint and never touches the dedup log.
    Placeholder,
}

#[derive(Debug, Clone)]
pub struct Selection {
    /// Always exactly `DIGEST_ITEMS` entries, in display order.
    pub entries: Vec<Picked>,
    /// Category-wide upstream outage (all sources down two cycles running).
    pub outage: bool,
}

impl Selection {
    pub fn stories(&self) -> impl Iterator<Item = &Item> {
        self.entries.iter().filter_map(|p| match p {
            Picked::Story(it) => Some(it),
            Picked::Placeholder => None,
        })
    }

    pub fn placeholder_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|p| matches!(p, Picked::Placeholder))
            .count()
    }
}

/// Ranking score. Recency dominates; reliability breaks the field apart;
/// estimated timestamps are taxed.
pub fn score(item: &Item, now: DateTime<Utc>, horizon_hours: f32) -> f32 {
    let age_hours = (now - item.published_at).num_seconds().max(0) as f32 / 3600.0;
    let recency = (1.0 - age_hours / horizon_hours).max(0.0);
    let penalty = if item.time_estimated { 1.0 } else { 0.0 };
    recency * 0.6 + item.reliability_weight * 0.3 - penalty * 0.1
}

/// Order candidates by score (ties: newest first, then source id), then walk
/// the ranking applying the per-source cap until five are picked.
pub fn rank_and_cap(mut candidates: Vec<Item>, now: DateTime<Utc>, horizon_hours: f32) -> Vec<Item> {
    candidates.sort_by(|a, b| {
        score(b, now, horizon_hours)
            .partial_cmp(&score(a, now, horizon_hours))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.published_at.cmp(&a.published_at))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });

    let mut per_source: HashMap<String, usize> = HashMap::new();
    let mut picked = Vec::with_capacity(DIGEST_ITEMS);
    for item in candidates {
        let used = per_source.entry(item.source_id.clone()).or_insert(0);
        if *used >= PER_SOURCE_CAP {
            continue;
        }
        *used += 1;
        picked.push(item);
        if picked.len() == DIGEST_ITEMS {
            break;
        }
    }
    picked
}

pub struct SelectionEngine {
    feeds: Arc<FeedFetcher>,
    store: Arc<Store>,
}

impl SelectionEngine {
    pub fn new(feeds: Arc<FeedFetcher>, store: Arc<Store>) -> Self {
        SelectionEngine { feeds, store }
    }

    /// Pick exactly five entries for `(chat_id, category)` at time `now`.
    pub fn pick(&self, chat_id: i64, category: Category, now: DateTime<Utc>) -> Result<Selection> {
        let mut outage = false;
        let mut picked: Vec<Item> = Vec::new();

        for horizon_hours in [HORIZON_HOURS, FALLBACK_HORIZON_HOURS] {
            let view = self
                .feeds
                .recent(category, now - Duration::hours(horizon_hours));
            outage = view.outage;

            let fps: Vec<String> = view.items.iter().map(|it| it.fingerprint.clone()).collect();
            let seen = self.store.seen_set(chat_id, &fps)?;
            let fresh: Vec<Item> = view
                .items
                .into_iter()
                .filter(|it| !seen.contains(&it.fingerprint))
                .collect();

            picked = rank_and_cap(fresh, now, horizon_hours as f32);
            if picked.len() == DIGEST_ITEMS {
                break;
            }
        }

        let mut entries: Vec<Picked> = picked.into_iter().map(Picked::Story).collect();
        while entries.len() < DIGEST_ITEMS {
            entries.push(Picked::Placeholder);
        }

        Ok(Selection { entries, outage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(source: &str, title: &str, minutes_ago: i64, weight: f32, estimated: bool) -> Item {
        let now = Utc::now();
        Item {
            source_id: source.to_string(),
            category: Category::Global,
            title: title.to_string(),
            url: format!("https://example.com/{title}"),
            published_at: now - Duration::minutes(minutes_ago),
            fetched_at: now,
            time_estimated: estimated,
            reliability_weight: weight,
            fingerprint: crate::feeds::parse::fingerprint(title, source),
        }
    }

    #[test]
    fn recency_outranks_weight_within_horizon() {
        let now = Utc::now();
        let fresh_low = item("nypost", "fresh", 5, 0.8, false);
        let stale_high = item("reuters-top", "stale", 170, 1.5, false);
        assert!(score(&fresh_low, now, 3.0) > score(&stale_high, now, 3.0));
    }

    #[test]
    fn estimated_time_is_taxed() {
        let now = Utc::now();
        let dated = item("bbc-world", "dated", 30, 1.0, false);
        let estimated = item("bbc-world", "estimated", 30, 1.0, true);
        assert!(score(&dated, now, 3.0) > score(&estimated, now, 3.0));
    }

    #[test]
    fn per_source_cap_holds() {
        let now = Utc::now();
        let candidates = vec![
            item("bbc-world", "a", 1, 1.4, false),
            item("bbc-world", "b", 2, 1.4, false),
            item("bbc-world", "c", 3, 1.4, false),
            item("bbc-world", "d", 4, 1.4, false),
            item("cnn-edition", "e", 50, 1.0, false),
            item("nypost", "f", 60, 0.8, false),
        ];
        let picked = rank_and_cap(candidates, now, 3.0);
        assert_eq!(picked.len(), 5);
        let bbc = picked.iter().filter(|i| i.source_id == "bbc-world").count();
        assert_eq!(bbc, PER_SOURCE_CAP);
    }

    #[test]
    fn caps_at_five() {
        let now = Utc::now();
        let candidates = (0..10)
            .map(|i| item(&format!("s{i}"), &format!("t{i}"), i, 1.0, false))
            .collect();
        assert_eq!(rank_and_cap(candidates, now, 3.0).len(), DIGEST_ITEMS);
    }
}
