//! Digest composition.
//!
//! Builds the full message for one recipient: header, holiday line, weather,
//! the five category blocks, the market block and the footer, in that fixed
//! order. Output is a conservative Markdown subset; anything user-visible
//! that came from a feed goes through `format::escape_markdown` first.

pub mod format;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Offset, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::feeds::{Category, FeedFetcher};
use crate::market::MarketComposer;
use crate::sched::Slot;
use crate::select::{Picked, Selection, SelectionEngine};
use crate::transport::MESSAGE_LIMIT_BYTES;
use crate::weather::{render_weather_block, HolidayService, WeatherService};

use format::{escape_markdown, relative_age};

/// Weather/holiday localization. Personalization beyond timezone is out of
/// scope; the digest reports the home market's city and calendar.
const WEATHER_LOCATION: &str = "Dhaka";
const HOLIDAY_COUNTRY: &str = "BD";

const FOOTER: &str = "━━━━━━━━━━━━━━\n🤖 newsbrief — curated headlines, four times a day";

/// Room reserved in each part for the `(i/n)` marker.
const PART_MARKER_MARGIN: usize = 16;

/// A composed digest ready for the transport.
#[derive(Debug, Clone)]
pub struct ComposedDigest {
    /// One or more messages, each within the transport size limit.
    pub parts: Vec<String>,
    /// Fingerprints of every real story included, for `mark_sent` after ack.
    pub sent_items: Vec<(String, Category)>,
}

pub struct Assembler {
    feeds: Arc<FeedFetcher>,
    selection: SelectionEngine,
    market: Arc<MarketComposer>,
    weather: Option<Arc<WeatherService>>,
    holidays: Option<Arc<HolidayService>>,
}

impl Assembler {
    pub fn new(
        feeds: Arc<FeedFetcher>,
        selection: SelectionEngine,
        market: Arc<MarketComposer>,
        weather: Option<Arc<WeatherService>>,
        holidays: Option<Arc<HolidayService>>,
    ) -> Self {
        Assembler {
            feeds,
            selection,
            market,
            weather,
            holidays,
        }
    }

    pub fn feeds(&self) -> &Arc<FeedFetcher> {
        &self.feeds
    }

    pub fn selection(&self) -> &SelectionEngine {
        &self.selection
    }

    /// Compose the digest for one recipient. `slot` is `None` for on-demand
    /// requests; it only affects the header label.
    pub async fn compose(
        &self,
        chat_id: i64,
        tz: Tz,
        now_utc: DateTime<Utc>,
        slot: Option<Slot>,
    ) -> Result<ComposedDigest> {
        // Bring every category up to date; concurrent jobs coalesce inside
        // the fetcher, so this is cheap when another delivery just ran.
        tokio::join!(
            self.feeds.refresh(Category::Local),
            self.feeds.refresh(Category::Global),
            self.feeds.refresh(Category::Tech),
            self.feeds.refresh(Category::Sports),
            self.feeds.refresh(Category::FinanceCrypto),
        );

        let local = now_utc.with_timezone(&tz);
        let mut blocks: Vec<String> = Vec::new();
        blocks.push(self.header_block(&local, slot).await);

        if let Some(weather) = &self.weather {
            match weather.current(WEATHER_LOCATION).await {
                Ok(w) => blocks.push(render_weather_block(&w)),
                Err(e) => {
                    warn!(error = %e, "weather block degraded");
                    blocks.push("☀️ WEATHER\nWeather data temporarily unavailable.".to_string());
                }
            }
        }

        let mut sent_items = Vec::new();
        for category in Category::ALL {
            let selection = self.selection.pick(chat_id, category, now_utc)?;
            for item in selection.stories() {
                sent_items.push((item.fingerprint.clone(), category));
            }
            blocks.push(render_category_block(category, &selection, now_utc));
        }

        blocks.push(self.market.market_block().await);
        blocks.push(FOOTER.to_string());

        Ok(ComposedDigest {
            parts: split_blocks(&blocks, MESSAGE_LIMIT_BYTES),
            sent_items,
        })
    }

    async fn header_block(&self, local: &DateTime<Tz>, slot: Option<Slot>) -> String {
        let label = match slot {
            Some(s) => s.edition_label(),
            None => "News Update",
        };
        let offset_secs = local.offset().fix().local_minus_utc();
        let mut header = format!(
            "📰 *DAILY NEWS DIGEST*\n{label} — {} ({})",
            local.format("%a, %b %-d, %Y %-I:%M%p"),
            format_utc_offset(offset_secs),
        );

        if let Some(holidays) = &self.holidays {
            match holidays.holidays(HOLIDAY_COUNTRY, local.date_naive()).await {
                Ok(names) if !names.is_empty() => {
                    header.push_str(&format!("\n🎉 Today: {}", names.join(", ")));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "holiday line skipped"),
            }
        }
        header
    }
}

/// "UTC+6", "UTC+5:30", "UTC-7".
fn format_utc_offset(offset_secs: i32) -> String {
    let sign = if offset_secs < 0 { '-' } else { '+' };
    let abs = offset_secs.unsigned_abs();
    let hours = abs / 3600;
    let minutes = (abs % 3600) / 60;
    if minutes == 0 {
        format!("UTC{sign}{hours}")
    } else {
        format!("UTC{sign}{hours}:{minutes:02}")
    }
}

/// One category block: heading plus a numbered list of exactly five lines.
pub fn render_category_block(
    category: Category,
    selection: &Selection,
    now: DateTime<Utc>,
) -> String {
    let placeholder_line = if selection.outage {
        "(sources temporarily unavailable)"
    } else {
        "(no further recent items)"
    };

    let mut out = format!("*{}:*\n", category.heading());
    for (i, picked) in selection.entries.iter().enumerate() {
        match picked {
            Picked::Story(item) => {
                out.push_str(&format!(
                    "{}. [{}]({}) - {} ({})\n",
                    i + 1,
                    escape_markdown(&item.title),
                    item.url,
                    item.source_id,
                    relative_age(now, item.published_at),
                ));
            }
            Picked::Placeholder => {
                out.push_str(&format!("{}. _{placeholder_line}_\n", i + 1));
            }
        }
    }
    out.trim_end().to_string()
}

/// Pack blocks into transport-sized parts, splitting only at block
/// boundaries, and number the parts when there is more than one.
pub fn split_blocks(blocks: &[String], limit: usize) -> Vec<String> {
    let budget = limit.saturating_sub(PART_MARKER_MARGIN);
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();

    for block in blocks {
        let block = if block.len() > budget {
            // A single oversized block cannot be split at a boundary;
            // truncate on a char edge rather than fail the whole digest.
            let mut cut = budget;
            while !block.is_char_boundary(cut) {
                cut -= 1;
            }
            &block[..cut]
        } else {
            block.as_str()
        };

        let needed = if current.is_empty() {
            block.len()
        } else {
            current.len() + 2 + block.len()
        };
        if needed > budget && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(block);
    }
    if !current.is_empty() {
        parts.push(current);
    }

    let total = parts.len();
    if total > 1 {
        for (i, part) in parts.iter_mut().enumerate() {
            part.push_str(&format!("\n\n({}/{total})", i + 1));
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::Item;
    use chrono::Duration;

    fn story(source: &str, title: &str, minutes_ago: i64) -> Picked {
        let now = Utc::now();
        Picked::Story(Item {
            source_id: source.to_string(),
            category: Category::Global,
            title: title.to_string(),
            url: "https://example.com/story".to_string(),
            published_at: now - Duration::minutes(minutes_ago),
            fetched_at: now,
            time_estimated: false,
            reliability_weight: 1.0,
            fingerprint: crate::feeds::parse::fingerprint(title, source),
        })
    }

    #[test]
    fn category_block_has_exactly_five_numbered_lines() {
        let selection = Selection {
            entries: vec![
                story("bbc-world", "One", 5),
                story("bbc-world", "Two", 10),
                Picked::Placeholder,
                Picked::Placeholder,
                Picked::Placeholder,
            ],
            outage: false,
        };
        let block = render_category_block(Category::Global, &selection, Utc::now());
        for n in 1..=5 {
            assert!(block.contains(&format!("{n}. ")), "missing line {n}");
        }
        assert!(block.contains("(no further recent items)"));
        assert!(!block.contains("6. "));
    }

    #[test]
    fn outage_block_uses_unavailable_wording() {
        let selection = Selection {
            entries: vec![Picked::Placeholder; 5],
            outage: true,
        };
        let block = render_category_block(Category::Global, &selection, Utc::now());
        assert_eq!(block.matches("(sources temporarily unavailable)").count(), 5);
    }

    #[test]
    fn titles_with_metachars_stay_linkable() {
        let selection = Selection {
            entries: vec![
                story("bbc-world", "Fed *cuts* [rates]_fast_", 5),
                Picked::Placeholder,
                Picked::Placeholder,
                Picked::Placeholder,
                Picked::Placeholder,
            ],
            outage: false,
        };
        let block = render_category_block(Category::Global, &selection, Utc::now());
        assert!(block.contains("[Fed \\*cuts\\* \\[rates\\]\\_fast\\_](https://example.com/story)"));
    }

    #[test]
    fn split_respects_block_boundaries_and_numbers_parts() {
        let blocks: Vec<String> = (0..6).map(|i| format!("block {i} {}", "x".repeat(1500))).collect();
        let parts = split_blocks(&blocks, 4096);
        assert!(parts.len() > 1);
        for part in &parts {
            assert!(part.len() <= 4096);
        }
        assert!(parts[0].ends_with(&format!("(1/{})", parts.len())));
        assert!(parts
            .last()
            .unwrap()
            .ends_with(&format!("({0}/{0})", parts.len())));
        // No block was cut in half.
        let joined = parts.join("\n");
        for i in 0..6 {
            assert!(joined.contains(&format!("block {i}")));
        }
    }

    #[test]
    fn small_digest_is_one_unnumbered_part() {
        let blocks = vec!["header".to_string(), "body".to_string()];
        let parts = split_blocks(&blocks, 4096);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0], "header\n\nbody");
    }

    #[test]
    fn utc_offsets() {
        assert_eq!(format_utc_offset(6 * 3600), "UTC+6");
        assert_eq!(format_utc_offset(5 * 3600 + 1800), "UTC+5:30");
        assert_eq!(format_utc_offset(-7 * 3600), "UTC-7");
        assert_eq!(format_utc_offset(0), "UTC+0");
    }
}
