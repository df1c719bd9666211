// tests/category_outage.rs
// All sources of one category down; the digest still ships with placeholder
// lines for that block while the other categories are unaffected.
mod common;

use std::sync::Arc;

use newsbrief::digest::Assembler;
use newsbrief::feeds::{Category, FeedFetcher};
use newsbrief::select::SelectionEngine;
use newsbrief::store::Store;

use common::{fixed_market, item, now_at_dhaka_morning, test_catalogue};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn category_outage_yields_placeholders_only_for_that_block() {
    let fetcher = Arc::new(FeedFetcher::new(test_catalogue(), 4).unwrap());

    // Seed every category except GLOBAL; its sources point at an unroutable
    // address, so each refresh cycle fails for all of them.
    for category in Category::ALL {
        if category == Category::Global {
            continue;
        }
        for suffix in ["a", "b"] {
            let source_id = format!("{}-{suffix}", category.code());
            let items: Vec<_> = (0..4)
                .map(|i| {
                    item(
                        &source_id,
                        category,
                        &format!("{} {suffix} headline {i}", category.code()),
                        (i as i64) + 2,
                    )
                })
                .collect();
            fetcher.seed_source(&source_id, items);
        }
    }

    // Two consecutive failing cycles flip the outage condition.
    fetcher.force_refresh(Category::Global).await;
    fetcher.force_refresh(Category::Global).await;
    let view = fetcher.recent(Category::Global, now_at_dhaka_morning());
    assert!(view.outage);
    assert!(view.items.is_empty());

    let store = Arc::new(Store::open_in_memory().unwrap());
    let assembler = Assembler::new(
        fetcher.clone(),
        SelectionEngine::new(fetcher, store),
        fixed_market(),
        None,
        None,
    );
    let tz: chrono_tz::Tz = "Asia/Dhaka".parse().unwrap();
    let composed = assembler
        .compose(1, tz, now_at_dhaka_morning(), None)
        .await
        .unwrap();
    let full = composed.parts.join("\n\n");

    // The GLOBAL block is five placeholder lines.
    let start = full.find("🌍 GLOBAL NEWS").unwrap();
    let block_end = full[start..]
        .find("\n\n")
        .map(|e| start + e)
        .unwrap_or(full.len());
    let global_block = &full[start..block_end];
    assert_eq!(
        global_block
            .matches("(sources temporarily unavailable)")
            .count(),
        5
    );

    // Other categories still carry real stories, and the market block is up.
    assert!(full.contains("local a headline 0"));
    assert!(full.contains("*💰 CRYPTO MARKET:*"));
    assert!(full.contains("Market Cap (24h):"));

    // Only 20 real stories went into the dedup list (none for GLOBAL).
    assert_eq!(composed.sent_items.len(), 20);
}
