// tests/digest_render.rs
mod common;

use std::sync::Arc;

use newsbrief::digest::Assembler;
use newsbrief::feeds::{Category, FeedFetcher};
use newsbrief::sched::Slot;
use newsbrief::select::SelectionEngine;
use newsbrief::store::Store;
use newsbrief::transport::MESSAGE_LIMIT_BYTES;

use common::{
    fixed_holidays, fixed_market, fixed_weather, item, links_in, now_at_dhaka_morning,
    seed_all_categories, test_catalogue,
};

fn assembler() -> (Arc<FeedFetcher>, Arc<Store>, Assembler) {
    let fetcher = Arc::new(FeedFetcher::new(test_catalogue(), 4).unwrap());
    seed_all_categories(&fetcher, 6);
    let store = Arc::new(Store::open_in_memory().unwrap());
    let assembler = Assembler::new(
        fetcher.clone(),
        SelectionEngine::new(fetcher.clone(), store.clone()),
        fixed_market(),
        Some(fixed_weather()),
        Some(fixed_holidays()),
    );
    (fetcher, store, assembler)
}

#[tokio::test]
async fn digest_has_all_blocks_in_fixed_order() {
    let (_f, _s, assembler) = assembler();
    let tz: chrono_tz::Tz = "Asia/Dhaka".parse().unwrap();
    let composed = assembler
        .compose(1, tz, now_at_dhaka_morning(), Some(Slot::Morning))
        .await
        .unwrap();

    let full = composed.parts.join("\n\n");

    // Header with slot label, local time and offset.
    assert!(full.contains("DAILY NEWS DIGEST"));
    assert!(full.contains("Morning Edition"));
    assert!(full.contains("8:00AM (UTC+6)"));
    assert!(full.contains("🎉 Today: Victory Day"));
    assert!(full.contains("☀️ WEATHER"));

    // Category blocks in the contract order, then the market block.
    let positions: Vec<usize> = [
        "🇧🇩 LOCAL NEWS",
        "🌍 GLOBAL NEWS",
        "🚀 TECH NEWS",
        "🏆 SPORTS NEWS",
        "🪙 FINANCE & CRYPTO NEWS",
        "💰 CRYPTO MARKET",
    ]
    .iter()
    .map(|h| full.find(h).unwrap_or_else(|| panic!("missing block {h}")))
    .collect();
    for pair in positions.windows(2) {
        assert!(pair[0] < pair[1], "blocks out of order");
    }

    // Footer closes the digest.
    assert!(full.trim_end().ends_with("curated headlines, four times a day")
        || full.contains("newsbrief — curated headlines"));

    // Exactly five numbered entries per category block.
    for heading in [
        "🇧🇩 LOCAL NEWS",
        "🌍 GLOBAL NEWS",
        "🚀 TECH NEWS",
        "🏆 SPORTS NEWS",
        "🪙 FINANCE & CRYPTO NEWS",
    ] {
        let start = full.find(heading).unwrap();
        let block = &full[start..full[start..].find("\n\n").map(|e| start + e).unwrap_or(full.len())];
        for n in 1..=5 {
            assert!(block.contains(&format!("{n}. ")), "{heading} missing entry {n}");
        }
        assert!(!block.contains("6. "), "{heading} has more than five entries");
    }

    // 25 story fingerprints collected for the dedup log.
    assert_eq!(composed.sent_items.len(), 25);

    // Every part respects the transport limit.
    for part in &composed.parts {
        assert!(part.len() <= MESSAGE_LIMIT_BYTES);
    }
    if composed.parts.len() > 1 {
        let n = composed.parts.len();
        assert!(composed.parts[0].contains(&format!("(1/{n})")));
    }
}

#[tokio::test]
async fn metacharacter_titles_render_as_clickable_links() {
    let fetcher = Arc::new(FeedFetcher::new(test_catalogue(), 4).unwrap());
    seed_all_categories(&fetcher, 6);
    fetcher.seed_source(
        "global-a",
        vec![
            item("global-a", Category::Global, "Fed *signals* [cuts]", 1),
            item("global-a", Category::Global, "plain story", 2),
        ],
    );
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

    assert!(full.contains("[Fed \\*signals\\* \\[cuts\\]]("));
    // All links survive intact.
    assert!(links_in(&full)
        .iter()
        .any(|u| u.contains("fed-*signals*-[cuts]") || u.contains("global-a")));
}

#[tokio::test]
async fn on_demand_header_has_no_slot_label() {
    let (_f, _s, assembler) = assembler();
    let tz: chrono_tz::Tz = "Asia/Dhaka".parse().unwrap();
    let composed = assembler
        .compose(1, tz, now_at_dhaka_morning(), None)
        .await
        .unwrap();
    let full = composed.parts.join("\n\n");
    assert!(full.contains("News Update"));
    assert!(!full.contains("Morning Edition"));
}

#[tokio::test]
async fn second_digest_repeats_nothing_after_ack() {
    let (_f, store, assembler) = assembler();
    let tz: chrono_tz::Tz = "Asia/Dhaka".parse().unwrap();
    let now = now_at_dhaka_morning();

    let first = assembler.compose(42, tz, now, Some(Slot::Morning)).await.unwrap();
    // Simulate transport ack.
    store.mark_sent_batch(42, &first.sent_items, now).unwrap();

    let second = assembler
        .compose(42, tz, now + chrono::Duration::hours(5), Some(Slot::Noon))
        .await
        .unwrap();

    let first_links: std::collections::HashSet<String> =
        links_in(&first.parts.join("\n")).into_iter().collect();
    for link in links_in(&second.parts.join("\n")) {
        assert!(
            !first_links.contains(&link),
            "link repeated across slots: {link}"
        );
    }
}
