// tests/common/mod.rs
// Shared fixtures: a small catalogue, a seeded fetcher, mock market and
// transport implementations. No network anywhere.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use newsbrief::error::{TransportError, UpstreamError};
use newsbrief::feeds::parse::fingerprint;
use newsbrief::feeds::{Catalogue, Category, FeedFetcher, Item, Source};
use newsbrief::market::commentary::{CommentaryClient, MockProvider};
use newsbrief::market::provider::{
    CoinId, CoinMarket, CoinRow, GlobalOverview, IndexQuote, MarketProvider,
};
use newsbrief::market::MarketComposer;
use newsbrief::transport::{Transport, Update};

/// Two sources per category so five picks fit under the per-source cap.
pub fn test_catalogue() -> Catalogue {
    let mut sources = Vec::new();
    for category in Category::ALL {
        for suffix in ["a", "b"] {
            sources.push(Source {
                id: format!("{}-{suffix}", category.code()),
                category,
                // Unroutable on purpose; tests seed the cache instead.
                url: format!("http://127.0.0.1:9/{}/{suffix}", category.code()),
                reliability_weight: 1.0,
                enabled: true,
            });
        }
    }
    Catalogue::new(sources)
}

pub fn item(source_id: &str, category: Category, title: &str, minutes_ago: i64) -> Item {
    let now = Utc::now();
    Item {
        source_id: source_id.to_string(),
        category,
        title: title.to_string(),
        url: format!(
            "https://example.com/{}/{}",
            source_id,
            title.replace(' ', "-").to_lowercase()
        ),
        published_at: now - Duration::minutes(minutes_ago),
        fetched_at: now,
        time_estimated: false,
        reliability_weight: 1.0,
        fingerprint: fingerprint(title, source_id),
    }
}

/// Seed `per_source` fresh stories into both sources of every category.
pub fn seed_all_categories(fetcher: &FeedFetcher, per_source: usize) {
    for category in Category::ALL {
        for suffix in ["a", "b"] {
            let source_id = format!("{}-{suffix}", category.code());
            let items: Vec<Item> = (0..per_source)
                .map(|i| {
                    item(
                        &source_id,
                        category,
                        &format!("{} {suffix} story {i}", category.code()),
                        (i as i64) + 2,
                    )
                })
                .collect();
            fetcher.seed_source(&source_id, items);
        }
    }
}

// ---- market ----

pub struct FixedMarketProvider;

#[async_trait]
impl MarketProvider for FixedMarketProvider {
    async fn global_overview(&self) -> Result<GlobalOverview, UpstreamError> {
        Ok(GlobalOverview {
            total_cap_usd: 3.75e12,
            total_volume_usd: 2.7519e11,
            cap_change_pct_24h: 0.35,
        })
    }

    async fn top_coins(&self, _n: usize) -> Result<Vec<CoinRow>, UpstreamError> {
        let coin = |symbol: &str, pct: f64| CoinRow {
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            price: 10.0,
            pct_change_24h: Some(pct),
            volume_24h: Some(5e8),
        };
        Ok(vec![
            coin("AAA", 12.0),
            coin("BBB", 8.0),
            coin("CCC", 5.0),
            coin("DDD", 3.0),
            coin("EEE", 1.0),
            coin("FFF", -1.0),
            coin("GGG", -3.0),
            coin("HHH", -5.0),
            coin("III", -8.0),
            coin("JJJ", -12.0),
        ])
    }

    async fn fear_greed(&self) -> Result<u32, UpstreamError> {
        Ok(71)
    }

    async fn search_coin(&self, query: &str) -> Result<Option<CoinId>, UpstreamError> {
        if query.eq_ignore_ascii_case("btc") || query.eq_ignore_ascii_case("bitcoin") {
            Ok(Some(CoinId {
                id: "bitcoin".to_string(),
                name: "Bitcoin".to_string(),
                symbol: "BTC".to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn coin_market(&self, _id: &str) -> Result<CoinMarket, UpstreamError> {
        Ok(CoinMarket {
            symbol: "BTC".to_string(),
            name: "Bitcoin".to_string(),
            price: 109_420.55,
            pct_1h: Some(0.2),
            pct_24h: Some(2.3),
            pct_7d: Some(-1.0),
            pct_30d: Some(8.9),
            market_cap: 2.1e12,
            volume_24h: 4.5e10,
        })
    }

    async fn daily_closes(&self, _id: &str, days: u32) -> Result<Vec<f64>, UpstreamError> {
        Ok((0..=days).map(|i| 100_000.0 + f64::from(i) * 250.0).collect())
    }

    async fn index_quotes(&self) -> Result<Vec<IndexQuote>, UpstreamError> {
        Ok(vec![])
    }
}

/// Provider where everything fails; exercises the degraded paths.
pub struct DownMarketProvider;

#[async_trait]
impl MarketProvider for DownMarketProvider {
    async fn global_overview(&self) -> Result<GlobalOverview, UpstreamError> {
        Err(UpstreamError::unavailable("down"))
    }
    async fn top_coins(&self, _n: usize) -> Result<Vec<CoinRow>, UpstreamError> {
        Err(UpstreamError::unavailable("down"))
    }
    async fn fear_greed(&self) -> Result<u32, UpstreamError> {
        Err(UpstreamError::unavailable("down"))
    }
    async fn search_coin(&self, _query: &str) -> Result<Option<CoinId>, UpstreamError> {
        Err(UpstreamError::unavailable("down"))
    }
    async fn coin_market(&self, _id: &str) -> Result<CoinMarket, UpstreamError> {
        Err(UpstreamError::unavailable("down"))
    }
    async fn daily_closes(&self, _id: &str, _days: u32) -> Result<Vec<f64>, UpstreamError> {
        Err(UpstreamError::unavailable("down"))
    }
    async fn index_quotes(&self) -> Result<Vec<IndexQuote>, UpstreamError> {
        Err(UpstreamError::unavailable("down"))
    }
}

pub fn fixed_market() -> Arc<MarketComposer> {
    Arc::new(MarketComposer::new(
        Arc::new(FixedMarketProvider),
        CommentaryClient::new(
            Box::new(MockProvider {
                fixed: "Sentiment steady; mild upward bias over the next day.".to_string(),
            }),
            true,
        ),
    ))
}

// ---- weather / holidays ----

pub struct FixedWeatherProvider;

#[async_trait]
impl newsbrief::weather::WeatherProvider for FixedWeatherProvider {
    async fn current(
        &self,
        _location: &str,
    ) -> Result<newsbrief::weather::WeatherNow, UpstreamError> {
        Ok(newsbrief::weather::WeatherNow {
            temp_c_min: 25.1,
            temp_c_max: 30.1,
            condition: "Partly cloudy".to_string(),
            aqi_index: Some(2),
            uv: Some(1.2),
        })
    }
}

pub struct FixedHolidayProvider;

#[async_trait]
impl newsbrief::weather::HolidayProvider for FixedHolidayProvider {
    async fn holidays(
        &self,
        _country: &str,
        _date: chrono::NaiveDate,
    ) -> Result<Vec<String>, UpstreamError> {
        Ok(vec!["Victory Day".to_string()])
    }
}

pub fn fixed_weather() -> Arc<newsbrief::weather::WeatherService> {
    Arc::new(newsbrief::weather::WeatherService::new(Box::new(
        FixedWeatherProvider,
    )))
}

pub fn fixed_holidays() -> Arc<newsbrief::weather::HolidayService> {
    Arc::new(newsbrief::weather::HolidayService::new(Box::new(
        FixedHolidayProvider,
    )))
}

// ---- transport ----

/// Scripted transport: pops one planned error per send, then succeeds.
pub struct MockTransport {
    pub sent: Mutex<Vec<(i64, String)>>,
    pub planned_errors: Mutex<VecDeque<TransportError>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            sent: Mutex::new(Vec::new()),
            planned_errors: Mutex::new(VecDeque::new()),
        })
    }

    pub fn plan_error(&self, err: TransportError) {
        self.planned_errors.lock().unwrap().push_back(err);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64, TransportError> {
        if let Some(err) = self.planned_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((chat_id, text.to_string()));
        Ok(sent.len() as i64)
    }

    async fn get_updates(
        &self,
        _offset: Option<i64>,
        _timeout_secs: u64,
    ) -> Result<Vec<Update>, TransportError> {
        Ok(Vec::new())
    }
}

/// Extract all markdown link URLs from a rendered digest.
pub fn links_in(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("](") {
        let tail = &rest[start + 2..];
        if let Some(end) = tail.find(')') {
            out.push(tail[..end].to_string());
            rest = &tail[end + 1..];
        } else {
            break;
        }
    }
    out
}

pub fn now_at_dhaka_morning() -> DateTime<Utc> {
    // 02:00:30 UTC == 08:00:30 in Asia/Dhaka (UTC+6).
    chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 9, 1, 2, 0, 30).unwrap()
}
