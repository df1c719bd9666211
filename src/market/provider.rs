//! Market data provider.
//!
//! A trait seam so the composer and tests can run against fixtures, plus the
//! real CoinGecko-backed implementation (with alternative.me for fear/greed
//! and an optional Twelve-Data-style quote endpoint for the index row).
//! Free-tier limits are respected client-side: at least two seconds between
//! calls to the price provider.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::UpstreamError;

#[derive(Debug, Clone)]
pub struct GlobalOverview {
    pub total_cap_usd: f64,
    pub total_volume_usd: f64,
    pub cap_change_pct_24h: f64,
}

/// One row of the top-N coin list.
#[derive(Debug, Clone)]
pub struct CoinRow {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub pct_change_24h: Option<f64>,
    pub volume_24h: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CoinId {
    pub id: String,
    pub name: String,
    pub symbol: String,
}

/// Detailed market row for one coin (multi-window changes).
#[derive(Debug, Clone)]
pub struct CoinMarket {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub pct_1h: Option<f64>,
    pub pct_24h: Option<f64>,
    pub pct_7d: Option<f64>,
    pub pct_30d: Option<f64>,
    pub market_cap: f64,
    pub volume_24h: f64,
}

#[derive(Debug, Clone)]
pub struct IndexQuote {
    pub symbol: String,
    pub value: f64,
    pub pct_change: f64,
}

#[async_trait]
pub trait MarketProvider: Send + Sync {
    async fn global_overview(&self) -> Result<GlobalOverview, UpstreamError>;
    /// Top-N coins by market cap with 24 h change.
    async fn top_coins(&self, n: usize) -> Result<Vec<CoinRow>, UpstreamError>;
    async fn fear_greed(&self) -> Result<u32, UpstreamError>;
    async fn search_coin(&self, query: &str) -> Result<Option<CoinId>, UpstreamError>;
    async fn coin_market(&self, id: &str) -> Result<CoinMarket, UpstreamError>;
    /// Daily closes, oldest first.
    async fn daily_closes(&self, id: &str, days: u32) -> Result<Vec<f64>, UpstreamError>;
    /// Stock/FX index quotes; empty when unconfigured.
    async fn index_quotes(&self) -> Result<Vec<IndexQuote>, UpstreamError>;
}

/// Minimum spacing between calls to the price provider.
const PROVIDER_PACING: Duration = Duration::from_secs(2);
/// Index symbols rendered in the market block, when a key is configured.
const INDEX_SYMBOLS: [&str; 4] = ["SPX500", "NIFTY", "DSEX", "USDX"];

pub struct CoinGeckoProvider {
    http: reqwest::Client,
    base_url: String,
    fng_url: String,
    index_base_url: String,
    index_api_key: Option<String>,
    pacer: tokio::sync::Mutex<Option<Instant>>,
}

impl CoinGeckoProvider {
    pub fn new(index_api_key: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("newsbrief/0.1 (+rss digest bot)")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(CoinGeckoProvider {
            http,
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            fng_url: "https://api.alternative.me/fng/?limit=1".to_string(),
            index_base_url: "https://api.twelvedata.com".to_string(),
            index_api_key,
            pacer: tokio::sync::Mutex::new(None),
        })
    }

    /// Point all endpoints at a test server.
    #[doc(hidden)]
    pub fn with_base_urls(mut self, base: &str, fng: &str, index: &str) -> Self {
        self.base_url = base.trim_end_matches('/').to_string();
        self.fng_url = fng.to_string();
        self.index_base_url = index.trim_end_matches('/').to_string();
        self
    }

    async fn pace(&self) {
        let mut last = self.pacer.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < PROVIDER_PACING {
                tokio::time::sleep(PROVIDER_PACING - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// GET + JSON with at most two retries on transient failures, then
    /// `Unavailable`.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, UpstreamError> {
        let mut last_err = String::new();
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(400 * attempt as u64)).await;
                debug!(url, attempt, "retrying market request");
            }
            self.pace().await;
            let resp = match self.http.get(url).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = e.to_string();
                    continue;
                }
            };
            let status = resp.status();
            if status.as_u16() == 429 {
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(UpstreamError::RateLimited { retry_after });
            }
            if !status.is_success() {
                if status.is_server_error() {
                    last_err = format!("status {status}");
                    continue;
                }
                return Err(UpstreamError::unavailable(format!("status {status}")));
            }
            match resp.json::<T>().await {
                Ok(v) => return Ok(v),
                Err(e) => return Err(UpstreamError::unavailable(format!("bad payload: {e}"))),
            }
        }
        Err(UpstreamError::unavailable(last_err))
    }
}

// ---- provider wire formats ----

#[derive(Deserialize)]
struct GlobalEnvelope {
    data: GlobalData,
}

#[derive(Deserialize)]
struct GlobalData {
    total_market_cap: std::collections::HashMap<String, f64>,
    total_volume: std::collections::HashMap<String, f64>,
    market_cap_change_percentage_24h_usd: f64,
}

#[derive(Deserialize)]
struct MarketRow {
    symbol: String,
    name: String,
    current_price: Option<f64>,
    price_change_percentage_24h: Option<f64>,
    total_volume: Option<f64>,
    market_cap: Option<f64>,
    #[serde(rename = "price_change_percentage_1h_in_currency")]
    pct_1h: Option<f64>,
    #[serde(rename = "price_change_percentage_24h_in_currency")]
    pct_24h: Option<f64>,
    #[serde(rename = "price_change_percentage_7d_in_currency")]
    pct_7d: Option<f64>,
    #[serde(rename = "price_change_percentage_30d_in_currency")]
    pct_30d: Option<f64>,
}

#[derive(Deserialize)]
struct FngEnvelope {
    data: Vec<FngRow>,
}

#[derive(Deserialize)]
struct FngRow {
    value: String,
}

#[derive(Deserialize)]
struct SearchEnvelope {
    coins: Vec<SearchCoin>,
}

#[derive(Deserialize)]
struct SearchCoin {
    id: String,
    name: String,
    symbol: String,
}

#[derive(Deserialize)]
struct ChartEnvelope {
    prices: Vec<(i64, f64)>,
}

#[derive(Deserialize)]
struct QuoteRow {
    symbol: String,
    close: String,
    percent_change: String,
}

#[async_trait]
impl MarketProvider for CoinGeckoProvider {
    async fn global_overview(&self) -> Result<GlobalOverview, UpstreamError> {
        let url = format!("{}/global", self.base_url);
        let env: GlobalEnvelope = self.get_json(&url).await?;
        let cap = env
            .data
            .total_market_cap
            .get("usd")
            .copied()
            .ok_or_else(|| UpstreamError::unavailable("no usd market cap"))?;
        let vol = env
            .data
            .total_volume
            .get("usd")
            .copied()
            .ok_or_else(|| UpstreamError::unavailable("no usd volume"))?;
        Ok(GlobalOverview {
            total_cap_usd: cap,
            total_volume_usd: vol,
            cap_change_pct_24h: env.data.market_cap_change_percentage_24h_usd,
        })
    }

    async fn top_coins(&self, n: usize) -> Result<Vec<CoinRow>, UpstreamError> {
        let url = format!(
            "{}/coins/markets?vs_currency=usd&order=market_cap_desc&per_page={n}&page=1",
            self.base_url
        );
        let rows: Vec<MarketRow> = self.get_json(&url).await?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                Some(CoinRow {
                    symbol: r.symbol.to_uppercase(),
                    name: r.name,
                    price: r.current_price?,
                    pct_change_24h: r.price_change_percentage_24h,
                    volume_24h: r.total_volume,
                })
            })
            .collect())
    }

    async fn fear_greed(&self) -> Result<u32, UpstreamError> {
        let env: FngEnvelope = self.get_json(&self.fng_url).await?;
        env.data
            .first()
            .and_then(|r| r.value.parse().ok())
            .ok_or_else(|| UpstreamError::unavailable("empty fear/greed payload"))
    }

    async fn search_coin(&self, query: &str) -> Result<Option<CoinId>, UpstreamError> {
        let url = format!("{}/search?query={}", self.base_url, query.to_lowercase());
        let env: SearchEnvelope = self.get_json(&url).await?;
        // Exact symbol match first, then the provider's best hit.
        let exact = env
            .coins
            .iter()
            .find(|c| c.symbol.eq_ignore_ascii_case(query) || c.id.eq_ignore_ascii_case(query));
        Ok(exact.or(env.coins.first()).map(|c| CoinId {
            id: c.id.clone(),
            name: c.name.clone(),
            symbol: c.symbol.to_uppercase(),
        }))
    }

    async fn coin_market(&self, id: &str) -> Result<CoinMarket, UpstreamError> {
        let url = format!(
            "{}/coins/markets?vs_currency=usd&ids={id}&per_page=1&page=1&price_change_percentage=1h,24h,7d,30d",
            self.base_url
        );
        let rows: Vec<MarketRow> = self.get_json(&url).await?;
        let r = rows
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::unavailable(format!("no market data for {id}")))?;
        Ok(CoinMarket {
            symbol: r.symbol.to_uppercase(),
            name: r.name,
            price: r
                .current_price
                .ok_or_else(|| UpstreamError::unavailable("coin has no price"))?,
            pct_1h: r.pct_1h,
            pct_24h: r.pct_24h.or(r.price_change_percentage_24h),
            pct_7d: r.pct_7d,
            pct_30d: r.pct_30d,
            market_cap: r.market_cap.unwrap_or(0.0),
            volume_24h: r.total_volume.unwrap_or(0.0),
        })
    }

    async fn daily_closes(&self, id: &str, days: u32) -> Result<Vec<f64>, UpstreamError> {
        let url = format!(
            "{}/coins/{id}/market_chart?vs_currency=usd&days={days}&interval=daily",
            self.base_url
        );
        let env: ChartEnvelope = self.get_json(&url).await?;
        Ok(env.prices.into_iter().map(|(_, p)| p).collect())
    }

    async fn index_quotes(&self) -> Result<Vec<IndexQuote>, UpstreamError> {
        let Some(key) = &self.index_api_key else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for symbol in INDEX_SYMBOLS {
            let url = format!(
                "{}/quote?symbol={symbol}&apikey={key}",
                self.index_base_url
            );
            match self.get_json::<QuoteRow>(&url).await {
                Ok(row) => {
                    if let (Ok(value), Ok(pct)) =
                        (row.close.parse::<f64>(), row.percent_change.parse::<f64>())
                    {
                        out.push(IndexQuote {
                            symbol: row.symbol,
                            value,
                            pct_change: pct,
                        });
                    }
                }
                Err(e) => warn!(symbol, error = %e, "index quote skipped"),
            }
        }
        Ok(out)
    }
}
