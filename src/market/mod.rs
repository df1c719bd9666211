//! Crypto market intelligence.
//!
//! Composes the digest's market block (overview, top movers, AI commentary,
//! index row) and the on-demand per-coin report. Snapshots are recomputed at
//! most every few minutes; commentary has its own tighter budget.

pub mod commentary;
pub mod indicators;
pub mod provider;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::digest::format::{format_price, human_usd, trend_arrow};
use crate::error::UpstreamError;

use commentary::CommentaryClient;
use indicators::{compute_signal, moving_average, rsi, rsi_interpretation, support_resistance, VolumeBand};
use provider::{CoinRow, IndexQuote, MarketProvider};

/// Snapshot cache lifetime; absorbs bursts of concurrent digests.
const SNAPSHOT_TTL: Duration = Duration::from_secs(180);
/// Coins with less 24 h volume than this are ignored for the mover lists.
const DEAD_VOLUME_FLOOR_USD: f64 = 1_000_000.0;
/// Depth of the top-coin list scanned for movers.
const MOVER_UNIVERSE: usize = 200;
/// Mover list length.
const MOVERS: usize = 5;
/// Candle history for the coin report.
const DETAIL_DAYS: u32 = 30;

#[derive(Debug, Clone)]
pub struct Mover {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub pct_change_24h: f64,
}

/// Point-in-time market summary used to compose the market block.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub taken_at: DateTime<Utc>,
    pub total_cap_usd: f64,
    pub total_volume_usd: f64,
    pub cap_change_pct_24h: f64,
    pub fear_greed_index: Option<u32>,
    pub gainers: Vec<Mover>,
    pub losers: Vec<Mover>,
    pub index_quotes: Vec<IndexQuote>,
}

pub struct MarketComposer {
    provider: Arc<dyn MarketProvider>,
    commentary: CommentaryClient,
    cache: tokio::sync::Mutex<Option<(Instant, Arc<MarketSnapshot>)>>,
}

impl MarketComposer {
    pub fn new(provider: Arc<dyn MarketProvider>, commentary: CommentaryClient) -> Self {
        MarketComposer {
            provider,
            commentary,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Current snapshot, served from cache within the TTL. The cache lock is
    /// held across the refresh so concurrent digests share one provider pass.
    pub async fn snapshot(&self) -> Result<Arc<MarketSnapshot>, UpstreamError> {
        let mut cache = self.cache.lock().await;
        if let Some((at, snap)) = cache.as_ref() {
            if at.elapsed() < SNAPSHOT_TTL {
                return Ok(snap.clone());
            }
        }

        let overview = self.provider.global_overview().await?;
        let coins = self.provider.top_coins(MOVER_UNIVERSE).await?;
        let fear_greed = match self.provider.fear_greed().await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "fear/greed unavailable");
                None
            }
        };
        let index_quotes = self.provider.index_quotes().await.unwrap_or_default();

        let (gainers, losers) = top_movers(coins);
        let snap = Arc::new(MarketSnapshot {
            taken_at: Utc::now(),
            total_cap_usd: overview.total_cap_usd,
            total_volume_usd: overview.total_volume_usd,
            cap_change_pct_24h: overview.cap_change_pct_24h,
            fear_greed_index: fear_greed,
            gainers,
            losers,
            index_quotes,
        });
        *cache = Some((Instant::now(), snap.clone()));
        Ok(snap)
    }

    /// Rendered market block. Provider outages degrade to the fixed
    /// placeholder; the rest of the digest is unaffected.
    pub async fn market_block(&self) -> String {
        match self.snapshot().await {
            Ok(snap) => {
                let text = self.commentary.commentary(&snap).await;
                render_market_block(&snap, &text)
            }
            Err(e) => {
                warn!(error = %e, "market block degraded");
                "*💰 CRYPTO MARKET:*\nMarket data temporarily unavailable.".to_string()
            }
        }
    }

    /// Detailed report for one coin. `Ok(None)` means the symbol is unknown.
    pub async fn coin_detail(&self, symbol: &str) -> Result<Option<String>, UpstreamError> {
        let Some(coin) = self.provider.search_coin(symbol).await? else {
            return Ok(None);
        };
        let market = self.provider.coin_market(&coin.id).await?;
        let closes = match self.provider.daily_closes(&coin.id, DETAIL_DAYS).await {
            Ok(c) if !c.is_empty() => c,
            _ => vec![market.price],
        };
        Ok(Some(render_coin_detail(&coin.name, &market, &closes)))
    }
}

/// Split the top-coin list into 5 gainers / 5 losers by 24 h change,
/// skipping rows with no change figure or dead volume.
fn top_movers(coins: Vec<CoinRow>) -> (Vec<Mover>, Vec<Mover>) {
    let mut valid: Vec<(f64, Mover)> = coins
        .into_iter()
        .filter_map(|c| {
            let pct = c.pct_change_24h?;
            if c.volume_24h.unwrap_or(0.0) < DEAD_VOLUME_FLOOR_USD {
                return None;
            }
            Some((
                pct,
                Mover {
                    symbol: c.symbol,
                    name: c.name,
                    price: c.price,
                    pct_change_24h: pct,
                },
            ))
        })
        .collect();

    valid.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let gainers = valid.iter().take(MOVERS).map(|(_, m)| m.clone()).collect();
    let losers = valid
        .iter()
        .rev()
        .take(MOVERS)
        .map(|(_, m)| m.clone())
        .collect();
    (gainers, losers)
}

fn render_market_block(s: &MarketSnapshot, commentary: &str) -> String {
    let mut out = String::from("*💰 CRYPTO MARKET:*\n");
    out.push_str(&format!(
        "Market Cap (24h): {} ({:+.2}%) {}\n",
        human_usd(s.total_cap_usd),
        s.cap_change_pct_24h,
        trend_arrow(s.cap_change_pct_24h),
    ));
    out.push_str(&format!("Volume (24h): {}\n", human_usd(s.total_volume_usd)));
    match s.fear_greed_index {
        Some(f) => out.push_str(&format!("Fear/Greed: {f}/100\n")),
        None => out.push_str("Fear/Greed: N/A\n"),
    }

    out.push_str("\n*📈 Top 5 Gainers:*\n");
    push_movers(&mut out, &s.gainers);
    out.push_str("\n*📉 Top 5 Losers:*\n");
    push_movers(&mut out, &s.losers);

    out.push_str(&format!("\n🧠 {commentary}\n"));
    out.push_str(&format!("Outlook (24h): {}\n", outlook(s)));

    if !s.index_quotes.is_empty() {
        let row = s
            .index_quotes
            .iter()
            .map(|q| format!("{} {:.1} ({:+.2}%)", q.symbol, q.value, q.pct_change))
            .collect::<Vec<_>>()
            .join(" | ");
        out.push_str(&format!("📊 {row}\n"));
    }
    out.trim_end().to_string()
}

fn push_movers(out: &mut String, movers: &[Mover]) {
    if movers.is_empty() {
        out.push_str("No data available.\n");
        return;
    }
    for (i, m) in movers.iter().enumerate() {
        out.push_str(&format!(
            "{}. {} {} ({:+.2}%)\n",
            i + 1,
            m.name,
            format_price(m.price),
            m.pct_change_24h,
        ));
    }
}

/// Deterministic one-liner from the snapshot; rendered after the commentary.
fn outlook(s: &MarketSnapshot) -> &'static str {
    match (s.cap_change_pct_24h, s.fear_greed_index) {
        (c, Some(f)) if c > 1.0 && f >= 60 => "bullish, watch for overheating",
        (c, _) if c > 1.0 => "cautiously bullish",
        (c, Some(f)) if c < -1.0 && f <= 30 => "bearish, oversold bounce possible",
        (c, _) if c < -1.0 => "cautiously bearish",
        _ => "sideways, range-bound",
    }
}

fn render_coin_detail(name: &str, m: &provider::CoinMarket, closes: &[f64]) -> String {
    let pct24 = m.pct_24h.unwrap_or(0.0);
    let rsi_v = rsi(closes, 14);
    let sr = support_resistance(closes);
    let ma30 = moving_average(closes, 30);
    let band = VolumeBand::of(m.volume_24h);
    let signal = compute_signal(pct24, m.volume_24h, rsi_v, m.price, ma30);

    let fmt_pct = |p: Option<f64>| match p {
        Some(v) => format!("{v:+.2}%"),
        None => "n/a".to_string(),
    };

    let mut out = format!(
        "{} ({})\nPrice: {} ({:+.2}%) {}\n",
        m.symbol,
        name,
        format_price(m.price),
        pct24,
        trend_arrow(pct24),
    );
    out.push_str(&format!(
        "1h {} | 24h {} | 7d {} | 30d {}\n",
        fmt_pct(m.pct_1h),
        fmt_pct(m.pct_24h),
        fmt_pct(m.pct_7d),
        fmt_pct(m.pct_30d),
    ));
    out.push_str(&format!(
        "Market Cap: {} | Volume: {} ({})\n",
        human_usd(m.market_cap),
        human_usd(m.volume_24h),
        band.describe(),
    ));

    out.push_str("\nTechnicals:\n");
    match sr {
        Some((support, resistance)) => {
            out.push_str(&format!("- Support: {}\n", format_price(support)));
            out.push_str(&format!("- Resistance: {}\n", format_price(resistance)));
        }
        None => out.push_str("- Support/Resistance: insufficient history\n"),
    }
    out.push_str(&format!("- RSI ({rsi_v:.1}): {}\n", rsi_interpretation(rsi_v)));
    match ma30 {
        Some(ma) if m.price > ma => {
            out.push_str(&format!("- 30D MA ({}): price above MA, bullish signal\n", format_price(ma)))
        }
        Some(ma) => {
            out.push_str(&format!("- 30D MA ({}): price below MA, bearish signal\n", format_price(ma)))
        }
        None => out.push_str("- 30D MA: insufficient history\n"),
    }

    out.push_str(&format!(
        "\nSignal (next 24h): {} — {}",
        signal.label(),
        signal.reason(),
    ));
    out
}
