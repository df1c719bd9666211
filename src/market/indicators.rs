//! Technical indicators for the on-demand coin report.
//!
//! Plain functions over a daily close series; no I/O.

/// RSI(14) over a close series. Returns the neutral 50 when there is not
/// enough history to compute it.
pub fn rsi(prices: &[f64], period: usize) -> f64 {
    if prices.len() < period + 1 {
        return 50.0;
    }
    let mut gains = 0.0;
    let mut losses = 0.0;
    for w in prices[prices.len() - period - 1..].windows(2) {
        let change = w[1] - w[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses += -change;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

pub fn rsi_interpretation(rsi: f64) -> &'static str {
    if rsi >= 70.0 {
        "overbought, caution advised"
    } else if rsi <= 30.0 {
        "oversold, potential buying opportunity"
    } else if rsi >= 50.0 {
        "bullish momentum"
    } else {
        "bearish momentum"
    }
}

/// Nearest support/resistance estimated from the last 20 periods' extrema.
pub fn support_resistance(prices: &[f64]) -> Option<(f64, f64)> {
    if prices.len() < 5 {
        return None;
    }
    let window = &prices[prices.len().saturating_sub(20)..];
    let support = window.iter().copied().fold(f64::INFINITY, f64::min);
    let resistance = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some((support, resistance))
}

pub fn moving_average(prices: &[f64], period: usize) -> Option<f64> {
    if prices.len() < period || period == 0 {
        return None;
    }
    Some(prices[prices.len() - period..].iter().sum::<f64>() / period as f64)
}

/// Volume liquidity band used in the report and the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeBand {
    High,
    Moderate,
    Low,
    VeryLow,
}

impl VolumeBand {
    pub fn of(volume_24h_usd: f64) -> Self {
        if volume_24h_usd > 1e9 {
            VolumeBand::High
        } else if volume_24h_usd > 1e8 {
            VolumeBand::Moderate
        } else if volume_24h_usd > 1e7 {
            VolumeBand::Low
        } else {
            VolumeBand::VeryLow
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            VolumeBand::High => "High, strong liquidity",
            VolumeBand::Moderate => "Moderate, decent liquidity",
            VolumeBand::Low => "Low, limited liquidity",
            VolumeBand::VeryLow => "Very low, poor liquidity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Hold,
    Watch,
    Sell,
}

impl Signal {
    pub fn label(self) -> &'static str {
        match self {
            Signal::Buy => "🟢 BUY",
            Signal::Hold => "🟠 HOLD",
            Signal::Watch => "🟡 WATCH",
            Signal::Sell => "🔴 SELL",
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Signal::Buy => "strong bullish momentum across indicators",
            Signal::Hold => "trend intact, some caution advised",
            Signal::Watch => "mixed signals, wait for clearer direction",
            Signal::Sell => "strong bearish signals across multiple indicators",
        }
    }
}

/// Weighted signal from 24h momentum, RSI zone, price-vs-MA and volume band.
pub fn compute_signal(
    pct_change_24h: f64,
    volume_24h_usd: f64,
    rsi_value: f64,
    price: f64,
    ma_30d: Option<f64>,
) -> Signal {
    let mut score = 0i32;

    score += match pct_change_24h {
        c if c > 10.0 => 3,
        c if c > 5.0 => 2,
        c if c > 0.0 => 1,
        c if c > -5.0 => -1,
        _ => -2,
    };

    if matches!(VolumeBand::of(volume_24h_usd), VolumeBand::High) {
        score += 1;
    }

    if rsi_value > 70.0 {
        score -= 1;
    } else if rsi_value < 30.0 {
        score += 1;
    }

    if let Some(ma) = ma_30d {
        if price > ma {
            score += 1;
        } else {
            score -= 1;
        }
    }

    match score {
        s if s >= 4 => Signal::Buy,
        s if s >= 2 => Signal::Hold,
        s if s >= 0 => Signal::Watch,
        s if s >= -2 => Signal::Hold,
        _ => Signal::Sell,
    }
}
