//! Text formatting helpers shared by the digest and market renderers.

use chrono::{DateTime, Utc};

/// Escape the Markdown metacharacters the transport interprets, so arbitrary
/// headlines cannot break link syntax.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '*' | '_' | '[' | ']' | '`') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Human age of an item relative to `now`: "now", "5min ago", "2hr ago",
/// "3d ago". Future timestamps (clock skew upstream) read as "now".
pub fn relative_age(now: DateTime<Utc>, published: DateTime<Utc>) -> String {
    let secs = (now - published).num_seconds().max(0);
    let mins = secs / 60;
    if mins < 1 {
        "now".to_string()
    } else if mins < 60 {
        format!("{mins}min ago")
    } else if mins < 24 * 60 {
        format!("{}hr ago", mins / 60)
    } else {
        format!("{}d ago", mins / (24 * 60))
    }
}

/// Compact dollar amount: $3.75T / $275.19B / $12.40M / $9.82K / $3.50.
pub fn human_usd(amount: f64) -> String {
    let abs = amount.abs();
    if abs >= 1e12 {
        format!("${:.2}T", amount / 1e12)
    } else if abs >= 1e9 {
        format!("${:.2}B", amount / 1e9)
    } else if abs >= 1e6 {
        format!("${:.2}M", amount / 1e6)
    } else if abs >= 1e3 {
        format!("${:.2}K", amount / 1e3)
    } else {
        format!("${amount:.2}")
    }
}

/// Coin price with precision scaled to magnitude (micro-cap coins need the
/// extra decimals to be meaningful).
pub fn format_price(price: f64) -> String {
    if price >= 1000.0 {
        format!("${}", group_thousands(&format!("{price:.2}")))
    } else if price >= 1.0 {
        format!("${price:.2}")
    } else if price >= 0.0001 {
        format!("${price:.4}")
    } else if price >= 0.000001 {
        format!("${price:.6}")
    } else {
        format!("${price:.8}")
    }
}

/// Direction marker for a percent change.
pub fn trend_arrow(pct_change: f64) -> &'static str {
    if pct_change > 0.0 {
        "▲"
    } else if pct_change < 0.0 {
        "▼"
    } else {
        "→"
    }
}

fn group_thousands(formatted: &str) -> String {
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted, None),
    };
    let digits: Vec<char> = int_part.chars().collect();
    let mut out = String::new();
    for (i, ch) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 && ch.is_ascii_digit() {
            out.push(',');
        }
        out.push(*ch);
    }
    if let Some(f) = frac_part {
        out.push('.');
        out.push_str(f);
    }
    out
}
