//! Static feed catalogue.
//!
//! The source table is configuration, not logic: a compiled-in default list
//! covering the five categories, overridable by a TOML file (same shape the
//! table is declared in here).

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Digest category. Order of `ALL` is the fixed display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Local,
    Global,
    Tech,
    Sports,
    #[serde(rename = "finance")]
    FinanceCrypto,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Local,
        Category::Global,
        Category::Tech,
        Category::Sports,
        Category::FinanceCrypto,
    ];

    /// Stable short code used in storage and config files.
    pub fn code(self) -> &'static str {
        match self {
            Category::Local => "local",
            Category::Global => "global",
            Category::Tech => "tech",
            Category::Sports => "sports",
            Category::FinanceCrypto => "finance",
        }
    }

    /// Section heading as rendered in the digest.
    pub fn heading(self) -> &'static str {
        match self {
            Category::Local => "🇧🇩 LOCAL NEWS",
            Category::Global => "🌍 GLOBAL NEWS",
            Category::Tech => "🚀 TECH NEWS",
            Category::Sports => "🏆 SPORTS NEWS",
            Category::FinanceCrypto => "🪙 FINANCE & CRYPTO NEWS",
        }
    }

    pub fn parse(code: &str) -> Option<Category> {
        match code {
            "local" => Some(Category::Local),
            "global" => Some(Category::Global),
            "tech" => Some(Category::Tech),
            "sports" => Some(Category::Sports),
            "finance" => Some(Category::FinanceCrypto),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// One registered feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Stable short identifier, e.g. "bbc-world".
    pub id: String,
    pub category: Category,
    pub url: String,
    /// Ranking weight in 0.5–1.5; clamped on load.
    #[serde(default = "default_weight")]
    pub reliability_weight: f32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> f32 {
    1.0
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct Catalogue {
    sources: Vec<Source>,
}

#[derive(Deserialize)]
struct CatalogueFile {
    sources: Vec<Source>,
}

impl Catalogue {
    /// Load from a TOML file, or fall back to the built-in table.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::builtin()),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading feed catalogue from {}", path.display()))?;
        let parsed: CatalogueFile =
            toml::from_str(&content).context("parsing feed catalogue TOML")?;
        Ok(Self::new(parsed.sources))
    }

    pub fn new(mut sources: Vec<Source>) -> Self {
        for s in &mut sources {
            s.reliability_weight = s.reliability_weight.clamp(0.5, 1.5);
        }
        Catalogue { sources }
    }

    pub fn enabled_for(&self, category: Category) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| s.enabled && s.category == category)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Compiled-in default table (~45 feeds).
    pub fn builtin() -> Self {
        fn src(id: &str, category: Category, url: &str, weight: f32) -> Source {
            Source {
                id: id.to_string(),
                category,
                url: url.to_string(),
                reliability_weight: weight,
                enabled: true,
            }
        }
        use Category::*;
        Self::new(vec![
            // Local (Bangladesh)
            src("prothom-alo", Local, "https://www.prothomalo.com/feed", 1.3),
            src("daily-star", Local, "https://www.thedailystar.net/frontpage/rss.xml", 1.3),
            src("bdnews24", Local, "https://bdnews24.com/feed", 1.2),
            src("dhaka-tribune", Local, "https://www.dhakatribune.com/articles.rss", 1.1),
            src("jugantor", Local, "https://www.jugantor.com/rss.xml", 1.0),
            src("samakal", Local, "https://samakal.com/rss.xml", 1.0),
            src("kaler-kantho", Local, "https://www.kalerkantho.com/rss.xml", 1.0),
            src("ittefaq", Local, "https://www.ittefaq.com.bd/rss.xml", 0.9),
            src("jagonews24", Local, "https://www.jagonews24.com/rss.xml", 0.9),
            // Global
            src("bbc-world", Global, "https://feeds.bbci.co.uk/news/rss.xml", 1.4),
            src("reuters-top", Global, "https://feeds.reuters.com/reuters/topNews", 1.5),
            src("aljazeera", Global, "https://www.aljazeera.com/xml/rss/all.xml", 1.2),
            src("guardian-world", Global, "https://www.theguardian.com/world/rss", 1.2),
            src("cnn-edition", Global, "http://rss.cnn.com/rss/edition.rss", 1.1),
            src("nyt-home", Global, "https://rss.nytimes.com/services/xml/rss/nyt/HomePage.xml", 1.3),
            src("washpost-world", Global, "https://feeds.washingtonpost.com/rss/world", 1.2),
            src("nbc-news", Global, "https://feeds.nbcnews.com/nbcnews/public/news", 1.0),
            src("nypost", Global, "https://nypost.com/feed/", 0.8),
            src("economist", Global, "https://www.economist.com/latest/rss.xml", 1.2),
            // Tech
            src("techcrunch", Tech, "http://feeds.feedburner.com/TechCrunch/", 1.3),
            src("verge", Tech, "https://www.theverge.com/rss/index.xml", 1.2),
            src("wired", Tech, "https://www.wired.com/feed/rss", 1.2),
            src("ars-technica", Tech, "http://feeds.arstechnica.com/arstechnica/index/", 1.2),
            src("cnet", Tech, "https://www.cnet.com/rss/news/", 1.0),
            src("engadget", Tech, "https://www.engadget.com/rss.xml", 1.0),
            src("techradar", Tech, "https://www.techradar.com/rss", 0.9),
            src("mashable", Tech, "https://mashable.com/feeds/rss/all", 0.8),
            // Sports
            src("espn", Sports, "https://www.espn.com/espn/rss/news", 1.3),
            src("bbc-sport", Sports, "https://feeds.bbci.co.uk/sport/rss.xml", 1.3),
            src("sky-sports", Sports, "https://www.skysports.com/rss/12040", 1.1),
            src("guardian-sport", Sports, "https://www.theguardian.com/sport/rss", 1.1),
            src("yahoo-sports", Sports, "https://sports.yahoo.com/rss/", 0.9),
            src("samakal-sport", Sports, "https://samakal.com/sports/rss.xml", 0.9),
            src("prothom-alo-sport", Sports, "https://www.prothomalo.com/sports/feed", 1.0),
            // Finance & crypto
            src("reuters-business", FinanceCrypto, "https://feeds.reuters.com/reuters/businessNews", 1.4),
            src("marketwatch", FinanceCrypto, "http://feeds.marketwatch.com/marketwatch/topstories/", 1.1),
            src("coindesk", FinanceCrypto, "https://www.coindesk.com/arc/outboundfeeds/rss/", 1.2),
            src("cointelegraph", FinanceCrypto, "https://cointelegraph.com/rss", 1.1),
            src("decrypt", FinanceCrypto, "https://decrypt.co/feed", 1.0),
            src("beincrypto", FinanceCrypto, "https://beincrypto.com/feed/", 0.8),
            src("cryptoslate", FinanceCrypto, "https://cryptoslate.com/feed/", 0.8),
            src("theblock", FinanceCrypto, "https://www.theblock.co/rss.xml", 1.0),
            src("bonik-barta", FinanceCrypto, "https://www.bonikbarta.net/feed", 0.9),
        ])
    }
}
