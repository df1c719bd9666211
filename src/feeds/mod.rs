//! Feed ingestion layer.
//!
//! Polls the static catalogue concurrently, normalizes entries into `Item`
//! records and serves them from an in-memory cache. The cache is the only
//! home an `Item` has: durable "was this delivered" state lives in the
//! dedup store, not here.

pub mod catalogue;
pub mod parse;
pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub use catalogue::{Catalogue, Category, Source};

use parse::ParsedFeed;
use state::SourceState;

/// Hard ceiling on the per-source cache TTL.
const MAX_SOURCE_TTL: Duration = Duration::from_secs(10 * 60);
/// Coalescing window: a category refreshed this recently is not refreshed again.
const MIN_REFRESH_SPACING: Duration = Duration::from_secs(30);
/// Total budget for one feed request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-host concurrency cap.
const PER_HOST_PERMITS: usize = 2;
/// Entries kept per source per cycle.
const MAX_ENTRIES_PER_SOURCE: usize = 30;
/// Consecutive all-fail refresh cycles before a category counts as down.
const OUTAGE_CYCLES: u32 = 2;

/// One ingested news entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub source_id: String,
    pub category: Category,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    /// True when the feed gave no parseable date and `published_at` is the
    /// fetch time.
    pub time_estimated: bool,
    pub reliability_weight: f32,
    pub fingerprint: String,
}

/// What `recent` hands to the selection engine.
#[derive(Debug, Clone, Default)]
pub struct CategoryView {
    /// Cached items, newest first.
    pub items: Vec<Item>,
    /// True when every source of the category has failed for two consecutive
    /// refresh cycles; the assembler renders placeholders for the block.
    pub outage: bool,
}

#[derive(Debug)]
enum FetchFailure {
    Transient(String),
    Hard(String),
}

struct SourceCache {
    fetched_at: Instant,
    ttl: Duration,
    items: Vec<Item>,
}

pub struct FeedFetcher {
    http: reqwest::Client,
    catalogue: Catalogue,
    global_permits: Arc<Semaphore>,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    /// Source id → cached items. Copy-on-update: readers clone the Arc.
    cache: RwLock<HashMap<String, Arc<SourceCache>>>,
    states: Mutex<HashMap<String, SourceState>>,
    /// Per-category refresh gate; concurrent delivery jobs coalesce here.
    refresh_gates: HashMap<Category, Arc<tokio::sync::Mutex<Option<Instant>>>>,
    outage_cycles: Mutex<HashMap<Category, u32>>,
}

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feeds_items_ingested_total", "Entries kept after normalization.");
        describe_counter!("feeds_source_errors_total", "Source fetch/parse failures.");
        describe_counter!("feeds_refresh_runs_total", "Category refresh cycles executed.");
        describe_gauge!("feeds_last_refresh_ts", "Unix ts of the last completed refresh.");
    });
}

impl FeedFetcher {
    pub fn new(catalogue: Catalogue, feed_parallelism: usize) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("newsbrief/0.1 (+rss digest bot)")
            .connect_timeout(Duration::from_secs(4))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let refresh_gates = Category::ALL
            .into_iter()
            .map(|c| (c, Arc::new(tokio::sync::Mutex::new(None))))
            .collect();

        Ok(FeedFetcher {
            http,
            catalogue,
            global_permits: Arc::new(Semaphore::new(feed_parallelism)),
            per_host: Mutex::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            refresh_gates,
            outage_cycles: Mutex::new(HashMap::new()),
        })
    }

    /// Refresh all enabled sources of a category. Returns the number of
    /// newly ingested items. Concurrent callers for the same category share
    /// one in-flight refresh.
    pub async fn refresh(&self, category: Category) -> usize {
        self.refresh_inner(category, false).await
    }

    /// Refresh ignoring the coalescing window. Test hook.
    #[doc(hidden)]
    pub async fn force_refresh(&self, category: Category) -> usize {
        self.refresh_inner(category, true).await
    }

    /// Replace a source's cache entry directly. Test hook, mirroring what a
    /// successful fetch would store.
    #[doc(hidden)]
    pub fn seed_source(&self, source_id: &str, items: Vec<Item>) {
        self.store_cache(source_id, items, MAX_SOURCE_TTL, Instant::now());
    }

    async fn refresh_inner(&self, category: Category, force: bool) -> usize {
        ensure_metrics_described();

        let gate = self.refresh_gates[&category].clone();
        let mut last_run = gate.lock().await;
        if !force {
            if let Some(at) = *last_run {
                if at.elapsed() < MIN_REFRESH_SPACING {
                    debug!(%category, "refresh coalesced with a recent run");
                    return 0;
                }
            }
        }

        let now = Instant::now();
        let sources = self.catalogue.enabled_for(category);
        let mut attempted = 0usize;
        let mut set: JoinSet<(Source, Result<ParsedFeed, FetchFailure>)> = JoinSet::new();

        for source in sources {
            if !self.source_ready(&source.id, now) || self.cache_fresh(&source.id, now) {
                continue;
            }
            attempted += 1;
            let http = self.http.clone();
            let global = self.global_permits.clone();
            let host = self.host_permits(&source.url);
            set.spawn(async move {
                let res = fetch_source(&http, global, host, &source.url).await;
                (source, res)
            });
        }

        let mut ingested = 0usize;
        let mut failed = 0usize;
        let fetched_at = Utc::now();

        while let Some(joined) = set.join_next().await {
            let Ok((source, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(parsed) => {
                    let items = materialize(&source, parsed.entries, fetched_at);
                    ingested += items.len();
                    let ttl = parsed.ttl.unwrap_or(MAX_SOURCE_TTL).min(MAX_SOURCE_TTL);
                    self.store_cache(&source.id, items, ttl, now);
                    self.with_state(&source.id, |st| st.on_success());
                }
                Err(FetchFailure::Transient(msg)) => {
                    failed += 1;
                    counter!("feeds_source_errors_total").increment(1);
                    warn!(source = %source.id, error = %msg, "transient feed failure");
                    self.with_state(&source.id, |st| st.on_transient_failure());
                }
                Err(FetchFailure::Hard(msg)) => {
                    failed += 1;
                    counter!("feeds_source_errors_total").increment(1);
                    warn!(source = %source.id, error = %msg, "feed disabled for interval");
                    self.with_state(&source.id, |st| st.on_hard_failure(Instant::now()));
                }
            }
        }

        // Outage bookkeeping: a cycle where everything attempted failed.
        {
            let mut cycles = self.outage_cycles.lock().expect("outage mutex poisoned");
            let entry = cycles.entry(category).or_insert(0);
            if attempted > 0 && failed == attempted {
                *entry += 1;
            } else if attempted > 0 {
                *entry = 0;
            }
        }

        counter!("feeds_refresh_runs_total").increment(1);
        counter!("feeds_items_ingested_total").increment(ingested as u64);
        gauge!("feeds_last_refresh_ts").set(Utc::now().timestamp() as f64);
        *last_run = Some(Instant::now());

        debug!(%category, attempted, ingested, failed, "refresh cycle done");
        ingested
    }

    /// Cached items of the category with `published_at >= since`, newest
    /// first, plus the category outage flag.
    pub fn recent(&self, category: Category, since: DateTime<Utc>) -> CategoryView {
        let cache = self.cache.read().expect("feed cache poisoned");
        let mut items: Vec<Item> = self
            .catalogue
            .enabled_for(category)
            .iter()
            .filter_map(|s| cache.get(&s.id))
            .flat_map(|c| c.items.iter())
            .filter(|it| it.published_at >= since)
            .cloned()
            .collect();
        drop(cache);

        items.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        let outage = self
            .outage_cycles
            .lock()
            .expect("outage mutex poisoned")
            .get(&category)
            .copied()
            .unwrap_or(0)
            >= OUTAGE_CYCLES;

        CategoryView { items, outage }
    }

    fn source_ready(&self, id: &str, now: Instant) -> bool {
        self.states
            .lock()
            .expect("state mutex poisoned")
            .get(id)
            .map(|st| st.ready(now))
            .unwrap_or(true)
    }

    fn cache_fresh(&self, id: &str, now: Instant) -> bool {
        self.cache
            .read()
            .expect("feed cache poisoned")
            .get(id)
            .map(|c| now.duration_since(c.fetched_at) < c.ttl)
            .unwrap_or(false)
    }

    fn store_cache(&self, id: &str, items: Vec<Item>, ttl: Duration, fetched_at: Instant) {
        let entry = Arc::new(SourceCache {
            fetched_at,
            ttl,
            items,
        });
        self.cache
            .write()
            .expect("feed cache poisoned")
            .insert(id.to_string(), entry);
    }

    fn with_state(&self, id: &str, f: impl FnOnce(&mut SourceState)) {
        let mut states = self.states.lock().expect("state mutex poisoned");
        f(states.entry(id.to_string()).or_default());
    }

    fn host_permits(&self, url: &str) -> Arc<Semaphore> {
        let host = host_of(url).to_string();
        let mut map = self.per_host.lock().expect("host mutex poisoned");
        map.entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(PER_HOST_PERMITS)))
            .clone()
    }
}

/// Turn parsed entries into `Item` records, assigning fingerprints and the
/// estimated-time flag, dropping fingerprint duplicates within the batch.
fn materialize(source: &Source, entries: Vec<parse::RawEntry>, fetched_at: DateTime<Utc>) -> Vec<Item> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .take(MAX_ENTRIES_PER_SOURCE)
        .filter_map(|e| {
            let fp = parse::fingerprint(&e.title, &source.id);
            if !seen.insert(fp.clone()) {
                return None;
            }
            let (published_at, time_estimated) = match e.published {
                Some(ts) => (ts, false),
                None => (fetched_at, true),
            };
            Some(Item {
                source_id: source.id.clone(),
                category: source.category,
                title: e.title,
                url: e.url,
                published_at,
                fetched_at,
                time_estimated,
                reliability_weight: source.reliability_weight,
                fingerprint: fp,
            })
        })
        .collect()
}

fn host_of(url: &str) -> &str {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

/// Fetch and parse one feed URL. One retry with backoff on transient errors;
/// bad statuses below 500 and unparseable documents are hard failures.
async fn fetch_source(
    http: &reqwest::Client,
    global: Arc<Semaphore>,
    host: Arc<Semaphore>,
    url: &str,
) -> Result<ParsedFeed, FetchFailure> {
    let _g = global.acquire().await.map_err(|_| {
        FetchFailure::Transient("fetcher shutting down".to_string())
    })?;
    let _h = host.acquire().await.map_err(|_| {
        FetchFailure::Transient("fetcher shutting down".to_string())
    })?;

    let mut attempt = 0u32;
    loop {
        match fetch_once(http, url).await {
            Ok(parsed) => return Ok(parsed),
            Err(FetchFailure::Transient(msg)) if attempt == 0 => {
                attempt += 1;
                let jitter = rand::thread_rng().gen_range(0..250);
                tokio::time::sleep(Duration::from_millis(500 + jitter)).await;
                debug!(url, error = %msg, "retrying feed after transient failure");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn fetch_once(http: &reqwest::Client, url: &str) -> Result<ParsedFeed, FetchFailure> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| FetchFailure::Transient(e.to_string()))?;

    let status = resp.status();
    if status.is_server_error() || status.as_u16() == 429 {
        return Err(FetchFailure::Transient(format!("status {status}")));
    }
    if !status.is_success() {
        return Err(FetchFailure::Hard(format!("status {status}")));
    }

    let body = resp
        .text()
        .await
        .map_err(|e| FetchFailure::Transient(e.to_string()))?;
    parse::parse_feed(&body).map_err(|e| FetchFailure::Hard(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_of("https://feeds.bbci.co.uk/news/rss.xml"), "feeds.bbci.co.uk");
        assert_eq!(host_of("http://rss.cnn.com/rss/edition.rss"), "rss.cnn.com");
        assert_eq!(host_of("no-scheme"), "no-scheme");
    }

    #[test]
    fn materialize_flags_missing_dates_and_dedups() {
        let source = Source {
            id: "s".into(),
            category: Category::Tech,
            url: "https://example.com/rss".into(),
            reliability_weight: 1.0,
            enabled: true,
        };
        let now = Utc::now();
        let entries = vec![
            parse::RawEntry {
                title: "A story".into(),
                url: "https://example.com/1".into(),
                published: Some(now - chrono::Duration::hours(1)),
            },
            parse::RawEntry {
                title: "No date".into(),
                url: "https://example.com/2".into(),
                published: None,
            },
            // Same title again: same fingerprint, dropped.
            parse::RawEntry {
                title: "A story".into(),
                url: "https://example.com/3".into(),
                published: Some(now),
            },
        ];
        let items = materialize(&source, entries, now);
        assert_eq!(items.len(), 2);
        assert!(!items[0].time_estimated);
        assert!(items[1].time_estimated);
        assert_eq!(items[1].published_at, now);
    }

    #[tokio::test]
    async fn recent_filters_by_age_and_sorts_newest_first() {
        let cat = Catalogue::builtin();
        let fetcher = FeedFetcher::new(cat, 4).unwrap();
        let now = Utc::now();

        let source = Source {
            id: "bbc-world".into(),
            category: Category::Global,
            url: "https://feeds.bbci.co.uk/news/rss.xml".into(),
            reliability_weight: 1.4,
            enabled: true,
        };
        let entries = vec![
            parse::RawEntry {
                title: "Old".into(),
                url: "https://e/1".into(),
                published: Some(now - chrono::Duration::hours(30)),
            },
            parse::RawEntry {
                title: "Fresh".into(),
                url: "https://e/2".into(),
                published: Some(now - chrono::Duration::minutes(5)),
            },
        ];
        fetcher.store_cache(
            "bbc-world",
            materialize(&source, entries, now),
            MAX_SOURCE_TTL,
            Instant::now(),
        );

        let view = fetcher.recent(Category::Global, now - chrono::Duration::hours(3));
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.items[0].title, "Fresh");
        assert!(!view.outage);

        let wide = fetcher.recent(Category::Global, now - chrono::Duration::hours(48));
        assert_eq!(wide.items.len(), 2);
        assert_eq!(wide.items[0].title, "Fresh");
    }
}
