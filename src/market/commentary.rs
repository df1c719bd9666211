//! AI market commentary.
//!
//! Provider abstraction + a caching client that enforces the call budget:
//! at most one real completion per 30 s, concurrent callers inside that
//! window share the cached text, and any failure or overrun degrades to a
//! deterministic template derived from the snapshot.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::MarketSnapshot;

/// Word cap enforced on whatever the model returns.
const MAX_WORDS: usize = 80;
/// Total budget for one commentary request.
const REQUEST_BUDGET: Duration = Duration::from_secs(3);
/// Minimum spacing between real provider calls.
const CALL_SPACING: Duration = Duration::from_secs(30);

/// Low-level provider: performs one remote completion.
pub trait CommentaryProvider: Send + Sync + 'static {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;
    fn name(&self) -> &'static str;
}

/// OpenAI-compatible chat-completions provider (DeepSeek endpoint).
pub struct DeepSeekProvider {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl DeepSeekProvider {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("newsbrief/0.1 (+rss digest bot)")
            .connect_timeout(Duration::from_secs(2))
            .timeout(REQUEST_BUDGET)
            .build()?;
        Ok(DeepSeekProvider {
            http,
            api_key,
            endpoint: "https://api.deepseek.com/chat/completions".to_string(),
            model: "deepseek-chat".to_string(),
        })
    }

    #[doc(hidden)]
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

impl CommentaryProvider for DeepSeekProvider {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(async move {
            #[derive(Serialize)]
            struct Msg<'a> {
                role: &'a str,
                content: &'a str,
            }
            #[derive(Serialize)]
            struct Req<'a> {
                model: &'a str,
                messages: Vec<Msg<'a>>,
                temperature: f32,
                max_tokens: u32,
            }
            #[derive(Deserialize)]
            struct Resp {
                choices: Vec<Choice>,
            }
            #[derive(Deserialize)]
            struct Choice {
                message: ChoiceMsg,
            }
            #[derive(Deserialize)]
            struct ChoiceMsg {
                content: String,
            }

            let sys = "You are a crypto market analyst. In at most 80 words give the \
                       current sentiment and a 24h directional bias. Plain prose, no \
                       emojis, no disclaimers.";
            let req = Req {
                model: &self.model,
                messages: vec![
                    Msg {
                        role: "system",
                        content: sys,
                    },
                    Msg {
                        role: "user",
                        content: prompt,
                    },
                ],
                temperature: 0.3,
                max_tokens: 160,
            };

            let resp = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&req)
                .send()
                .await
                .ok()?;
            if !resp.status().is_success() {
                return None;
            }
            let body: Resp = resp.json().await.ok()?;
            let content = body.choices.first()?.message.content.trim().to_string();
            if content.is_empty() {
                None
            } else {
                Some(content)
            }
        })
    }

    fn name(&self) -> &'static str {
        "deepseek"
    }
}

/// Deterministic provider for tests and local runs.
pub struct MockProvider {
    pub fixed: String,
}

impl CommentaryProvider for MockProvider {
    fn complete<'a>(
        &'a self,
        _prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        let out = self.fixed.clone();
        Box::pin(async move { Some(out) })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct CacheSlot {
    produced_at: Instant,
    text: String,
}

pub struct CommentaryClient {
    inner: Box<dyn CommentaryProvider>,
    /// When false (COMMENTARY_PER_RECIPIENT), the cache is not consulted,
    /// only the call spacing is; extra callers get the fallback.
    shared_cache: bool,
    cache: Mutex<Option<CacheSlot>>,
    last_call: Mutex<Option<Instant>>,
}

impl CommentaryClient {
    pub fn new(inner: Box<dyn CommentaryProvider>, shared_cache: bool) -> Self {
        CommentaryClient {
            inner,
            shared_cache,
            cache: Mutex::new(None),
            last_call: Mutex::new(None),
        }
    }

    /// Commentary for a snapshot. Never fails: falls back to a templated
    /// sentence when the provider is down, slow, or inside the call window.
    pub async fn commentary(&self, snapshot: &MarketSnapshot) -> String {
        if self.shared_cache {
            let cache = self.cache.lock().expect("commentary cache poisoned");
            if let Some(slot) = cache.as_ref() {
                if slot.produced_at.elapsed() < CALL_SPACING {
                    return slot.text.clone();
                }
            }
        }

        // One real call per spacing window, shared by all callers.
        {
            let mut last = self.last_call.lock().expect("commentary pacer poisoned");
            match *last {
                Some(at) if at.elapsed() < CALL_SPACING => {
                    debug!("commentary call window closed, using fallback");
                    return fallback_commentary(snapshot);
                }
                _ => *last = Some(Instant::now()),
            }
        }

        let prompt = snapshot_prompt(snapshot);
        let result = tokio::time::timeout(REQUEST_BUDGET, self.inner.complete(&prompt)).await;
        match result {
            Ok(Some(text)) => {
                let text = truncate_words(&text, MAX_WORDS);
                if self.shared_cache {
                    *self.cache.lock().expect("commentary cache poisoned") = Some(CacheSlot {
                        produced_at: Instant::now(),
                        text: text.clone(),
                    });
                }
                text
            }
            _ => {
                debug!(provider = self.inner.name(), "commentary failed, using fallback");
                fallback_commentary(snapshot)
            }
        }
    }
}

fn snapshot_prompt(s: &MarketSnapshot) -> String {
    let mut p = format!(
        "Total crypto market cap ${:.2}T ({:+.2}% 24h), volume ${:.1}B.",
        s.total_cap_usd / 1e12,
        s.cap_change_pct_24h,
        s.total_volume_usd / 1e9,
    );
    if let Some(fng) = s.fear_greed_index {
        p.push_str(&format!(" Fear/greed index {fng}/100."));
    }
    if let Some(g) = s.gainers.first() {
        p.push_str(&format!(
            " Top gainer {} {:+.1}%.",
            g.symbol, g.pct_change_24h
        ));
    }
    if let Some(l) = s.losers.first() {
        p.push_str(&format!(" Top loser {} {:+.1}%.", l.symbol, l.pct_change_24h));
    }
    p
}

/// Templated sentence used whenever the provider cannot be asked.
pub fn fallback_commentary(s: &MarketSnapshot) -> String {
    let direction = if s.cap_change_pct_24h >= 0.0 { "up" } else { "down" };
    let mut out = format!(
        "Markets {direction} {:.2}% over 24h",
        s.cap_change_pct_24h.abs()
    );
    if let Some(g) = s.gainers.first() {
        out.push_str(&format!(
            ", gainers led by {} ({:+.1}%)",
            g.symbol, g.pct_change_24h
        ));
    }
    if let Some(l) = s.losers.first() {
        out.push_str(&format!(
            ", laggards led by {} ({:+.1}%)",
            l.symbol, l.pct_change_24h
        ));
    }
    match s.fear_greed_index {
        Some(f) if f >= 55 => out.push_str(". Sentiment leans greedy; bias cautiously higher."),
        Some(f) if f <= 35 => out.push_str(". Sentiment is fearful; bias defensive."),
        _ => out.push_str(". Sentiment is mixed; expect range-bound trade."),
    }
    out
}

/// Cut text to `max` words, appending an ellipsis when something was dropped.
pub fn truncate_words(text: &str, max: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max {
        return words.join(" ");
    }
    let mut out = words[..max].join(" ");
    out.push('…');
    out
}
