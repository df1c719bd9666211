//! Command intake and dispatch.
//!
//! Long-polls the transport for updates, parses slash commands and answers
//! them inline. The on-demand digest uses the same composition path as the
//! scheduler but with a single send attempt and no slot bookkeeping.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::digest::Assembler;
use crate::feeds::Category;
use crate::market::MarketComposer;
use crate::store::{Store, UserLogRecord};
use crate::transport::{IncomingMessage, Transport};
use crate::weather::{render_weather_block, WeatherService};

/// Timezone assumed until the user sets one.
const DEFAULT_TIMEZONE: &str = "Asia/Dhaka";
const POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    About,
    News,
    Category(Category),
    Weather,
    Subscribe,
    Unsubscribe,
    Status,
    Timezone(Option<String>),
    CryptoStats,
    /// Per-coin report; either `/coin btc`, `/btcstats`, or a bare `/btc`.
    Coin(String),
}

/// Parse a message text into a command. `None` for plain chatter.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    if !text.starts_with('/') {
        return None;
    }
    let mut parts = text.splitn(2, char::is_whitespace);
    let head = parts.next().unwrap_or_default().to_lowercase();
    // Strip a "@botname" suffix used in group chats.
    let head = head.split('@').next().unwrap_or(&head).to_string();
    let args = parts.next().unwrap_or("").trim().to_string();

    let cmd = match head.as_str() {
        "/start" => Command::Start,
        "/help" => Command::Help,
        "/about" => Command::About,
        "/news" => Command::News,
        "/weather" => Command::Weather,
        "/subscribe" => Command::Subscribe,
        "/unsubscribe" => Command::Unsubscribe,
        "/status" => Command::Status,
        "/timezone" => Command::Timezone(if args.is_empty() { None } else { Some(args) }),
        "/cryptostats" => Command::CryptoStats,
        "/local" => Command::Category(Category::Local),
        "/global" => Command::Category(Category::Global),
        "/tech" => Command::Category(Category::Tech),
        "/sports" => Command::Category(Category::Sports),
        "/finance" => Command::Category(Category::FinanceCrypto),
        "/coin" => {
            if args.is_empty() {
                Command::Help
            } else {
                Command::Coin(args.to_lowercase())
            }
        }
        other => {
            let bare = other.trim_start_matches('/');
            if bare.is_empty() || !bare.chars().all(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            // "/btcstats" style first, then bare "/btc" as a coin lookup.
            match bare.strip_suffix("stats") {
                Some(sym) if !sym.is_empty() => Command::Coin(sym.to_string()),
                _ => Command::Coin(bare.to_string()),
            }
        }
    };
    Some(cmd)
}

pub struct CommandService {
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
    assembler: Arc<Assembler>,
    market: Arc<MarketComposer>,
    weather: Option<Arc<WeatherService>>,
}

impl CommandService {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<Store>,
        assembler: Arc<Assembler>,
        market: Arc<MarketComposer>,
        weather: Option<Arc<WeatherService>>,
    ) -> Self {
        CommandService {
            transport,
            store,
            assembler,
            market,
            weather,
        }
    }

    /// Long-poll loop: never returns.
    pub async fn run(self: Arc<Self>) {
        let mut offset: Option<i64> = None;
        info!("command intake running");
        loop {
            match self.transport.get_updates(offset, POLL_TIMEOUT_SECS).await {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        if let Some(msg) = update.message {
                            self.handle_message(msg).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "update poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
    }

    pub async fn handle_message(&self, msg: IncomingMessage) {
        let Some(text) = msg.text.clone() else {
            return;
        };

        let record = UserLogRecord {
            user_id: msg.from_id,
            username: msg.username.clone(),
            first_name: msg.first_name.clone(),
            interaction_time: Utc::now(),
            message_type: if text.starts_with('/') {
                "command".to_string()
            } else {
                "message".to_string()
            },
            location: None,
        };
        if let Err(e) = self.store.log_interaction(&record) {
            warn!(error = %e, "interaction log write failed");
        }

        match parse_command(&text) {
            Some(cmd) => self.dispatch(msg.chat_id, &msg, cmd).await,
            None => {
                self.reply(
                    msg.chat_id,
                    "📰 I deliver curated news digests. Type /news for the latest or /help for all commands.",
                )
                .await;
            }
        }
    }

    async fn dispatch(&self, chat_id: i64, msg: &IncomingMessage, cmd: Command) {
        match cmd {
            Command::Start => {
                let name = msg
                    .first_name
                    .clone()
                    .or_else(|| msg.username.clone())
                    .unwrap_or_else(|| "there".to_string());
                self.reply(chat_id, &start_text(&name)).await;
            }
            Command::Help => self.reply(chat_id, HELP_TEXT).await,
            Command::About => self.reply(chat_id, ABOUT_TEXT).await,
            Command::News => self.send_on_demand_digest(chat_id).await,
            Command::Category(category) => self.send_category(chat_id, category).await,
            Command::Weather => self.send_weather(chat_id).await,
            Command::Subscribe => {
                match self.store.subscribe(chat_id, DEFAULT_TIMEZONE) {
                    Ok(()) => {
                        self.reply(
                            chat_id,
                            "✅ Subscribed. Digests arrive at 8:00, 13:00, 19:00 and 23:00 your local time.\nSet your timezone with /timezone <IANA name>, e.g. `/timezone Europe/Prague`.",
                        )
                        .await
                    }
                    Err(e) => {
                        warn!(chat_id, error = %e, "subscribe failed");
                        self.reply(chat_id, "Something went wrong, please try again.").await;
                    }
                }
            }
            Command::Unsubscribe => match self.store.unsubscribe(chat_id) {
                Ok(true) => self.reply(chat_id, "🔕 Unsubscribed. /subscribe to resume.").await,
                Ok(false) => self.reply(chat_id, "You were not subscribed.").await,
                Err(e) => {
                    warn!(chat_id, error = %e, "unsubscribe failed");
                    self.reply(chat_id, "Something went wrong, please try again.").await;
                }
            },
            Command::Status => self.send_status(chat_id).await,
            Command::Timezone(arg) => self.set_timezone(chat_id, arg).await,
            Command::CryptoStats => {
                let block = self.market.market_block().await;
                self.reply(chat_id, &block).await;
            }
            Command::Coin(symbol) => self.send_coin_detail(chat_id, &symbol).await,
        }
    }

    async fn send_on_demand_digest(&self, chat_id: i64) {
        let tz = match self.store.subscriber(chat_id) {
            Ok(Some(sub)) => sub.tz(),
            _ => DEFAULT_TIMEZONE.parse().unwrap_or(chrono_tz::Asia::Dhaka),
        };
        let now = Utc::now();
        let composed = match self.assembler.compose(chat_id, tz, now, None).await {
            Ok(c) => c,
            Err(e) => {
                warn!(chat_id, error = %e, "on-demand digest failed");
                self.reply(chat_id, "📰 The digest is temporarily unavailable, please try again in a minute.")
                    .await;
                return;
            }
        };

        // Single attempt per part; a failure is reported inline.
        for part in &composed.parts {
            if let Err(e) = self.transport.send_message(chat_id, part).await {
                warn!(chat_id, error = %e, "on-demand send failed");
                if e.is_permanent() {
                    let _ = self.store.deactivate(chat_id);
                }
                return;
            }
        }
        if let Err(e) = self
            .store
            .mark_sent_batch(chat_id, &composed.sent_items, now)
        {
            warn!(chat_id, error = %e, "on-demand dedup write failed");
        }
    }

    async fn send_category(&self, chat_id: i64, category: Category) {
        let now = Utc::now();
        self.assembler.feeds().refresh(category).await;
        match self.assembler.selection().pick(chat_id, category, now) {
            Ok(selection) => {
                let block = crate::digest::render_category_block(category, &selection, now);
                self.reply(chat_id, &block).await;
                let sent: Vec<_> = selection
                    .stories()
                    .map(|it| (it.fingerprint.clone(), category))
                    .collect();
                if let Err(e) = self.store.mark_sent_batch(chat_id, &sent, now) {
                    warn!(chat_id, error = %e, "category dedup write failed");
                }
            }
            Err(e) => {
                warn!(chat_id, error = %e, "category selection failed");
                self.reply(chat_id, "News is temporarily unavailable, please try again.").await;
            }
        }
    }

    async fn send_weather(&self, chat_id: i64) {
        match &self.weather {
            Some(weather) => match weather.current("Dhaka").await {
                Ok(w) => self.reply(chat_id, &render_weather_block(&w)).await,
                Err(e) => {
                    warn!(error = %e, "weather command failed");
                    self.reply(chat_id, "☀️ Weather data temporarily unavailable.").await;
                }
            },
            None => {
                self.reply(chat_id, "Weather is not configured on this instance.")
                    .await
            }
        }
    }

    async fn send_status(&self, chat_id: i64) {
        match self.store.subscriber(chat_id) {
            Ok(Some(sub)) if sub.active => {
                let delivered = self.store.delivery_count(chat_id).unwrap_or(0);
                self.reply(
                    chat_id,
                    &format!(
                        "👤 Subscribed since {}.\nTimezone: {}\nHeadlines delivered: {delivered}",
                        sub.created_at.format("%b %-d, %Y"),
                        sub.timezone,
                    ),
                )
                .await;
            }
            Ok(_) => {
                self.reply(chat_id, "You are not subscribed. /subscribe to start.")
                    .await
            }
            Err(e) => {
                warn!(chat_id, error = %e, "status lookup failed");
                self.reply(chat_id, "Something went wrong, please try again.").await;
            }
        }
    }

    async fn set_timezone(&self, chat_id: i64, arg: Option<String>) {
        let Some(raw) = arg else {
            self.reply(
                chat_id,
                "Usage: `/timezone <IANA name>`, e.g. `/timezone Asia/Dhaka` or `/timezone America/Los_Angeles`.",
            )
            .await;
            return;
        };
        if raw.parse::<chrono_tz::Tz>().is_err() {
            self.reply(
                chat_id,
                &format!("Unknown timezone `{raw}`. Use an IANA name like `Europe/Prague`."),
            )
            .await;
            return;
        }
        match self.store.set_timezone(chat_id, &raw) {
            Ok(true) => {
                self.reply(chat_id, &format!("🕑 Timezone set to {raw}."))
                    .await
            }
            Ok(false) => {
                self.reply(chat_id, "Subscribe first with /subscribe, then set your timezone.")
                    .await
            }
            Err(e) => {
                warn!(chat_id, error = %e, "timezone update failed");
                self.reply(chat_id, "Something went wrong, please try again.").await;
            }
        }
    }

    async fn send_coin_detail(&self, chat_id: i64, symbol: &str) {
        match self.market.coin_detail(symbol).await {
            Ok(Some(report)) => self.reply(chat_id, &report).await,
            Ok(None) => {
                self.reply(
                    chat_id,
                    &format!(
                        "❌ I don't know `{}` as a command or a coin. Type /help for the command list.",
                        symbol
                    ),
                )
                .await
            }
            Err(e) => {
                warn!(symbol, error = %e, "coin detail failed");
                self.reply(
                    chat_id,
                    &format!("Market data for {} is temporarily unavailable.", symbol.to_uppercase()),
                )
                .await;
            }
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.transport.send_message(chat_id, text).await {
            warn!(chat_id, error = %e, "reply failed");
            if e.is_permanent() {
                let _ = self.store.deactivate(chat_id);
            }
        }
    }
}

fn start_text(name: &str) -> String {
    format!(
        "🗞️ *Welcome, {name}!*\n\n\
         I deliver a curated news digest four times a day: breaking headlines in five \
         categories, the crypto market picture, weather and holidays.\n\n\
         /subscribe — scheduled digests in your timezone\n\
         /news — a digest right now\n\
         /help — everything I understand"
    )
}

const HELP_TEXT: &str = "📚 *Commands*\n\n\
*News*\n\
/news — full digest now\n\
/local /global /tech /sports /finance — one category, five fresh headlines\n\
/weather — current weather\n\n\
*Crypto*\n\
/cryptostats — market cap, volume, fear/greed, movers and AI take\n\
/coin <symbol> or /btc — quick coin lookup\n\
/<symbol>stats (e.g. /btcstats) — technical report with RSI, support/resistance and a signal\n\n\
*Subscription*\n\
/subscribe — digests at 8:00, 13:00, 19:00, 23:00 local time\n\
/unsubscribe — stop scheduled digests\n\
/timezone <IANA name> — e.g. /timezone Europe/Prague\n\
/status — your subscription details";

const ABOUT_TEXT: &str = "🤖 *newsbrief*\n\
A news digest service: 40+ curated RSS sources across five categories, \
crypto market intelligence with AI commentary, weather and holiday context. \
Each digest carries exactly five fresh headlines per category and never \
repeats a story you have already received.";
