//! Startup configuration.
//!
//! All recognized options are read from the environment exactly once and
//! validated into a `Config` value that is passed explicitly to every
//! component. Missing required credentials abort startup with a clear
//! message instead of failing later mid-delivery.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Bot credential for the messaging transport.
    pub telegram_token: String,
    /// Credential for the AI commentary provider.
    pub ai_api_key: String,
    /// Weather provider key; weather block is skipped when absent.
    pub weather_api_key: Option<String>,
    /// Holiday provider key; holiday line is skipped when absent.
    pub holiday_api_key: Option<String>,
    /// Stock/FX index quote key; index row is skipped when absent.
    pub market_index_api_key: Option<String>,
    /// Severity filter passed to the tracing subscriber.
    pub log_level: String,
    /// Directory holding the embedded database.
    pub data_dir: PathBuf,
    /// Scheduler tick.
    pub tick_interval: Duration,
    /// Global cap on concurrent feed HTTP requests.
    pub feed_parallelism: usize,
    /// Delivery worker pool size.
    pub delivery_parallelism: usize,
    /// Age after which delivery records are purged.
    pub dedup_retention_days: u32,
    /// Regenerate AI commentary per recipient instead of per snapshot.
    pub commentary_per_recipient: bool,
    /// Listen address for the /health + /metrics surface.
    pub ops_listen_addr: SocketAddr,
    /// Optional feed catalogue file overriding the built-in table.
    pub feeds_config_path: Option<PathBuf>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
    }
}

impl Config {
    /// Read and validate the full option set from the environment.
    pub fn from_env() -> Result<Self> {
        let telegram_token = env_opt("TELEGRAM_TOKEN")
            .context("TELEGRAM_TOKEN is required (transport credential)")?;
        let ai_api_key =
            env_opt("AI_API_KEY").context("AI_API_KEY is required (commentary credential)")?;

        let tick_secs: u64 = env_parse("TICK_INTERVAL_SECONDS", 60)?;
        if tick_secs == 0 {
            bail!("TICK_INTERVAL_SECONDS must be positive");
        }
        let feed_parallelism: usize = env_parse("FEED_PARALLELISM", 16)?;
        if feed_parallelism == 0 {
            bail!("FEED_PARALLELISM must be positive");
        }
        let delivery_parallelism: usize = env_parse("DELIVERY_PARALLELISM", 8)?;
        if delivery_parallelism == 0 {
            bail!("DELIVERY_PARALLELISM must be positive");
        }
        let dedup_retention_days: u32 = env_parse("DEDUP_RETENTION_DAYS", 7)?;
        if dedup_retention_days == 0 {
            bail!("DEDUP_RETENTION_DAYS must be positive");
        }

        let ops_listen_addr: SocketAddr = env_opt("OPS_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("OPS_LISTEN_ADDR must be host:port")?;

        Ok(Config {
            telegram_token,
            ai_api_key,
            weather_api_key: env_opt("WEATHER_API_KEY"),
            holiday_api_key: env_opt("HOLIDAY_API_KEY"),
            market_index_api_key: env_opt("MARKET_INDEX_API_KEY"),
            log_level: env_opt("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            data_dir: PathBuf::from(env_opt("DATA_DIR").unwrap_or_else(|| "./data".to_string())),
            tick_interval: Duration::from_secs(tick_secs),
            feed_parallelism,
            delivery_parallelism,
            dedup_retention_days,
            commentary_per_recipient: env_opt("COMMENTARY_PER_RECIPIENT")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            ops_listen_addr,
            feeds_config_path: env_opt("FEEDS_CONFIG_PATH").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn clear_all() {
        for key in [
            "TELEGRAM_TOKEN",
            "AI_API_KEY",
            "WEATHER_API_KEY",
            "HOLIDAY_API_KEY",
            "MARKET_INDEX_API_KEY",
            "LOG_LEVEL",
            "DATA_DIR",
            "TICK_INTERVAL_SECONDS",
            "FEED_PARALLELISM",
            "DELIVERY_PARALLELISM",
            "DEDUP_RETENTION_DAYS",
            "COMMENTARY_PER_RECIPIENT",
            "OPS_LISTEN_ADDR",
            "FEEDS_CONFIG_PATH",
        ] {
            env::remove_var(key);
        }
    }

    #[serial_test::serial]
    #[test]
    fn missing_required_token_fails_with_clear_message() {
        clear_all();
        env::set_var("AI_API_KEY", "k");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_TOKEN"));
    }

    #[serial_test::serial]
    #[test]
    fn defaults_apply_when_only_required_set() {
        clear_all();
        env::set_var("TELEGRAM_TOKEN", "t");
        env::set_var("AI_API_KEY", "k");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.tick_interval, Duration::from_secs(60));
        assert_eq!(cfg.feed_parallelism, 16);
        assert_eq!(cfg.delivery_parallelism, 8);
        assert_eq!(cfg.dedup_retention_days, 7);
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.commentary_per_recipient);
        assert!(cfg.weather_api_key.is_none());
    }

    #[serial_test::serial]
    #[test]
    fn zero_parallelism_is_rejected() {
        clear_all();
        env::set_var("TELEGRAM_TOKEN", "t");
        env::set_var("AI_API_KEY", "k");
        env::set_var("FEED_PARALLELISM", "0");
        assert!(Config::from_env().is_err());
    }
}
