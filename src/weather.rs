//! Weather and holiday collaborators.
//!
//! Both are optional: a missing API key means the corresponding digest block
//! is simply omitted. Results are cached (30 minutes for weather, for the
//! calendar day for holidays) so four digests a day cost a handful of calls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::UpstreamError;

const WEATHER_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Current conditions for one location.
#[derive(Debug, Clone)]
pub struct WeatherNow {
    pub temp_c_min: f64,
    pub temp_c_max: f64,
    pub condition: String,
    /// US EPA index 1–6.
    pub aqi_index: Option<u32>,
    pub uv: Option<f64>,
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, location: &str) -> Result<WeatherNow, UpstreamError>;
}

pub struct WeatherApiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl WeatherApiProvider {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("newsbrief/0.1 (+rss digest bot)")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(WeatherApiProvider {
            http,
            api_key,
            base_url: "http://api.weatherapi.com/v1".to_string(),
        })
    }

    #[doc(hidden)]
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = base.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Deserialize)]
struct WeatherEnvelope {
    current: WeatherCurrent,
}

#[derive(Deserialize)]
struct WeatherCurrent {
    temp_c: f64,
    feelslike_c: Option<f64>,
    condition: WeatherCondition,
    uv: Option<f64>,
    air_quality: Option<AirQuality>,
}

#[derive(Deserialize)]
struct WeatherCondition {
    text: String,
}

#[derive(Deserialize)]
struct AirQuality {
    #[serde(rename = "us-epa-index")]
    us_epa_index: Option<u32>,
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    async fn current(&self, location: &str) -> Result<WeatherNow, UpstreamError> {
        let url = format!(
            "{}/current.json?key={}&q={location}&aqi=yes",
            self.base_url, self.api_key
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| UpstreamError::transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::unavailable(format!(
                "weather status {}",
                resp.status()
            )));
        }
        let env: WeatherEnvelope = resp
            .json()
            .await
            .map_err(|e| UpstreamError::unavailable(format!("weather payload: {e}")))?;

        let t = env.current.temp_c;
        let feels = env.current.feelslike_c.unwrap_or(t);
        Ok(WeatherNow {
            temp_c_min: t.min(feels),
            temp_c_max: t.max(feels),
            condition: env.current.condition.text,
            aqi_index: env.current.air_quality.and_then(|a| a.us_epa_index),
            uv: env.current.uv,
        })
    }
}

/// Caching front for whatever weather provider is wired in.
pub struct WeatherService {
    provider: Box<dyn WeatherProvider>,
    cache: Mutex<HashMap<String, (Instant, WeatherNow)>>,
}

impl WeatherService {
    pub fn new(provider: Box<dyn WeatherProvider>) -> Self {
        WeatherService {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn current(&self, location: &str) -> Result<WeatherNow, UpstreamError> {
        {
            let cache = self.cache.lock().expect("weather cache poisoned");
            if let Some((at, w)) = cache.get(location) {
                if at.elapsed() < WEATHER_CACHE_TTL {
                    return Ok(w.clone());
                }
            }
        }
        let fresh = self.provider.current(location).await?;
        self.cache
            .lock()
            .expect("weather cache poisoned")
            .insert(location.to_string(), (Instant::now(), fresh.clone()));
        Ok(fresh)
    }
}

pub fn aqi_label(index: u32) -> &'static str {
    match index {
        1 => "Good",
        2 => "Moderate",
        3 | 4 => "Unhealthy",
        5 => "Very Unhealthy",
        _ => "Hazardous",
    }
}

pub fn uv_label(uv: f64) -> &'static str {
    if uv <= 0.0 {
        "Minimal"
    } else if uv <= 2.0 {
        "Low"
    } else if uv <= 5.0 {
        "Moderate"
    } else if uv <= 7.0 {
        "High"
    } else if uv <= 10.0 {
        "Very High"
    } else {
        "Extreme"
    }
}

/// Weather block as it appears in the digest.
pub fn render_weather_block(w: &WeatherNow) -> String {
    let mut out = String::from("☀️ WEATHER\n");
    out.push_str(&format!(
        "🌡️ {:.1}°C - {:.1}°C | ☁️ {}\n",
        w.temp_c_min, w.temp_c_max, w.condition
    ));
    match w.aqi_index {
        Some(i) => out.push_str(&format!("🫧 Air: {} ({i})\n", aqi_label(i))),
        None => out.push_str("🫧 Air: N/A\n"),
    }
    match w.uv {
        Some(uv) => out.push_str(&format!("🔆 UV: {} ({uv:.1}/11)", uv_label(uv))),
        None => out.push_str("🔆 UV: N/A"),
    }
    out
}

// ---- holidays ----

#[async_trait]
pub trait HolidayProvider: Send + Sync {
    async fn holidays(&self, country: &str, date: NaiveDate) -> Result<Vec<String>, UpstreamError>;
}

pub struct CalendarificProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl CalendarificProvider {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("newsbrief/0.1 (+rss digest bot)")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(CalendarificProvider {
            http,
            api_key,
            base_url: "https://calendarific.com/api/v2".to_string(),
        })
    }

    #[doc(hidden)]
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.base_url = base.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Deserialize)]
struct HolidayEnvelope {
    response: HolidayResponse,
}

#[derive(Deserialize)]
struct HolidayResponse {
    #[serde(default)]
    holidays: Vec<HolidayRow>,
}

#[derive(Deserialize)]
struct HolidayRow {
    name: String,
}

#[async_trait]
impl HolidayProvider for CalendarificProvider {
    async fn holidays(&self, country: &str, date: NaiveDate) -> Result<Vec<String>, UpstreamError> {
        use chrono::Datelike;
        let url = format!(
            "{}/holidays?api_key={}&country={country}&year={}&month={}&day={}",
            self.base_url,
            self.api_key,
            date.year(),
            date.month(),
            date.day()
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| UpstreamError::transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(UpstreamError::unavailable(format!(
                "holiday status {}",
                resp.status()
            )));
        }
        let env: HolidayEnvelope = resp
            .json()
            .await
            .map_err(|e| UpstreamError::unavailable(format!("holiday payload: {e}")))?;
        Ok(env.response.holidays.into_iter().map(|h| h.name).collect())
    }
}

/// Day-scoped holiday cache.
pub struct HolidayService {
    provider: Box<dyn HolidayProvider>,
    cache: Mutex<HashMap<(String, NaiveDate), Vec<String>>>,
}

impl HolidayService {
    pub fn new(provider: Box<dyn HolidayProvider>) -> Self {
        HolidayService {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn holidays(
        &self,
        country: &str,
        date: NaiveDate,
    ) -> Result<Vec<String>, UpstreamError> {
        let key = (country.to_string(), date);
        {
            let cache = self.cache.lock().expect("holiday cache poisoned");
            if let Some(names) = cache.get(&key) {
                return Ok(names.clone());
            }
        }
        let fresh = self.provider.holidays(country, date).await?;
        let mut cache = self.cache.lock().expect("holiday cache poisoned");
        // Keep the cache day-scoped.
        cache.retain(|(_, d), _| *d == date);
        cache.insert(key, fresh.clone());
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert_eq!(aqi_label(1), "Good");
        assert_eq!(aqi_label(4), "Unhealthy");
        assert_eq!(uv_label(1.2), "Low");
        assert_eq!(uv_label(11.5), "Extreme");
    }

    #[test]
    fn weather_block_renders_range_and_quality() {
        let w = WeatherNow {
            temp_c_min: 25.1,
            temp_c_max: 30.1,
            condition: "Partly cloudy".into(),
            aqi_index: Some(2),
            uv: Some(1.2),
        };
        let block = render_weather_block(&w);
        assert!(block.contains("25.1°C - 30.1°C"));
        assert!(block.contains("Partly cloudy"));
        assert!(block.contains("Moderate (2)"));
        assert!(block.contains("Low (1.2/11)"));
    }

    struct CountingProvider {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl HolidayProvider for CountingProvider {
        async fn holidays(
            &self,
            _country: &str,
            _date: NaiveDate,
        ) -> Result<Vec<String>, UpstreamError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(vec!["Victory Day".to_string()])
        }
    }

    #[tokio::test]
    async fn holiday_cache_hits_provider_once_per_day() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let svc = HolidayService::new(Box::new(CountingProvider {
            calls: calls.clone(),
        }));
        let day = NaiveDate::from_ymd_opt(2025, 12, 16).unwrap();
        let a = svc.holidays("BD", day).await.unwrap();
        let b = svc.holidays("BD", day).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, vec!["Victory Day".to_string()]);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
