// src/config.rs
use crate::utils::AppError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://www.screener.in";
// The site serves reduced markup to unknown agents.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Settings shared by every job run against the source site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Applied to every request; there is no other hang protection.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Ceiling for the annual-report archive crawl.
    pub max_archive_pages: usize,
    /// Size of the per-job fetch pool.
    pub workers: usize,
    /// Attempts per fetch, first try included.
    pub max_attempts: u32,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(30),
            max_archive_pages: 10,
            workers: 2,
            max_attempts: 3,
        }
    }
}

impl ScraperConfig {
    /// Defaults overlaid with `SCREENER_*` environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SCREENER_BASE_URL") {
            tracing::debug!("Using SCREENER_BASE_URL={}", url);
            config.base_url = url;
        }
        if let Ok(agent) = std::env::var("SCREENER_USER_AGENT") {
            config.user_agent = agent;
        }
        if let Some(secs) = env_number::<u64>("SCREENER_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(pages) = env_number::<usize>("SCREENER_MAX_ARCHIVE_PAGES")? {
            config.max_archive_pages = pages;
        }
        if let Some(workers) = env_number::<usize>("SCREENER_WORKERS")? {
            config.workers = workers;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        url::Url::parse(&self.base_url)
            .map_err(|e| AppError::Config(format!("Invalid base URL '{}': {}", self.base_url, e)))?;
        if self.request_timeout.is_zero() {
            return Err(AppError::Config("Request timeout must be positive".to_string()));
        }
        if self.workers == 0 {
            return Err(AppError::Config("Worker pool needs at least one worker".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(AppError::Config("At least one fetch attempt is required".to_string()));
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{} must be a number, got '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
