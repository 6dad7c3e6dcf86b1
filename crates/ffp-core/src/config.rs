use crate::feed::AlarmCodes;
use crate::OperationalCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_FALLBACK_URL: &str = "https://isitdns.com/";
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_PERIODIC_RELOAD: u32 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A `(name, value)` cookie, written as a two-element array in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct CookiePair {
    pub name: String,
    pub value: String,
}

impl CookiePair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn header_value(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

impl From<(String, String)> for CookiePair {
    fn from((name, value): (String, String)) -> Self {
        Self { name, value }
    }
}

impl From<CookiePair> for (String, String) {
    fn from(pair: CookiePair) -> Self {
        (pair.name, pair.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub cookie: Option<CookiePair>,
    #[serde(default)]
    pub valid_alarm_codes: Vec<String>,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Local snapshot used instead of the network feed.
    #[serde(default)]
    pub testdata: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl FeedConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn alarm_codes(&self) -> AlarmCodes {
        AlarmCodes::new(self.valid_alarm_codes.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReloadPolicy {
    Always,
    Periodic { cycles: u32 },
}

impl Default for ReloadPolicy {
    fn default() -> Self {
        Self::Periodic {
            cycles: DEFAULT_PERIODIC_RELOAD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenConfig {
    pub name: String,
    pub webdriver_url: String,
    pub url_normal: String,
    pub url_alarm: String,
    #[serde(default)]
    pub pos_x: i32,
    #[serde(default)]
    pub pos_y: i32,
    #[serde(default)]
    pub reload: ReloadPolicy,
    #[serde(default)]
    pub cookies_normal: Vec<CookiePair>,
    #[serde(default)]
    pub cookies_alarm: Vec<CookiePair>,
}

impl ScreenConfig {
    pub fn position(&self) -> (i32, i32) {
        (self.pos_x, self.pos_y)
    }

    /// URL and cookie set this screen should show for `code`.
    pub fn target_for<'a>(
        &'a self,
        code: OperationalCode,
        fallback_url: &'a str,
    ) -> (&'a str, &'a [CookiePair]) {
        match code {
            OperationalCode::Normal => (self.url_normal.as_str(), self.cookies_normal.as_slice()),
            OperationalCode::Alarm => (self.url_alarm.as_str(), self.cookies_alarm.as_slice()),
            OperationalCode::Error => (fallback_url, &[]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    pub highway_name: String,
    #[serde(default)]
    pub highway_markers: Option<PathBuf>,
    #[serde(default = "default_geocoder_url")]
    pub geocoder_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_zoom")]
    pub zoom: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub feed: FeedConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default = "default_fallback_url")]
    pub fallback_url: String,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_browser")]
    pub browser: String,
    pub screens: Vec<ScreenConfig>,
    #[serde(default)]
    pub map: Option<MapConfig>,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the file without validating, so command-line overrides can be applied first.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.screens.is_empty() {
            return Err(ConfigError::Invalid("no screens configured".to_string()));
        }
        if self.feed.period_secs == 0 {
            return Err(ConfigError::Invalid(
                "feed.period_secs must be positive".to_string(),
            ));
        }
        if self.feed.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "feed.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.feed.testdata.is_none() && self.feed.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "feed.url is required unless feed.testdata is set".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut endpoints = HashSet::new();
        for screen in &self.screens {
            if screen.name.trim().is_empty() {
                return Err(ConfigError::Invalid("screen name is empty".to_string()));
            }
            if !names.insert(screen.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate screen name: {}",
                    screen.name
                )));
            }
            if !endpoints.insert(screen.webdriver_url.trim_end_matches('/')) {
                return Err(ConfigError::Invalid(format!(
                    "screen {} shares webdriver endpoint {}",
                    screen.name, screen.webdriver_url
                )));
            }
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

fn default_max_attempts() -> u32 {
    20
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_period_secs() -> u64 {
    5
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_fallback_url() -> String {
    DEFAULT_FALLBACK_URL.to_string()
}

fn default_settle_delay_ms() -> u64 {
    1_000
}

fn default_browser() -> String {
    "firefox".to_string()
}

fn default_geocoder_url() -> String {
    DEFAULT_GEOCODER_URL.to_string()
}

fn default_user_agent() -> String {
    "ffp-infoscreen".to_string()
}

fn default_zoom() -> u8 {
    17
}
