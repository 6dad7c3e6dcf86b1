use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;
pub mod feed;

pub use config::{
    ConfigError, CookiePair, FeedConfig, LogConfig, MapConfig, ReloadPolicy, RetryConfig,
    ScreenConfig, ServiceConfig,
};
pub use feed::{classify, evaluate, AlarmCodes, Classification, FeedError};

/// Operational state of the brigade as shown on every screen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationalCode {
    Normal,
    Alarm,
    Error,
}

impl OperationalCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalCode::Normal => "normal",
            OperationalCode::Alarm => "alarm",
            OperationalCode::Error => "error",
        }
    }
}

impl fmt::Display for OperationalCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
