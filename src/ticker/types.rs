use crate::error::AppError;
use crate::feed::types::FeedConnectionState;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REALTIME_URL: &str = "wss://www.bitmex.com/realtime";
pub const DEFAULT_INSTRUMENT: &str = ".BXBT";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartPriceFeedArgs {
    pub url: Option<String>,
    pub instrument: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PriceFeedConfig {
    pub url: String,
    pub instrument: String,
}

impl StartPriceFeedArgs {
    pub fn normalize(self) -> Result<PriceFeedConfig, AppError> {
        let url = self
            .url
            .unwrap_or_else(|| DEFAULT_REALTIME_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(AppError::InvalidArgument(
                "url must start with ws:// or wss://".to_string(),
            ));
        }

        let instrument = self
            .instrument
            .unwrap_or_else(|| DEFAULT_INSTRUMENT.to_string())
            .trim()
            .to_string();

        if instrument.is_empty() || instrument.chars().any(|ch| ch.is_whitespace()) {
            return Err(AppError::InvalidArgument(
                "instrument must be non-empty and contain no whitespace".to_string(),
            ));
        }

        Ok(PriceFeedConfig { url, instrument })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFeedSession {
    pub running: bool,
    pub url: String,
    pub instrument: String,
}

impl PriceFeedSession {
    pub fn from_config(config: &PriceFeedConfig) -> Self {
        Self {
            running: true,
            url: config.url.clone(),
            instrument: config.instrument.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFeedStatusSnapshot {
    pub state: FeedConnectionState,
    pub instrument: String,
    pub last_price: Option<f64>,
    pub last_update_at: Option<i64>,
    pub reason: Option<String>,
}

impl PriceFeedStatusSnapshot {
    pub fn stopped(instrument: String, reason: Option<String>) -> Self {
        Self {
            state: FeedConnectionState::Stopped,
            instrument,
            last_price: None,
            last_update_at: None,
            reason,
        }
    }
}
