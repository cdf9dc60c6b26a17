use crate::error::AppError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 15_000;
pub const MIN_IDLE_TIMEOUT_MS: u64 = 5_000;
pub const MAX_IDLE_TIMEOUT_MS: u64 = 120_000;

pub const DEFAULT_LOT_SIZE: f64 = 100.0;
pub const DEFAULT_LEVERAGE: f64 = 2.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStatusSnapshot {
    pub state: FeedConnectionState,
    pub endpoint: String,
    pub events_received: u64,
    pub decode_failures: u64,
    pub last_event_at: Option<i64>,
    pub reason: Option<String>,
}

impl FeedStatusSnapshot {
    pub fn stopped(endpoint: String, reason: Option<String>) -> Self {
        Self {
            state: FeedConnectionState::Stopped,
            endpoint,
            events_received: 0,
            decode_failures: 0,
            last_event_at: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartFeedArgs {
    pub base_url: Option<String>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub idle_timeout_ms: u64,
}

impl FeedConfig {
    pub fn endpoint(&self) -> String {
        format!("{}/api/feed", self.base_url)
    }
}

impl StartFeedArgs {
    pub fn normalize(self) -> Result<FeedConfig, AppError> {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(AppError::InvalidArgument(
                "baseUrl must start with http:// or https://".to_string(),
            ));
        }

        let idle_timeout_ms = self.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS);
        if !(MIN_IDLE_TIMEOUT_MS..=MAX_IDLE_TIMEOUT_MS).contains(&idle_timeout_ms) {
            return Err(AppError::InvalidArgument(format!(
                "idleTimeoutMs must be between {MIN_IDLE_TIMEOUT_MS} and {MAX_IDLE_TIMEOUT_MS}"
            )));
        }

        Ok(FeedConfig {
            base_url,
            idle_timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSession {
    pub running: bool,
    pub base_url: String,
    pub idle_timeout_ms: u64,
}

impl FeedSession {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            running: true,
            base_url: config.base_url.clone(),
            idle_timeout_ms: config.idle_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalletInfo {
    pub balance: f64,
    pub address: String,
    pub last_updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub last_updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityInfo {
    pub taker_id: String,
    pub taker_peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub timestamp: i64,
    pub interval: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CfdState {
    PendingSetup,
    ContractSetup,
    PendingOpen,
    Open,
    PendingSettlement,
    PendingRefund,
    Closed,
    Refunded,
    Rejected,
    SetupFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cfd {
    pub order_id: String,
    pub position: Position,
    pub quantity_usd: f64,
    pub initial_price: f64,
    pub leverage: f64,
    pub profit_btc: Option<f64>,
    pub profit_percent: Option<f64>,
    pub state: CfdState,
}

impl Cfd {
    pub fn is_closed(&self) -> bool {
        matches!(
            self.state,
            CfdState::Closed | CfdState::Refunded | CfdState::Rejected | CfdState::SetupFailed
        )
    }
}

/// Partitions a position list the way the history view consumes it.
pub fn partition_closed(cfds: Vec<Cfd>) -> (Vec<Cfd>, Vec<Cfd>) {
    cfds.into_iter().partition(|cfd| !cfd.is_closed())
}

#[derive(Debug, Deserialize)]
pub struct MakerOfferWire {
    pub id: String,
    pub price: f64,
    pub margin_per_lot: f64,
    pub initial_funding_fee_per_lot: f64,
    pub liquidation_price: f64,
    pub funding_rate_annualized_percent: f64,
    pub funding_rate_hourly_percent: f64,
    pub min_quantity: f64,
    pub max_quantity: f64,
    pub lot_size: f64,
    pub leverage: f64,
}

/// Display model handed to the trade views. Quantity bounds and funding
/// fields are defaulted when no maker offer is available so the views can
/// render an empty form.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TakerOffer {
    pub id: Option<String>,
    pub price: Option<f64>,
    pub margin_per_lot: Option<f64>,
    pub initial_funding_fee_per_lot: Option<f64>,
    pub liquidation_price: Option<f64>,
    pub funding_rate_annualized: Option<f64>,
    pub funding_rate_hourly: Option<f64>,
    pub min_quantity: f64,
    pub max_quantity: f64,
    pub lot_size: f64,
    pub leverage: f64,
}

impl Default for TakerOffer {
    fn default() -> Self {
        Self {
            id: None,
            price: None,
            margin_per_lot: None,
            initial_funding_fee_per_lot: None,
            liquidation_price: None,
            funding_rate_annualized: None,
            funding_rate_hourly: None,
            min_quantity: 0.0,
            max_quantity: 0.0,
            lot_size: DEFAULT_LOT_SIZE,
            leverage: DEFAULT_LEVERAGE,
        }
    }
}

impl TryFrom<MakerOfferWire> for TakerOffer {
    type Error = AppError;

    fn try_from(value: MakerOfferWire) -> Result<Self, Self::Error> {
        let numeric_fields = [
            value.price,
            value.margin_per_lot,
            value.initial_funding_fee_per_lot,
            value.liquidation_price,
            value.funding_rate_annualized_percent,
            value.funding_rate_hourly_percent,
            value.min_quantity,
            value.max_quantity,
            value.lot_size,
            value.leverage,
        ];
        if numeric_fields.iter().any(|field| !field.is_finite()) {
            return Err(AppError::InvalidArgument(
                "maker offer fields must be finite".to_string(),
            ));
        }

        Ok(Self {
            id: Some(value.id),
            price: Some(value.price),
            margin_per_lot: Some(value.margin_per_lot),
            initial_funding_fee_per_lot: Some(value.initial_funding_fee_per_lot),
            liquidation_price: Some(value.liquidation_price),
            funding_rate_annualized: Some(value.funding_rate_annualized_percent),
            funding_rate_hourly: Some(round_to_digits(value.funding_rate_hourly_percent, 5)),
            min_quantity: value.min_quantity,
            max_quantity: value.max_quantity,
            lot_size: value.lot_size,
            leverage: value.leverage,
        })
    }
}

fn round_to_digits(value: f64, digits: u32) -> f64 {
    let factor = 10_f64.powi(digits as i32);
    (value * factor).round() / factor
}

pub(crate) fn decode_json<T: DeserializeOwned>(payload: &str) -> Result<T, AppError> {
    let mut bytes = payload.as_bytes().to_vec();
    Ok(simd_json::serde::from_slice(bytes.as_mut_slice())?)
}

pub fn parse_wallet_payload(payload: &str) -> Result<Option<WalletInfo>, AppError> {
    let wallet: Option<WalletInfo> = decode_json(payload)?;
    if let Some(info) = &wallet {
        if !info.balance.is_finite() || info.balance < 0.0 {
            return Err(AppError::InvalidArgument(
                "wallet balance must be finite and non-negative".to_string(),
            ));
        }
    }
    Ok(wallet)
}

pub fn parse_maker_status_payload(payload: &str) -> Result<ConnectionStatus, AppError> {
    decode_json(payload)
}

/// A `null` payload means the maker currently publishes no offer on this
/// side; the defaulted display offer is returned in that case.
pub fn parse_offer_payload(payload: &str) -> Result<TakerOffer, AppError> {
    let wire: Option<MakerOfferWire> = decode_json(payload)?;
    match wire {
        Some(offer) => offer.try_into(),
        None => Ok(TakerOffer::default()),
    }
}

pub fn parse_cfds_payload(payload: &str) -> Result<Vec<Cfd>, AppError> {
    decode_json(payload)
}

pub fn parse_quote_payload(payload: &str) -> Result<Option<Quote>, AppError> {
    let quote: Option<Quote> = decode_json(payload)?;
    if let Some(quote) = &quote {
        if !quote.bid.is_finite() || !quote.ask.is_finite() {
            return Err(AppError::InvalidArgument(
                "quote bid/ask must be finite".to_string(),
            ));
        }
    }
    Ok(quote)
}

pub fn parse_identity_payload(payload: &str) -> Result<IdentityInfo, AppError> {
    decode_json(payload)
}

pub fn parse_heartbeat_payload(payload: &str) -> Result<Heartbeat, AppError> {
    decode_json(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wallet_payload() {
        let payload = r#"{"balance":0.5,"address":"bcrt1qtest","last_updated_at":1675332000}"#;
        let wallet = parse_wallet_payload(payload)
            .expect("wallet payload should parse")
            .expect("wallet should be present");

        assert_eq!(wallet.balance, 0.5);
        assert_eq!(wallet.address, "bcrt1qtest");
    }

    #[test]
    fn parses_null_wallet_payload_as_absent() {
        let wallet = parse_wallet_payload("null").expect("null wallet should parse");
        assert!(wallet.is_none());
    }

    #[test]
    fn rejects_negative_wallet_balance() {
        let payload = r#"{"balance":-1.0,"address":"bcrt1qtest","last_updated_at":1675332000}"#;
        assert!(parse_wallet_payload(payload).is_err());
    }

    #[test]
    fn transforms_maker_offer_into_display_offer() {
        let payload = r#"{
            "id":"7e9a14c2",
            "price":41000.5,
            "margin_per_lot":0.0024,
            "initial_funding_fee_per_lot":0.00001,
            "liquidation_price":27333.6,
            "funding_rate_annualized_percent":8.76,
            "funding_rate_hourly_percent":0.0010001234,
            "min_quantity":100.0,
            "max_quantity":1000.0,
            "lot_size":100.0,
            "leverage":2.0
        }"#;

        let offer = parse_offer_payload(payload).expect("offer payload should parse");

        assert_eq!(offer.id.as_deref(), Some("7e9a14c2"));
        assert_eq!(offer.price, Some(41000.5));
        assert_eq!(offer.funding_rate_hourly, Some(0.001));
        assert_eq!(offer.min_quantity, 100.0);
        assert_eq!(offer.max_quantity, 1000.0);
    }

    #[test]
    fn defaults_display_offer_when_payload_is_null() {
        let offer = parse_offer_payload("null").expect("null offer should parse");

        assert!(offer.id.is_none());
        assert!(offer.price.is_none());
        assert_eq!(offer.min_quantity, 0.0);
        assert_eq!(offer.max_quantity, 0.0);
        assert_eq!(offer.lot_size, DEFAULT_LOT_SIZE);
        assert_eq!(offer.leverage, DEFAULT_LEVERAGE);
    }

    #[test]
    fn rejects_non_finite_offer_fields() {
        let payload = r#"{
            "id":"7e9a14c2",
            "price":1e999,
            "margin_per_lot":0.0024,
            "initial_funding_fee_per_lot":0.00001,
            "liquidation_price":27333.6,
            "funding_rate_annualized_percent":8.76,
            "funding_rate_hourly_percent":0.001,
            "min_quantity":100.0,
            "max_quantity":1000.0,
            "lot_size":100.0,
            "leverage":2.0
        }"#;

        assert!(parse_offer_payload(payload).is_err());
    }

    #[test]
    fn parses_cfds_and_partitions_closed_positions() {
        let payload = r#"[
            {"order_id":"a","position":"long","quantity_usd":100.0,"initial_price":40000.0,
             "leverage":2.0,"profit_btc":null,"profit_percent":null,"state":"open"},
            {"order_id":"b","position":"short","quantity_usd":200.0,"initial_price":41000.0,
             "leverage":2.0,"profit_btc":0.001,"profit_percent":4.2,"state":"closed"}
        ]"#;

        let cfds = parse_cfds_payload(payload).expect("cfds payload should parse");
        assert_eq!(cfds.len(), 2);

        let (open, closed) = partition_closed(cfds);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, "a");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].order_id, "b");
    }

    #[test]
    fn parses_maker_status_payload() {
        let status = parse_maker_status_payload(r#"{"online":true}"#)
            .expect("maker status payload should parse");
        assert!(status.online);
    }

    #[test]
    fn parses_heartbeat_payload() {
        let heartbeat = parse_heartbeat_payload(r#"{"timestamp":1675332000,"interval":5}"#)
            .expect("heartbeat payload should parse");
        assert_eq!(heartbeat.interval, 5);
    }

    #[test]
    fn normalizes_feed_args_defaults() {
        let config = StartFeedArgs::default()
            .normalize()
            .expect("defaults should be valid");

        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        assert_eq!(config.endpoint(), format!("{DEFAULT_BASE_URL}/api/feed"));
    }

    #[test]
    fn strips_trailing_slash_from_base_url() {
        let config = StartFeedArgs {
            base_url: Some("http://localhost:8000/".to_string()),
            idle_timeout_ms: None,
        }
        .normalize()
        .expect("base url with trailing slash should be valid");

        assert_eq!(config.endpoint(), "http://localhost:8000/api/feed");
    }

    #[test]
    fn rejects_non_http_base_url() {
        let result = StartFeedArgs {
            base_url: Some("ftp://localhost".to_string()),
            idle_timeout_ms: None,
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_idle_timeout_range() {
        let result = StartFeedArgs {
            base_url: None,
            idle_timeout_ms: Some(1),
        }
        .normalize();

        assert!(result.is_err());
    }
}
