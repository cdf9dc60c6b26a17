use crate::error::AppError;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type BitmexWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn ws_endpoint(base_url: &str, instrument: &str) -> String {
    format!("{base_url}?subscribe=instrument:{instrument}")
}

pub async fn connect_instrument_stream(
    base_url: &str,
    instrument: &str,
) -> Result<BitmexWsStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let request = ws_endpoint(base_url, instrument);
    let (stream, _) = connect_async_with_config(request, Some(ws_config), true).await?;
    Ok(stream)
}

#[derive(Debug, Deserialize)]
struct InstrumentRowWire {
    #[serde(rename = "markPrice", default)]
    mark_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct InstrumentMessageWire {
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    data: Vec<InstrumentRowWire>,
}

/// Extracts the mark price from an `instrument` table message. Welcome,
/// subscription-ack, and partial-update frames without a mark price are
/// skipped rather than treated as errors.
pub fn parse_instrument_payload(payload: &mut [u8]) -> Result<Option<f64>, AppError> {
    let wire: InstrumentMessageWire = simd_json::serde::from_slice(payload)?;
    if wire.table.as_deref() != Some("instrument") {
        return Ok(None);
    }

    match wire.data.iter().find_map(|row| row.mark_price) {
        Some(price) if price.is_finite() && price > 0.0 => Ok(Some(price)),
        Some(_) => Err(AppError::InvalidArgument(
            "mark price must be finite and positive".to_string(),
        )),
        None => Ok(None),
    }
}
