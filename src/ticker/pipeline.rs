use crate::feed::pipeline::{now_unix_ms, reconnect_delay};
use crate::feed::types::FeedConnectionState;
use crate::ticker::bitmex::{connect_instrument_stream, parse_instrument_payload};
use crate::ticker::types::{PriceFeedConfig, PriceFeedStatusSnapshot};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

enum StreamDirective {
    Continue,
    ImmediateReconnect,
}

/// Maintains the reference-price subscription. The latest accepted mark
/// price is published into the watch channel; the last value survives
/// reconnects and shutdown so the views keep a price to display.
pub async fn run_price_feed(
    config: PriceFeedConfig,
    price_tx: Arc<watch::Sender<Option<f64>>>,
    status_store: Arc<RwLock<PriceFeedStatusSnapshot>>,
    cancel_token: CancellationToken,
) {
    let mut reconnect_attempt = 0_u32;
    while !cancel_token.is_cancelled() {
        let phase = if reconnect_attempt == 0 {
            FeedConnectionState::Connecting
        } else {
            FeedConnectionState::Reconnecting
        };
        let reason = if reconnect_attempt == 0 {
            Some("opening price websocket".to_string())
        } else {
            Some(format!("reconnect attempt {reconnect_attempt}"))
        };
        publish_price_status(&status_store, &config, phase, reason).await;

        match connect_instrument_stream(&config.url, &config.instrument).await {
            Ok(mut websocket_stream) => {
                reconnect_attempt = 0;
                publish_price_status(
                    &status_store,
                    &config,
                    FeedConnectionState::Live,
                    Some("price websocket connected".to_string()),
                )
                .await;

                let mut immediate_reconnect = false;
                loop {
                    let frame = tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        next_message = websocket_stream.next() => next_message,
                    };

                    let Some(frame_result) = frame else {
                        publish_price_status(
                            &status_store,
                            &config,
                            FeedConnectionState::Reconnecting,
                            Some("price websocket closed by server".to_string()),
                        )
                        .await;
                        break;
                    };

                    match frame_result {
                        Ok(message) => {
                            match handle_message(message, &price_tx, &status_store, &config).await
                            {
                                StreamDirective::Continue => {}
                                StreamDirective::ImmediateReconnect => {
                                    immediate_reconnect = true;
                                    break;
                                }
                            }
                        }
                        Err(error) => {
                            publish_price_status(
                                &status_store,
                                &config,
                                FeedConnectionState::Reconnecting,
                                Some(format!("price websocket frame error: {error}")),
                            )
                            .await;
                            break;
                        }
                    }
                }

                if cancel_token.is_cancelled() {
                    break;
                }

                if immediate_reconnect {
                    reconnect_attempt = 0;
                    continue;
                }
            }
            Err(error) => {
                publish_price_status(
                    &status_store,
                    &config,
                    FeedConnectionState::Reconnecting,
                    Some(format!("price websocket connect error: {error}")),
                )
                .await;
            }
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    publish_price_status(
        &status_store,
        &config,
        FeedConnectionState::Stopped,
        Some("price feed stopped".to_string()),
    )
    .await;
}

async fn handle_message(
    message: Message,
    price_tx: &Arc<watch::Sender<Option<f64>>>,
    status_store: &Arc<RwLock<PriceFeedStatusSnapshot>>,
    config: &PriceFeedConfig,
) -> StreamDirective {
    let parsed = match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            parse_instrument_payload(owned_payload.as_mut_slice())
        }
        Message::Binary(mut binary_payload) => {
            parse_instrument_payload(binary_payload.as_mut_slice())
        }
        Message::Close(_) => return StreamDirective::ImmediateReconnect,
        _ => return StreamDirective::Continue,
    };

    match parsed {
        Ok(Some(mark_price)) => {
            price_tx.send_replace(Some(mark_price));
            let mut writable = status_store.write().await;
            writable.last_price = Some(mark_price);
            writable.last_update_at = Some(now_unix_ms());
        }
        Ok(None) => {}
        Err(error) => {
            tracing::warn!(instrument = %config.instrument, %error, "failed to decode instrument payload");
        }
    }

    StreamDirective::Continue
}

async fn publish_price_status(
    status_store: &Arc<RwLock<PriceFeedStatusSnapshot>>,
    config: &PriceFeedConfig,
    state: FeedConnectionState,
    reason: Option<String>,
) {
    tracing::debug!(?state, reason = ?reason, "price feed status");

    let mut writable = status_store.write().await;
    writable.state = state;
    writable.instrument = config.instrument.clone();
    writable.reason = reason;
}
