use crate::feed::notifier::{run_connectivity_notifier, NotificationSink};
use crate::feed::sse::{connect_feed, RawEvent, SseFrameDecoder};
use crate::feed::store::{EventApplyOutcome, LatestEventStore};
use crate::feed::types::{
    parse_maker_status_payload, FeedConfig, FeedConnectionState, FeedStatusSnapshot,
};
use crate::feed::{TOPIC_HEARTBEAT, TOPIC_MAKER_STATUS};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const STATUS_REFRESH_MS: u64 = 1_000;
const STATUS_ERROR_THROTTLE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, Default)]
struct TelemetrySnapshot {
    events_received: u64,
    decode_failures: u64,
    last_event_at: Option<i64>,
}

#[derive(Debug, Default)]
struct FeedTelemetry {
    events_received: AtomicU64,
    decode_failures: AtomicU64,
    has_last_event_at: AtomicBool,
    last_event_at: AtomicI64,
}

impl FeedTelemetry {
    fn record_event(&self, now_ms: i64) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        self.last_event_at.store(now_ms, Ordering::Relaxed);
        self.has_last_event_at.store(true, Ordering::Relaxed);
    }

    fn record_decode_failures(&self, failed: u64) {
        self.decode_failures.fetch_add(failed, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            last_event_at: if self.has_last_event_at.load(Ordering::Relaxed) {
                Some(self.last_event_at.load(Ordering::Relaxed))
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<FeedConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

struct FeedRuntimeContext<'a> {
    endpoint: &'a str,
    telemetry: &'a Arc<FeedTelemetry>,
    status_store: &'a Arc<RwLock<FeedStatusSnapshot>>,
    connected_tx: &'a Arc<watch::Sender<bool>>,
    status_throttle: &'a Arc<Mutex<StatusPublishThrottle>>,
}

/// Maintains the single logical `/api/feed` subscription: connects,
/// decodes frames into the store, and reconnects with spaced backoff on
/// any stream termination. The connectivity notifier runs alongside and
/// is torn down with the same cancellation token.
pub async fn run_feed(
    config: FeedConfig,
    store: Arc<LatestEventStore>,
    status_store: Arc<RwLock<FeedStatusSnapshot>>,
    connected_tx: Arc<watch::Sender<bool>>,
    notifications: Arc<dyn NotificationSink>,
    cancel_token: CancellationToken,
) {
    let endpoint = config.endpoint();
    let telemetry = Arc::new(FeedTelemetry::default());
    let status_throttle = Arc::new(Mutex::new(StatusPublishThrottle::default()));
    let http_client = Client::new();

    let maker_status = store.subscribe_with(TOPIC_MAKER_STATUS, parse_maker_status_payload);
    let notifier_handle = tokio::spawn(run_connectivity_notifier(
        connected_tx.subscribe(),
        maker_status,
        notifications,
        cancel_token.clone(),
    ));

    let refresh_cancel = cancel_token.clone();
    let refresh_endpoint = endpoint.clone();
    let refresh_telemetry = Arc::clone(&telemetry);
    let refresh_status_store = Arc::clone(&status_store);
    let refresh_connected_tx = Arc::clone(&connected_tx);
    let refresh_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(STATUS_REFRESH_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = refresh_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (current_state, current_reason) = {
                        let readable = refresh_status_store.read().await;
                        (readable.state, readable.reason.clone())
                    };
                    publish_status(
                        &refresh_status_store,
                        &refresh_connected_tx,
                        &refresh_telemetry,
                        current_state,
                        &refresh_endpoint,
                        current_reason,
                    ).await;
                }
            }
        }
    });

    let context = FeedRuntimeContext {
        endpoint: &endpoint,
        telemetry: &telemetry,
        status_store: &status_store,
        connected_tx: &connected_tx,
        status_throttle: &status_throttle,
    };

    let mut reconnect_attempt = 0_u32;
    while !cancel_token.is_cancelled() {
        let phase = if reconnect_attempt == 0 {
            FeedConnectionState::Connecting
        } else {
            FeedConnectionState::Reconnecting
        };
        let reason = if reconnect_attempt == 0 {
            Some("opening event stream".to_string())
        } else {
            Some(format!("reconnect attempt {reconnect_attempt}"))
        };
        publish_status(
            &status_store,
            &connected_tx,
            &telemetry,
            phase,
            &endpoint,
            reason,
        )
        .await;

        match connect_feed(&http_client, &endpoint).await {
            Ok(response) => {
                reconnect_attempt = 0;
                publish_status(
                    &status_store,
                    &connected_tx,
                    &telemetry,
                    FeedConnectionState::Live,
                    &endpoint,
                    Some("event stream connected".to_string()),
                )
                .await;

                let idle_timeout = Duration::from_millis(config.idle_timeout_ms);
                let mut decoder = SseFrameDecoder::default();
                let mut chunks = response.bytes_stream();
                let mut cancelled = false;

                loop {
                    let chunk_read = tokio::select! {
                        _ = cancel_token.cancelled() => {
                            cancelled = true;
                            break;
                        }
                        read = tokio::time::timeout(idle_timeout, chunks.next()) => read,
                    };

                    match chunk_read {
                        Err(_elapsed) => {
                            publish_status_throttled(
                                &context,
                                FeedConnectionState::Reconnecting,
                                Some(format!(
                                    "no events within {}ms, reconnecting",
                                    config.idle_timeout_ms
                                )),
                            )
                            .await;
                            break;
                        }
                        Ok(None) => {
                            publish_status_throttled(
                                &context,
                                FeedConnectionState::Reconnecting,
                                Some("event stream closed by server".to_string()),
                            )
                            .await;
                            break;
                        }
                        Ok(Some(Err(error))) => {
                            publish_status_throttled(
                                &context,
                                FeedConnectionState::Reconnecting,
                                Some(format!("event stream read error: {error}")),
                            )
                            .await;
                            break;
                        }
                        Ok(Some(Ok(chunk))) => {
                            for event in decoder.feed(&chunk) {
                                handle_event(&event, &store, &context).await;
                            }
                        }
                    }
                }

                if cancelled || cancel_token.is_cancelled() {
                    break;
                }
            }
            Err(error) => {
                publish_status_throttled(
                    &context,
                    FeedConnectionState::Reconnecting,
                    Some(format!("event stream connect error: {error}")),
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

    cancel_token.cancel();
    let _ = notifier_handle.await;
    let _ = refresh_handle.await;

    publish_status(
        &status_store,
        &connected_tx,
        &telemetry,
        FeedConnectionState::Stopped,
        &endpoint,
        Some("feed stopped".to_string()),
    )
    .await;
}

async fn handle_event(
    event: &RawEvent,
    store: &Arc<LatestEventStore>,
    context: &FeedRuntimeContext<'_>,
) {
    context.telemetry.record_event(now_unix_ms());

    // Heartbeats only prove liveness; they reset the idle window by
    // arriving and carry nothing for the store.
    if event.topic == TOPIC_HEARTBEAT {
        return;
    }

    match store.apply_raw_event(event) {
        EventApplyOutcome::Applied { .. } | EventApplyOutcome::NoSubscribers => {}
        EventApplyOutcome::DecodeFailed { failed, .. } => {
            context.telemetry.record_decode_failures(failed as u64);
            publish_status_throttled(
                context,
                FeedConnectionState::Live,
                Some(format!("failed to decode '{}' payload", event.topic)),
            )
            .await;
        }
    }
}

async fn publish_status(
    status_store: &Arc<RwLock<FeedStatusSnapshot>>,
    connected_tx: &Arc<watch::Sender<bool>>,
    telemetry: &Arc<FeedTelemetry>,
    state: FeedConnectionState,
    endpoint: &str,
    reason: Option<String>,
) {
    let telemetry_snapshot = telemetry.snapshot();
    let snapshot = FeedStatusSnapshot {
        state,
        endpoint: endpoint.to_string(),
        events_received: telemetry_snapshot.events_received,
        decode_failures: telemetry_snapshot.decode_failures,
        last_event_at: telemetry_snapshot.last_event_at,
        reason,
    };

    tracing::debug!(?state, reason = ?snapshot.reason, "feed status");

    {
        let mut writable = status_store.write().await;
        *writable = snapshot;
    }

    connected_tx.send_replace(state == FeedConnectionState::Live);
}

fn allow_status_publish(
    throttle: &Arc<Mutex<StatusPublishThrottle>>,
    state: FeedConnectionState,
    reason: &Option<String>,
) -> bool {
    let mut writable = throttle.lock();
    let now = Instant::now();

    if writable.last_state == Some(state)
        && writable.last_reason == *reason
        && writable
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    writable.last_state = Some(state);
    writable.last_reason = reason.clone();
    writable.last_emit = Some(now);
    true
}

async fn publish_status_throttled(
    context: &FeedRuntimeContext<'_>,
    state: FeedConnectionState,
    reason: Option<String>,
) {
    if !allow_status_publish(context.status_throttle, state, &reason) {
        return;
    }

    publish_status(
        context.status_store,
        context.connected_tx,
        context.telemetry,
        state,
        context.endpoint,
        reason,
    )
    .await;
}

pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::notifier::NotificationCenter;
    use crate::feed::types::{StartFeedArgs, WalletInfo};
    use crate::feed::TOPIC_WALLET;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn reconnect_delay_spaces_attempts_apart() {
        let first = reconnect_delay(1);
        assert!(first >= Duration::from_millis(400));
        assert!(first < Duration::from_millis(650));
    }

    #[test]
    fn reconnect_delay_is_capped() {
        assert!(reconnect_delay(30) <= Duration::from_millis(5_000));
    }

    #[test]
    fn throttle_suppresses_identical_repeats_only() {
        let throttle = Arc::new(Mutex::new(StatusPublishThrottle::default()));
        let reason = Some("event stream closed by server".to_string());

        assert!(allow_status_publish(
            &throttle,
            FeedConnectionState::Reconnecting,
            &reason
        ));
        assert!(!allow_status_publish(
            &throttle,
            FeedConnectionState::Reconnecting,
            &reason
        ));
        assert!(allow_status_publish(
            &throttle,
            FeedConnectionState::Reconnecting,
            &Some("different reason".to_string())
        ));
    }

    #[test]
    fn telemetry_snapshot_reports_counters() {
        let telemetry = FeedTelemetry::default();
        assert!(telemetry.snapshot().last_event_at.is_none());

        telemetry.record_event(1_000);
        telemetry.record_event(2_000);
        telemetry.record_decode_failures(1);

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.last_event_at, Some(2_000));
    }

    async fn serve_one_sse_response(listener: tokio::net::TcpListener, body: &'static str) {
        let (mut socket, _) = listener.accept().await.expect("accept should succeed");
        let mut request = [0_u8; 1024];
        let _ = socket.read(&mut request).await;

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n{body}"
        );
        socket
            .write_all(response.as_bytes())
            .await
            .expect("write should succeed");
        socket.flush().await.expect("flush should succeed");
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    #[tokio::test]
    async fn pipeline_applies_streamed_events_and_reports_live_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local addr should resolve");
        let server = tokio::spawn(serve_one_sse_response(
            listener,
            "event: wallet\ndata: {\"balance\":0.5,\"address\":\"bcrt1qtest\",\"last_updated_at\":1}\n\n",
        ));

        let config = StartFeedArgs {
            base_url: Some(format!("http://{addr}")),
            idle_timeout_ms: None,
        }
        .normalize()
        .expect("config should be valid");

        let store = LatestEventStore::new();
        let wallet = store.subscribe_with(TOPIC_WALLET, crate::feed::types::parse_wallet_payload);
        let status_store = Arc::new(RwLock::new(FeedStatusSnapshot::stopped(
            config.endpoint(),
            None,
        )));
        let (connected_tx, connected_rx) = watch::channel(false);
        let connected_tx = Arc::new(connected_tx);
        let notifications = Arc::new(NotificationCenter::new());
        let cancel_token = CancellationToken::new();

        let pipeline = tokio::spawn(run_feed(
            config,
            Arc::clone(&store),
            Arc::clone(&status_store),
            Arc::clone(&connected_tx),
            notifications as Arc<dyn NotificationSink>,
            cancel_token.clone(),
        ));

        let mut wallet_arrived = false;
        for _ in 0..200 {
            if wallet.get().flatten().is_some() {
                wallet_arrived = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(wallet_arrived, "wallet event should reach the store");

        let wallet_info: WalletInfo = wallet.get().flatten().expect("wallet should be present");
        assert_eq!(wallet_info.balance, 0.5);

        let mut live_with_counters = false;
        for _ in 0..400 {
            let snapshot = status_store.read().await.clone();
            if snapshot.state == FeedConnectionState::Live && snapshot.events_received >= 1 {
                live_with_counters = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(
            live_with_counters,
            "status should report live with refreshed counters"
        );
        assert!(*connected_rx.borrow());

        cancel_token.cancel();
        pipeline.await.expect("pipeline task should join");
        let _ = server.await;

        let snapshot = status_store.read().await.clone();
        assert_eq!(snapshot.state, FeedConnectionState::Stopped);
        assert!(!*connected_rx.borrow());
    }
}
