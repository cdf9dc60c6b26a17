use crate::feed::store::CurrentValue;
use crate::feed::types::ConnectionStatus;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const CONNECTION_NOTIFICATION_ID: &str = "connection-toast";
pub const MAKER_NOTIFICATION_ID: &str = "maker-connection-toast";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// Persistent, non-auto-dismissing user notification. The `id` is the
/// de-duplication key: raising an id that is already active is a no-op.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
}

pub trait NotificationSink: Send + Sync {
    fn raise(&self, notification: Notification);
    fn dismiss(&self, id: &str);
    fn is_active(&self, id: &str) -> bool;
}

/// Default sink: holds the active notification set for the view layer to
/// render.
#[derive(Default)]
pub struct NotificationCenter {
    active: Mutex<Vec<Notification>>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Vec<Notification> {
        self.active.lock().clone()
    }

    pub fn clear(&self) {
        self.active.lock().clear();
    }
}

impl NotificationSink for NotificationCenter {
    fn raise(&self, notification: Notification) {
        let mut active = self.active.lock();
        if active.iter().any(|entry| entry.id == notification.id) {
            return;
        }
        tracing::info!(id = %notification.id, title = %notification.title, "notification raised");
        active.push(notification);
    }

    fn dismiss(&self, id: &str) {
        let mut active = self.active.lock();
        let before = active.len();
        active.retain(|entry| entry.id != id);
        if active.len() < before {
            tracing::info!(%id, "notification dismissed");
        }
    }

    fn is_active(&self, id: &str) -> bool {
        self.active.lock().iter().any(|entry| entry.id == id)
    }
}

fn connection_lost_notification() -> Notification {
    Notification {
        id: CONNECTION_NOTIFICATION_ID.to_string(),
        severity: Severity::Error,
        title: "Connection error!".to_string(),
        description: "Please ensure your daemon is running. Then refresh the page.".to_string(),
    }
}

fn no_maker_notification() -> Notification {
    Notification {
        id: MAKER_NOTIFICATION_ID.to_string(),
        severity: Severity::Warning,
        title: "No maker!".to_string(),
        description: "You are not connected to any maker. Functionality may be limited".to_string(),
    }
}

/// Turns the two connectivity signals into idempotent raise/dismiss calls.
/// The signals are monitored independently: both notifications can be
/// active at the same time and neither masks the other.
pub struct ConnectivityMonitor {
    sink: Arc<dyn NotificationSink>,
}

impl ConnectivityMonitor {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn observe_stream_connected(&self, connected: bool) {
        let active = self.sink.is_active(CONNECTION_NOTIFICATION_ID);
        if !connected && !active {
            self.sink.raise(connection_lost_notification());
        } else if connected && active {
            self.sink.dismiss(CONNECTION_NOTIFICATION_ID);
        }
    }

    /// An absent maker status (nothing received yet) triggers no
    /// transition in either direction.
    pub fn observe_maker_status(&self, status: Option<ConnectionStatus>) {
        let Some(status) = status else {
            return;
        };

        let active = self.sink.is_active(MAKER_NOTIFICATION_ID);
        if !status.online && !active {
            self.sink.raise(no_maker_notification());
        } else if status.online && active {
            self.sink.dismiss(MAKER_NOTIFICATION_ID);
        }
    }
}

/// Driver task: re-evaluates the monitor whenever either signal changes.
/// Current values are observed once at startup so a feed that never
/// connects still surfaces the connection notification.
pub async fn run_connectivity_notifier(
    mut connected_rx: watch::Receiver<bool>,
    mut maker_status: CurrentValue<ConnectionStatus>,
    sink: Arc<dyn NotificationSink>,
    cancel_token: CancellationToken,
) {
    let monitor = ConnectivityMonitor::new(sink);
    monitor.observe_stream_connected(*connected_rx.borrow_and_update());
    monitor.observe_maker_status(maker_status.get());

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            changed = connected_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                monitor.observe_stream_connected(*connected_rx.borrow_and_update());
            }
            changed = maker_status.changed() => {
                if changed.is_err() {
                    break;
                }
                monitor.observe_maker_status(maker_status.get());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::sse::RawEvent;
    use crate::feed::store::LatestEventStore;
    use crate::feed::types::parse_maker_status_payload;
    use crate::feed::TOPIC_MAKER_STATUS;
    use std::time::Duration;

    fn monitor() -> (ConnectivityMonitor, Arc<NotificationCenter>) {
        let center = Arc::new(NotificationCenter::new());
        let sink: Arc<dyn NotificationSink> = Arc::clone(&center) as _;
        (ConnectivityMonitor::new(sink), center)
    }

    #[test]
    fn raises_and_clears_connection_notification_exactly_once() {
        let (monitor, center) = monitor();

        monitor.observe_stream_connected(true);
        assert!(center.active().is_empty());

        monitor.observe_stream_connected(false);
        monitor.observe_stream_connected(false);
        let active = center.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, CONNECTION_NOTIFICATION_ID);
        assert_eq!(active[0].title, "Connection error!");
        assert_eq!(active[0].severity, Severity::Error);

        monitor.observe_stream_connected(true);
        assert!(center.active().is_empty());

        monitor.observe_stream_connected(true);
        assert!(center.active().is_empty());
    }

    #[test]
    fn maker_notification_follows_online_flag() {
        let (monitor, center) = monitor();

        monitor.observe_maker_status(Some(ConnectionStatus { online: false }));
        monitor.observe_maker_status(Some(ConnectionStatus { online: false }));
        let active = center.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, MAKER_NOTIFICATION_ID);
        assert_eq!(active[0].title, "No maker!");
        assert_eq!(active[0].severity, Severity::Warning);

        monitor.observe_maker_status(Some(ConnectionStatus { online: true }));
        assert!(center.active().is_empty());
    }

    #[test]
    fn absent_maker_status_triggers_no_transition() {
        let (monitor, center) = monitor();

        monitor.observe_maker_status(None);
        assert!(center.active().is_empty());

        monitor.observe_maker_status(Some(ConnectionStatus { online: false }));
        monitor.observe_maker_status(None);
        assert_eq!(center.active().len(), 1);
    }

    #[test]
    fn both_notifications_coexist_independently() {
        let (monitor, center) = monitor();

        monitor.observe_stream_connected(false);
        monitor.observe_maker_status(Some(ConnectionStatus { online: false }));
        assert_eq!(center.active().len(), 2);

        monitor.observe_stream_connected(true);
        let active = center.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, MAKER_NOTIFICATION_ID);

        monitor.observe_maker_status(Some(ConnectionStatus { online: true }));
        assert!(center.active().is_empty());
    }

    #[test]
    fn center_deduplicates_by_stable_id() {
        let center = NotificationCenter::new();

        center.raise(connection_lost_notification());
        center.raise(connection_lost_notification());
        assert_eq!(center.active().len(), 1);

        center.dismiss(CONNECTION_NOTIFICATION_ID);
        center.dismiss(CONNECTION_NOTIFICATION_ID);
        assert!(center.active().is_empty());
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn driver_reacts_to_signal_changes() {
        let store = LatestEventStore::new();
        let maker_status =
            store.subscribe_with(TOPIC_MAKER_STATUS, parse_maker_status_payload);
        let center = Arc::new(NotificationCenter::new());
        let (connected_tx, connected_rx) = watch::channel(true);
        let cancel_token = CancellationToken::new();

        let driver = tokio::spawn(run_connectivity_notifier(
            connected_rx,
            maker_status,
            Arc::clone(&center) as Arc<dyn NotificationSink>,
            cancel_token.clone(),
        ));

        connected_tx.send_replace(false);
        wait_until(|| center.is_active(CONNECTION_NOTIFICATION_ID)).await;

        store.apply_raw_event(&RawEvent {
            topic: TOPIC_MAKER_STATUS.to_string(),
            payload: r#"{"online":false}"#.to_string(),
        });
        wait_until(|| center.is_active(MAKER_NOTIFICATION_ID)).await;

        connected_tx.send_replace(true);
        wait_until(|| !center.is_active(CONNECTION_NOTIFICATION_ID)).await;
        assert!(center.is_active(MAKER_NOTIFICATION_ID));

        store.apply_raw_event(&RawEvent {
            topic: TOPIC_MAKER_STATUS.to_string(),
            payload: r#"{"online":true}"#.to_string(),
        });
        wait_until(|| !center.is_active(MAKER_NOTIFICATION_ID)).await;

        cancel_token.cancel();
        driver.await.expect("driver task should join");
    }
}
