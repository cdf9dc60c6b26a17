use crate::feed::notifier::NotificationCenter;
use crate::feed::store::LatestEventStore;
use crate::feed::types::{FeedStatusSnapshot, DEFAULT_BASE_URL};
use crate::ticker::types::{PriceFeedStatusSnapshot, DEFAULT_INSTRUMENT};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

pub struct StreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: tokio::task::JoinHandle<()>,
}

/// Process-lifetime state of the feed runtime: created at application
/// start, disposed through `api::shutdown`. Owns the store, the active
/// notification set, and the handle slots for both background streams.
pub struct ClientState {
    pub started_at: Instant,
    pub store: Arc<LatestEventStore>,
    pub notifications: Arc<NotificationCenter>,
    pub feed: Mutex<Option<StreamHandle>>,
    pub feed_status: Arc<RwLock<FeedStatusSnapshot>>,
    pub feed_connected: Arc<watch::Sender<bool>>,
    pub price_feed: Mutex<Option<StreamHandle>>,
    pub price_status: Arc<RwLock<PriceFeedStatusSnapshot>>,
    pub reference_price: Arc<watch::Sender<Option<f64>>>,
}

impl ClientState {
    pub fn new() -> Self {
        let feed_status = FeedStatusSnapshot::stopped(
            format!("{DEFAULT_BASE_URL}/api/feed"),
            Some("feed idle".to_string()),
        );
        let price_status = PriceFeedStatusSnapshot::stopped(
            DEFAULT_INSTRUMENT.to_string(),
            Some("price feed idle".to_string()),
        );
        let (feed_connected, _) = watch::channel(false);
        let (reference_price, _) = watch::channel(None);

        Self {
            started_at: Instant::now(),
            store: LatestEventStore::new(),
            notifications: Arc::new(NotificationCenter::new()),
            feed: Mutex::new(None),
            feed_status: Arc::new(RwLock::new(feed_status)),
            feed_connected: Arc::new(feed_connected),
            price_feed: Mutex::new(None),
            price_status: Arc::new(RwLock::new(price_status)),
            reference_price: Arc::new(reference_price),
        }
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}
