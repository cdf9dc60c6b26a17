use crate::error::AppError;
use crate::feed::sse::RawEvent;
use crate::feed::types::decode_json;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

type ApplyFn = Box<dyn Fn(&str) -> Result<(), AppError> + Send + Sync>;

struct TopicSubscription {
    id: u64,
    apply: ApplyFn,
}

#[derive(Default)]
struct StoreInner {
    topics: HashMap<String, Vec<TopicSubscription>>,
    next_subscription_id: u64,
}

/// Latest-value-per-topic projection of the event stream. Each
/// subscription owns an independent slot: the decoded payload of the most
/// recent event on its topic, or absent until one arrives.
pub struct LatestEventStore {
    inner: Mutex<StoreInner>,
    self_weak: Weak<LatestEventStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventApplyOutcome {
    NoSubscribers,
    Applied { updated: usize },
    DecodeFailed { updated: usize, failed: usize },
}

impl LatestEventStore {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            inner: Mutex::new(StoreInner::default()),
            self_weak: self_weak.clone(),
        })
    }

    pub fn subscribe_with<T, D>(&self, topic: &str, decode: D) -> CurrentValue<T>
    where
        T: Clone + Send + Sync + 'static,
        D: Fn(&str) -> Result<T, AppError> + Send + Sync + 'static,
    {
        let (slot_tx, slot_rx) = watch::channel(None);

        let mut inner = self.inner.lock();
        let id = inner.next_subscription_id;
        inner.next_subscription_id += 1;

        let apply: ApplyFn = Box::new(move |payload| {
            let value = decode(payload)?;
            slot_tx.send_replace(Some(value));
            Ok(())
        });
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(TopicSubscription { id, apply });

        CurrentValue {
            slot_rx,
            store: self.self_weak.clone(),
            topic: topic.to_string(),
            id,
        }
    }

    pub fn subscribe_json<T>(&self, topic: &str) -> CurrentValue<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.subscribe_with(topic, decode_json::<T>)
    }

    /// Passthrough subscription: the payload is stored unchanged.
    pub fn subscribe_raw(&self, topic: &str) -> CurrentValue<String> {
        self.subscribe_with(topic, |payload| Ok(payload.to_string()))
    }

    /// Applies one event to every subscription of its topic. A failing
    /// decode leaves that subscription's previous value intact and never
    /// affects sibling subscriptions or other topics.
    pub fn apply_raw_event(&self, event: &RawEvent) -> EventApplyOutcome {
        let inner = self.inner.lock();
        let Some(subscriptions) = inner.topics.get(&event.topic) else {
            return EventApplyOutcome::NoSubscribers;
        };
        if subscriptions.is_empty() {
            return EventApplyOutcome::NoSubscribers;
        }

        let mut updated = 0_usize;
        let mut failed = 0_usize;
        for subscription in subscriptions {
            match (subscription.apply)(&event.payload) {
                Ok(()) => updated += 1,
                Err(error) => {
                    failed += 1;
                    tracing::warn!(topic = %event.topic, %error, "failed to decode event payload");
                }
            }
        }

        if failed > 0 {
            EventApplyOutcome::DecodeFailed { updated, failed }
        } else {
            EventApplyOutcome::Applied { updated }
        }
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|subscriptions| subscriptions.len())
            .unwrap_or(0)
    }

    /// Drops every subscription. Outstanding `CurrentValue` handles keep
    /// their last value but receive no further updates.
    pub fn clear(&self) {
        self.inner.lock().topics.clear();
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(subscriptions) = inner.topics.get_mut(topic) {
            subscriptions.retain(|subscription| subscription.id != id);
            if subscriptions.is_empty() {
                inner.topics.remove(topic);
            }
        }
    }
}

/// Live-updating handle to one subscription's latest value. Dropping the
/// handle releases the subscription and its decode closure.
pub struct CurrentValue<T> {
    slot_rx: watch::Receiver<Option<T>>,
    store: Weak<LatestEventStore>,
    topic: String,
    id: u64,
}

impl<T: Clone> CurrentValue<T> {
    pub fn get(&self) -> Option<T> {
        self.slot_rx.borrow().clone()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Resolves when a newer value lands in the slot; errors once the
    /// subscription is gone (store cleared or dropped).
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.slot_rx.changed().await
    }
}

impl<T> Drop for CurrentValue<T> {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.topic, self.id);
        }
    }
}
