use crate::error::AppError;
use crate::feed::notifier::NotificationSink;
use crate::feed::pipeline::run_feed;
use crate::feed::store::CurrentValue;
use crate::feed::types::{
    parse_cfds_payload, parse_identity_payload, parse_maker_status_payload, parse_offer_payload,
    parse_quote_payload, parse_wallet_payload, Cfd, ConnectionStatus, FeedSession,
    FeedStatusSnapshot, FeedStopResult, IdentityInfo, Quote, StartFeedArgs, TakerOffer, WalletInfo,
};
use crate::feed::{TOPIC_CFDS, TOPIC_IDENTITY, TOPIC_LONG_OFFER, TOPIC_MAKER_STATUS, TOPIC_QUOTE, TOPIC_SHORT_OFFER, TOPIC_WALLET};
use crate::state::{ClientState, StreamHandle};
use crate::ticker::pipeline::run_price_feed;
use crate::ticker::types::{PriceFeedSession, PriceFeedStatusSnapshot, StartPriceFeedArgs};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn start_feed(
    state: &ClientState,
    args: Option<StartFeedArgs>,
) -> Result<FeedSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut feed_slot = state.feed.lock().await;
        feed_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let store = Arc::clone(&state.store);
    let status_store = Arc::clone(&state.feed_status);
    let connected_tx = Arc::clone(&state.feed_connected);
    let notifications = Arc::clone(&state.notifications) as Arc<dyn NotificationSink>;
    let runtime_config = config.clone();

    let join_handle = tokio::spawn(async move {
        run_feed(
            runtime_config,
            store,
            status_store,
            connected_tx,
            notifications,
            task_token,
        )
        .await;
    });

    {
        let mut feed_slot = state.feed.lock().await;
        *feed_slot = Some(StreamHandle {
            cancellation_token,
            join_handle,
        });
    }

    Ok(FeedSession::from_config(&config))
}

pub async fn stop_feed(state: &ClientState) -> Result<FeedStopResult, AppError> {
    let existing_handle = {
        let mut feed_slot = state.feed.lock().await;
        feed_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    {
        let current_endpoint = {
            let readable = state.feed_status.read().await;
            readable.endpoint.clone()
        };
        let mut writable = state.feed_status.write().await;
        *writable = FeedStatusSnapshot::stopped(
            current_endpoint,
            Some("feed stopped by command".to_string()),
        );
    }
    state.feed_connected.send_replace(false);

    Ok(FeedStopResult { stopped })
}

pub async fn feed_status(state: &ClientState) -> FeedStatusSnapshot {
    state.feed_status.read().await.clone()
}

pub fn feed_connected(state: &ClientState) -> bool {
    *state.feed_connected.borrow()
}

pub async fn start_price_feed(
    state: &ClientState,
    args: Option<StartPriceFeedArgs>,
) -> Result<PriceFeedSession, AppError> {
    let config = args.unwrap_or_default().normalize()?;

    let existing_handle = {
        let mut price_slot = state.price_feed.lock().await;
        price_slot.take()
    };
    if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    let price_tx = Arc::clone(&state.reference_price);
    let status_store = Arc::clone(&state.price_status);
    let runtime_config = config.clone();

    let join_handle = tokio::spawn(async move {
        run_price_feed(runtime_config, price_tx, status_store, task_token).await;
    });

    {
        let mut price_slot = state.price_feed.lock().await;
        *price_slot = Some(StreamHandle {
            cancellation_token,
            join_handle,
        });
    }

    Ok(PriceFeedSession::from_config(&config))
}

pub async fn stop_price_feed(state: &ClientState) -> Result<FeedStopResult, AppError> {
    let existing_handle = {
        let mut price_slot = state.price_feed.lock().await;
        price_slot.take()
    };

    let stopped = if let Some(handle) = existing_handle {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
        true
    } else {
        false
    };

    {
        let current_instrument = {
            let readable = state.price_status.read().await;
            readable.instrument.clone()
        };
        let mut writable = state.price_status.write().await;
        *writable = PriceFeedStatusSnapshot::stopped(
            current_instrument,
            Some("price feed stopped by command".to_string()),
        );
    }

    Ok(FeedStopResult { stopped })
}

pub async fn price_feed_status(state: &ClientState) -> PriceFeedStatusSnapshot {
    state.price_status.read().await.clone()
}

pub fn reference_price(state: &ClientState) -> Option<f64> {
    *state.reference_price.borrow()
}

pub fn subscribe_wallet(state: &ClientState) -> CurrentValue<Option<WalletInfo>> {
    state.store.subscribe_with(TOPIC_WALLET, parse_wallet_payload)
}

pub fn subscribe_maker_status(state: &ClientState) -> CurrentValue<ConnectionStatus> {
    state
        .store
        .subscribe_with(TOPIC_MAKER_STATUS, parse_maker_status_payload)
}

/// The maker publishes its own side: its short offer is what the taker
/// can go long on, and vice versa.
pub fn subscribe_long_offer(state: &ClientState) -> CurrentValue<TakerOffer> {
    state
        .store
        .subscribe_with(TOPIC_SHORT_OFFER, parse_offer_payload)
}

pub fn subscribe_short_offer(state: &ClientState) -> CurrentValue<TakerOffer> {
    state
        .store
        .subscribe_with(TOPIC_LONG_OFFER, parse_offer_payload)
}

pub fn subscribe_cfds(state: &ClientState) -> CurrentValue<Vec<Cfd>> {
    state.store.subscribe_with(TOPIC_CFDS, parse_cfds_payload)
}

pub fn subscribe_quote(state: &ClientState) -> CurrentValue<Option<Quote>> {
    state.store.subscribe_with(TOPIC_QUOTE, parse_quote_payload)
}

pub fn subscribe_identity(state: &ClientState) -> CurrentValue<IdentityInfo> {
    state
        .store
        .subscribe_with(TOPIC_IDENTITY, parse_identity_payload)
}

/// Tears the runtime down: both pipelines cancelled and joined, all
/// subscriptions released, notifications dismissed.
pub async fn shutdown(state: &ClientState) -> Result<(), AppError> {
    stop_feed(state).await?;
    stop_price_feed(state).await?;
    state.store.clear();
    state.notifications.clear();
    Ok(())
}
