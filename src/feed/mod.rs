pub mod notifier;
pub mod pipeline;
pub mod sse;
pub mod store;
pub mod types;

pub const TOPIC_WALLET: &str = "wallet";
pub const TOPIC_MAKER_STATUS: &str = "maker_status";
pub const TOPIC_LONG_OFFER: &str = "long_offer";
pub const TOPIC_SHORT_OFFER: &str = "short_offer";
pub const TOPIC_CFDS: &str = "cfds";
pub const TOPIC_QUOTE: &str = "quote";
pub const TOPIC_IDENTITY: &str = "identity";
pub const TOPIC_HEARTBEAT: &str = "heartbeat";
