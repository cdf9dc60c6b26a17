pub mod api;
pub mod error;
pub mod feed;
pub mod state;
pub mod ticker;

pub use error::AppError;
pub use feed::notifier::{Notification, NotificationCenter, NotificationSink, Severity};
pub use feed::store::{CurrentValue, EventApplyOutcome, LatestEventStore};
pub use state::{ClientState, StreamHandle};
