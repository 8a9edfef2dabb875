pub mod assignment;
mod error;
pub mod lifecycle;
mod mutations;
mod queries;
pub mod store;
pub mod visibility;

pub use error::EngineError;
pub use queries::{BookingFilter, ProviderSummary};
pub use store::{BookingStore, WalStore};
pub use visibility::Visibility;

use std::sync::Arc;

use crate::model::Ms;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Booking operations on behalf of a verified actor.
///
/// Holds no booking state of its own: every read and every decision goes
/// through the store, so concurrent requests always see committed values.
pub struct Engine {
    store: Arc<dyn BookingStore>,
}

impl Engine {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self { store }
    }
}
