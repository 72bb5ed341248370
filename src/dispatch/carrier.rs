//! Delivery targets for channel events.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

/// Pushes an event payload to one live connection.
///
/// Implementations report failure through the return value; a channel
/// treats a panicking carrier as a failed delivery.
#[async_trait]
pub trait Carrier: Send + Sync {
    /// Delivers `payload`. Returns true on success.
    async fn deliver(&self, payload: &JsonValue) -> bool;
}

/// Carrier that forwards payloads into a bounded mpsc queue.
#[derive(Debug, Clone)]
pub struct MpscCarrier {
    tx: mpsc::Sender<JsonValue>,
}

impl MpscCarrier {
    /// Forwards into `tx`.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<JsonValue>) -> Self {
        Self { tx }
    }

    /// Creates a carrier together with the receiving end of its queue.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<JsonValue>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Carrier for MpscCarrier {
    async fn deliver(&self, payload: &JsonValue) -> bool {
        self.tx.send(payload.clone()).await.is_ok()
    }
}

/// Runs a delivery with panics turned into failures.
pub(crate) async fn deliver_isolated(carrier: &dyn Carrier, payload: &JsonValue) -> bool {
    match AssertUnwindSafe(carrier.deliver(payload)).catch_unwind().await {
        Ok(delivered) => delivered,
        Err(_) => {
            tracing::warn!("carrier panicked during delivery");
            false
        }
    }
}
