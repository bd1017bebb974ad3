//! Message bus between the scheduler and the worker fleet.
//!
//! Delivery is at-least-once: every message is leased with a visibility
//! timeout and must be finished (deleted) or reset (lease extended or
//! cancelled) by its consumer. Handlers stay idempotent against the state
//! store.

mod sqs;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

pub use sqs::SqsRequestQueue;

/// Default lease on a received message; long enough to process a region.
pub const DEFAULT_VISIBILITY: Duration = Duration::from_secs(30 * 60);

/// Long-poll interval for receives.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Opaque lease handle used to finish or reset the message.
    pub receipt: String,
    pub body: String,
}

#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Receive up to `max` messages, leasing each for `visibility`.
    async fn receive(
        &self,
        wait: Duration,
        visibility: Duration,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Delete a processed message.
    async fn finish(&self, receipt: &str) -> Result<()>;

    /// Change the remaining lease; zero returns the message immediately.
    async fn reset(&self, receipt: &str, visibility: Duration) -> Result<()>;

    async fn send(&self, body: &str) -> Result<()>;
}
