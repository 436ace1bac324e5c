//! Messaging system abstraction
//!
//! The agent only needs publish/subscribe plus an orderly way to shut the
//! connection down. Implementations:
//! - [`NatsBus`]: production connection to NATS
//! - [`MemoryBus`]: in-process bus for tests and local runs

mod memory;
mod nats;

pub use memory::MemoryBus;
pub use nats::NatsBus;

use crate::error::AgentResult;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A message delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    /// Subject the sender expects an acknowledgement on
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

/// Stream of messages for one subject
///
/// Ends when the bus drains or closes. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription has ended
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Stop accepting messages; those already delivered can still be read
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Connection to the messaging system, shared by all command handlers
///
/// Publishing is fire-and-forget: there are no retries and no delivery
/// guarantees beyond what the underlying system offers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish raw bytes on a subject
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> AgentResult<()>;

    /// Express interest in a subject
    async fn subscribe(&self, subject: &str) -> AgentResult<Subscription>;

    /// End all subscriptions, flush pending publishes, then close
    ///
    /// Fails with `BusReconnecting` if the connection cannot be drained right now.
    async fn drain(&self) -> AgentResult<()>;

    /// Close immediately without flushing
    async fn close(&self);

    /// Cancelled once the connection has closed, however that happened
    fn closed(&self) -> CancellationToken;

    /// Human-readable bus name for logging
    fn name(&self) -> &'static str;
}
