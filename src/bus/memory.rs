//! In-process messaging system

use crate::bus::{Message, MessageBus, Subscription};
use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bus that delivers within the process
///
/// Subjects match exactly. Every subscriber of a subject receives every
/// message; messages without subscribers are dropped.
#[derive(Debug, Default)]
pub struct MemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    reconnecting: AtomicBool,
    closed: CancellationToken,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<Message>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a connection that is between servers and cannot drain
    pub fn set_reconnecting(&self, reconnecting: bool) {
        self.reconnecting.store(reconnecting, Ordering::SeqCst);
    }

    /// Publish a message that carries a reply subject
    pub fn publish_request(&self, subject: &str, reply: &str, payload: Vec<u8>) -> AgentResult<()> {
        self.deliver(Message {
            subject: subject.to_string(),
            reply: Some(reply.to_string()),
            payload,
        })
    }

    fn deliver(&self, message: Message) -> AgentResult<()> {
        if self.closed.is_cancelled() {
            return Err(AgentError::BusClosed);
        }

        let mut subscribers = self.subscribers();
        if let Some(senders) = subscribers.get_mut(&message.subject) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }

    fn shut(&self) {
        self.subscribers().clear();
        self.closed.cancel();
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> AgentResult<()> {
        self.deliver(Message {
            subject: subject.to_string(),
            reply: None,
            payload,
        })
    }

    async fn subscribe(&self, subject: &str) -> AgentResult<Subscription> {
        if self.closed.is_cancelled() {
            return Err(AgentError::BusClosed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(subject, rx))
    }

    async fn drain(&self) -> AgentResult<()> {
        if self.reconnecting.load(Ordering::SeqCst) {
            return Err(AgentError::BusReconnecting);
        }
        self.shut();
        Ok(())
    }

    async fn close(&self) {
        self.shut();
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
