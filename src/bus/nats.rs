//! NATS messaging system connection

use crate::bus::{Message, MessageBus, Subscription};
use crate::config::schema::NatsConfig;
use crate::error::{AgentError, AgentResult};
use async_nats::connection::State;
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Messaging system connection backed by NATS
///
/// The client reconnects on its own while any handle to it is alive. The
/// connection ends through [`MessageBus::drain`], through
/// [`MessageBus::close`] dropping the last handle, or when the client gives
/// up; each of these ends in the client's `Closed` event.
pub struct NatsBus {
    /// Taken by `close`; `None` once the connection is closed
    client: Mutex<Option<Client>>,
    /// Stops subscription forwarders
    shutdown: CancellationToken,
    forwarders: TaskTracker,
    closed: CancellationToken,
    drain_timeout: Duration,
}

impl NatsBus {
    /// Connect to the first reachable server
    pub async fn connect(config: &NatsConfig) -> AgentResult<Self> {
        if config.servers.is_empty() {
            return Err(AgentError::BusConnect("no servers configured".to_string()));
        }

        let closed = CancellationToken::new();
        let on_event = closed.clone();

        info!(nats_servers = ?config.servers, "connecting to messaging system");
        let client = ConnectOptions::new()
            .event_callback(move |event| {
                let closed = on_event.clone();
                async move {
                    match event {
                        Event::Connected => info!("messaging system connected"),
                        Event::Disconnected => warn!("messaging system disconnected"),
                        Event::Closed => {
                            info!("messaging system connection closed");
                            closed.cancel();
                        }
                        other => debug!(event = ?other, "messaging system event"),
                    }
                }
            })
            .connect(config.servers.join(",").as_str())
            .await
            .map_err(|e| AgentError::BusConnect(e.to_string()))?;

        info!(
            server = %client.server_info().server_id,
            "messaging system connection established"
        );

        Ok(Self {
            client: Mutex::new(Some(client)),
            shutdown: CancellationToken::new(),
            forwarders: TaskTracker::new(),
            closed,
            drain_timeout: config.drain_timeout(),
        })
    }

    fn client(&self) -> AgentResult<Client> {
        if self.closed.is_cancelled() {
            return Err(AgentError::BusClosed);
        }
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AgentError::BusClosed)
    }

    fn release_client(&self) -> Option<Client> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> AgentResult<()> {
        self.client()?
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| AgentError::BusPublish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str) -> AgentResult<Subscription> {
        let mut subscriber = self
            .client()?
            .subscribe(subject.to_string())
            .await
            .map_err(|e| AgentError::BusSubscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = self.shutdown.clone();
        let name = subject.to_string();

        self.forwarders.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = subscriber.next() => {
                        // Ends once the client has drained the subscription
                        let Some(message) = message else { return };
                        let message = Message {
                            subject: message.subject.to_string(),
                            reply: message.reply.map(|r| r.to_string()),
                            payload: message.payload.to_vec(),
                        };
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                }
            }

            if let Err(e) = subscriber.unsubscribe().await {
                debug!(subject = %name, error = %e, "failed to unsubscribe");
            }
        });

        Ok(Subscription::new(subject, rx))
    }

    async fn drain(&self) -> AgentResult<()> {
        let client = match self.client() {
            Ok(client) => client,
            Err(_) => return Ok(()),
        };
        if !matches!(client.connection_state(), State::Connected) {
            return Err(AgentError::BusReconnecting);
        }

        info!("draining messaging system connection");
        client
            .drain()
            .await
            .map_err(|e| AgentError::BusDrain(e.to_string()))?;
        drop(client);

        tokio::time::timeout(self.drain_timeout, self.closed.cancelled())
            .await
            .map_err(|_| {
                AgentError::BusDrain(format!("not closed within {:?}", self.drain_timeout))
            })?;

        self.forwarders.close();
        self.release_client();
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        self.forwarders.close();
        if tokio::time::timeout(self.drain_timeout, self.forwarders.wait())
            .await
            .is_err()
        {
            warn!("subscription forwarders did not stop in time");
        }

        // Subscribers are gone; dropping the last client handle ends the
        // connection task, which reports Closed once it notices.
        if self.release_client().is_some() {
            info!("closing messaging system connection");
        }
        self.closed.cancel();
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn name(&self) -> &'static str {
        "NATS"
    }
}
