//! Node agent lifecycle
//!
//! The agent owns the bus connection, the volume manager, the cache and the
//! job engine. [`Agent::run`] subscribes to every node-scoped command subject
//! and dispatches each command to its own task until [`Agent::stop`] is
//! called or the bus connection closes. Shutdown then waits for in-flight
//! commands, drains the bus (or closes it when it cannot drain) and purges
//! all volumes. Waiting for commands is bounded by the drain timeout, after
//! which running jobs are killed.

mod handlers;
pub mod messages;
mod output;

pub use handlers::Command;
pub use output::BusOutput;

use crate::bus::{Message, MessageBus, NatsBus, Subscription};
use crate::cache::Cache;
use crate::config::Config;
use crate::error::{AgentError, AgentResult};
use crate::image::ImageDownloader;
use crate::orchestration::{JobEngine, SandboxRuntime};
use crate::volume::VolumeManager;
use handlers::Context;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Agent lifecycle states, in the order they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgentState {
    Created,
    Connected,
    Subscribed,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connected => "connected",
            Self::Subscribed => "subscribed",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-node command executor
pub struct Agent {
    node_id: String,
    context: Arc<Context>,
    state: watch::Sender<AgentState>,
    /// Stops pulling new commands
    stopping: CancellationToken,
    /// Kills running jobs
    jobs: CancellationToken,
    dispatchers: TaskTracker,
    handlers: TaskTracker,
    drain_timeout: Duration,
}

impl Agent {
    /// Build an agent on an established bus connection
    pub async fn new(config: &Config, bus: Arc<dyn MessageBus>) -> AgentResult<Self> {
        let (state, _) = watch::channel(AgentState::Created);

        let volumes = Arc::new(VolumeManager::from_config(&config.volumes)?);
        let cache = Cache::new(&config.cache).await?;
        let downloader = ImageDownloader::new(cache.clone(), &config.library.base_url);
        let engine = JobEngine::new(
            SandboxRuntime::new(&config.runtime.binary),
            volumes.clone(),
            cache.clone(),
        );

        state.send_replace(AgentState::Connected);
        info!(
            node_id = %config.node.id,
            bus = bus.name(),
            cache_dir = %cache.base_dir().display(),
            "agent ready"
        );

        Ok(Self {
            node_id: config.node.id.clone(),
            context: Arc::new(Context {
                bus,
                volumes,
                cache,
                downloader,
                engine,
            }),
            state,
            stopping: CancellationToken::new(),
            jobs: CancellationToken::new(),
            dispatchers: TaskTracker::new(),
            handlers: TaskTracker::new(),
            drain_timeout: config.nats.drain_timeout(),
        })
    }

    /// Connect to the configured NATS servers and build an agent
    ///
    /// The connection is closed again if the agent cannot be built.
    pub async fn connect(config: &Config) -> AgentResult<Self> {
        let bus: Arc<dyn MessageBus> = Arc::new(NatsBus::connect(&config.nats).await?);
        match Self::new(config, bus.clone()).await {
            Ok(agent) => Ok(agent),
            Err(e) => {
                bus.close().await;
                Err(e)
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.context.volumes
    }

    pub fn cache(&self) -> &Cache {
        &self.context.cache
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    fn enter(&self, state: AgentState) {
        debug!(state = %state, "agent state changed");
        self.state.send_replace(state);
    }

    /// Serve commands until stopped or the bus connection closes
    ///
    /// Fails without serving anything if a subscription cannot be made.
    pub async fn run(&self) -> AgentResult<()> {
        let closed = self.context.bus.closed();

        let mut subscriptions = Vec::with_capacity(Command::ALL.len());
        for command in Command::ALL {
            let subject = command.subject(&self.node_id);
            let subscription = self.context.bus.subscribe(&subject).await.inspect_err(|e| {
                warn!(subject = %subject, error = %e, "failed to subscribe");
            })?;
            info!(subject = %subject, "subscribed");
            subscriptions.push((*command, subscription));
        }
        self.enter(AgentState::Subscribed);

        for (command, subscription) in subscriptions {
            self.dispatchers.spawn(dispatch(
                command,
                subscription,
                self.context.clone(),
                self.stopping.clone(),
                self.jobs.clone(),
                self.handlers.clone(),
            ));
        }
        self.enter(AgentState::Running);

        tokio::select! {
            _ = self.stopping.cancelled() => {}
            _ = closed.cancelled() => warn!("messaging system connection closed unexpectedly"),
        }
        self.enter(AgentState::Draining);
        self.stopping.cancel();

        self.dispatchers.close();
        self.dispatchers.wait().await;
        self.handlers.close();
        self.finish_handlers().await;

        if !closed.is_cancelled() {
            self.shut_bus().await;
        }

        let volumes = self.context.volumes.list();
        if !volumes.is_empty() {
            info!(volumes = ?volumes, "purging volumes");
        }
        self.context.volumes.purge().await;
        self.enter(AgentState::Closed);
        info!("agent stopped");
        Ok(())
    }

    /// Wait for in-flight commands, killing running jobs if they take too long
    async fn finish_handlers(&self) {
        if self.handlers.is_empty() {
            return;
        }
        info!(in_flight = self.handlers.len(), "waiting for in-flight commands");
        if tokio::time::timeout(self.drain_timeout, self.handlers.wait())
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            in_flight = self.handlers.len(),
            timeout = ?self.drain_timeout,
            "in-flight commands did not finish, cancelling running jobs"
        );
        self.jobs.cancel();
        if tokio::time::timeout(self.drain_timeout, self.handlers.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.handlers.len(),
                "giving up on in-flight commands"
            );
        }
    }

    async fn shut_bus(&self) {
        let bus = &self.context.bus;
        match bus.drain().await {
            Ok(()) => {}
            Err(AgentError::BusReconnecting) => {
                info!("forcefully closing messaging system connection");
                bus.close().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to drain");
                bus.close().await;
            }
        }
    }

    /// Request a graceful stop
    ///
    /// [`Agent::run`] stops taking commands, lets running ones finish within
    /// the drain timeout and then shuts down. A second call kills running
    /// jobs right away.
    pub fn stop(&self) {
        if self.stopping.is_cancelled() {
            warn!("stop requested again, cancelling running jobs");
            self.jobs.cancel();
        } else {
            info!("stopping agent");
            self.stopping.cancel();
        }
    }
}

/// Hand every message of one subscription to its own handler task
async fn dispatch(
    command: Command,
    mut subscription: Subscription,
    context: Arc<Context>,
    stopping: CancellationToken,
    jobs: CancellationToken,
    handlers: TaskTracker,
) {
    loop {
        let message = tokio::select! {
            _ = stopping.cancelled() => break,
            message = subscription.next() => match message {
                Some(message) => message,
                None => break,
            },
        };

        spawn_handler(&handlers, &context, command, message, &jobs);
    }

    // Commands already delivered are still answered
    subscription.close();
    let mut buffered = 0;
    while let Some(message) = subscription.next().await {
        spawn_handler(&handlers, &context, command, message, &jobs);
        buffered += 1;
    }
    debug!(
        subject = subscription.subject(),
        buffered, "stopped dispatching"
    );
}

fn spawn_handler(
    handlers: &TaskTracker,
    context: &Arc<Context>,
    command: Command,
    message: Message,
    jobs: &CancellationToken,
) {
    let context = context.clone();
    let jobs = jobs.clone();
    handlers.spawn(async move { context.handle(command, message, jobs).await });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::schema::{CacheConfig, VolumeConfig, VolumeSpec};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut volumes = BTreeMap::new();
        volumes.insert(
            "EPHEMERAL".to_string(),
            VolumeSpec {
                location: dir.path().join("volumes"),
            },
        );
        Config {
            volumes: VolumeConfig(volumes),
            cache: CacheConfig {
                dir: dir.path().join("cache"),
            },
            ..Config::default()
        }
    }

    async fn running_agent(dir: &TempDir, bus: Arc<MemoryBus>) -> Arc<Agent> {
        let agent = Arc::new(Agent::new(&test_config(dir), bus).await.unwrap());
        let mut state = agent.watch_state();
        let runner = agent.clone();
        tokio::spawn(async move { runner.run().await });
        state
            .wait_for(|s| *s == AgentState::Running)
            .await
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn new_agent_is_connected() {
        let dir = TempDir::new().unwrap();
        let agent = Agent::new(&test_config(&dir), Arc::new(MemoryBus::new()))
            .await
            .unwrap();
        assert_eq!(agent.state(), AgentState::Connected);
        assert_eq!(agent.node_id(), "1");
    }

    #[tokio::test]
    async fn unsupported_volume_type_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.volumes.0.insert(
            "SCRATCH".to_string(),
            VolumeSpec {
                location: dir.path().to_path_buf(),
            },
        );

        let result = Agent::new(&config, Arc::new(MemoryBus::new())).await;
        assert!(matches!(result, Err(AgentError::UnsupportedVolumeType(t)) if t == "SCRATCH"));
    }

    #[tokio::test]
    async fn stop_drains_and_purges() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let agent = running_agent(&dir, bus.clone()).await;

        agent.volumes().create("v1", "EPHEMERAL").await.unwrap();
        let handle = agent.volumes().get_handle("v1").unwrap();
        assert!(handle.exists());

        let mut state = agent.watch_state();
        agent.stop();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == AgentState::Closed),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(bus.closed().is_cancelled());
        assert!(!handle.exists());
        assert!(agent.volumes().list().is_empty());
    }

    #[tokio::test]
    async fn reconnecting_bus_is_closed_forcefully() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(MemoryBus::new());
        bus.set_reconnecting(true);
        let agent = running_agent(&dir, bus.clone()).await;

        let mut state = agent.watch_state();
        agent.stop();
        state
            .wait_for(|s| *s == AgentState::Closed)
            .await
            .unwrap();

        assert!(bus.closed().is_cancelled());
    }

    #[tokio::test]
    async fn bus_close_ends_run() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let agent = running_agent(&dir, bus.clone()).await;
        agent.volumes().create("v1", "EPHEMERAL").await.unwrap();

        let mut state = agent.watch_state();
        bus.close().await;
        state
            .wait_for(|s| *s == AgentState::Closed)
            .await
            .unwrap();

        assert!(agent.volumes().list().is_empty());
    }

    #[tokio::test]
    async fn subscribe_failure_aborts_run() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(MemoryBus::new());
        bus.close().await;
        let agent = Agent::new(&test_config(&dir), bus).await.unwrap();

        assert!(matches!(agent.run().await, Err(AgentError::BusClosed)));
        assert_eq!(agent.state(), AgentState::Connected);
    }

    #[tokio::test]
    async fn stopped_dispatch_answers_buffered_commands() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(MemoryBus::new());
        let agent = Agent::new(&test_config(&dir), bus.clone()).await.unwrap();
        let mut results = bus.subscribe("volume.b.create").await.unwrap();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        for id in ["a", "b"] {
            tx.send(Message {
                subject: Command::VolumeCreate.subject("1"),
                reply: None,
                payload: format!(r#"{{"id":"{}","type":"EPHEMERAL"}}"#, id).into_bytes(),
            })
            .unwrap();
        }
        let stopping = CancellationToken::new();
        stopping.cancel();
        let handlers = TaskTracker::new();

        dispatch(
            Command::VolumeCreate,
            Subscription::new("node.1.volume.create", rx),
            agent.context.clone(),
            stopping,
            CancellationToken::new(),
            handlers.clone(),
        )
        .await;
        handlers.close();
        handlers.wait().await;

        assert!(results.next().await.is_some());
        assert_eq!(agent.volumes().list(), vec!["a", "b"]);
        agent.volumes().purge().await;
    }
}
