//! Run command - serve commands until signalled

use crate::agent::Agent;
use crate::config::Config;
use crate::error::{AgentError, AgentResult};
use crate::shutdown::install_shutdown_handler;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Execute the run command
///
/// The first SIGINT/SIGTERM stops the agent gracefully, a second one also
/// kills running jobs.
pub async fn execute(config: &Config) -> AgentResult<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node_id = %config.node.id,
        "starting"
    );

    let agent = Arc::new(Agent::connect(config).await?);
    let shutdown = install_shutdown_handler()?;

    let runner = agent.clone();
    let mut run: JoinHandle<AgentResult<()>> = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        result = &mut run => return joined(result),
        _ = shutdown.cancelled() => agent.stop(),
    }

    let again = install_shutdown_handler()?;
    tokio::select! {
        result = &mut run => joined(result),
        _ = again.cancelled() => {
            agent.stop();
            joined(run.await)
        }
    }
}

fn joined(result: Result<AgentResult<()>, tokio::task::JoinError>) -> AgentResult<()> {
    result.map_err(|e| AgentError::Internal(format!("agent task failed: {}", e)))?
}
