use crate::error::{AgentError, AgentResult};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Listen for SIGTERM and SIGINT.
///
/// Returns a token cancelled when either signal arrives. Must be called from
/// within the tokio runtime.
pub fn install_shutdown_handler() -> AgentResult<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| AgentError::io("installing SIGTERM handler", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| AgentError::io("installing SIGINT handler", e))?;

    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, stopping agent"),
            _ = sigint.recv() => info!("Received SIGINT, stopping agent"),
        }
        token_clone.cancel();
    });

    Ok(token)
}
