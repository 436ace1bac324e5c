//! Error types for the agent
//!
//! All modules use `AgentResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// All errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Unsupported volume type: {0}")]
    UnsupportedVolumeType(String),

    // Messaging errors
    #[error("Failed to connect to messaging system: {0}")]
    BusConnect(String),

    #[error("Messaging system connection is reconnecting")]
    BusReconnecting,

    #[error("Messaging system connection is closed")]
    BusClosed,

    #[error("Failed to subscribe to {subject}: {reason}")]
    BusSubscribe { subject: String, reason: String },

    #[error("Failed to publish to {subject}: {reason}")]
    BusPublish { subject: String, reason: String },

    #[error("Failed to drain messaging system connection: {0}")]
    BusDrain(String),

    // Volume errors
    #[error("Volume {0} already exists")]
    VolumeExists(String),

    #[error("Volume {0} does not exist")]
    VolumeNotFound(String),

    #[error("Volume {0} is still being created")]
    VolumeNotReady(String),

    // Cache errors
    #[error("Failed to initialize cache at {path}: {reason}")]
    CacheInit { path: PathBuf, reason: String },

    #[error("Cached image not found: {0}")]
    CachedImageMissing(String),

    // Image errors
    #[error("Invalid image URI {uri}: {reason}")]
    InvalidImageUri { uri: String, reason: String },

    #[error("Tag must be the image hash, received {0:?}")]
    InvalidImageHash(String),

    #[error("Image digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Image download failed: {url}: {reason}")]
    Download { url: String, reason: String },

    // Job errors
    #[error("Sandbox runtime not found: {name}")]
    RuntimeNotFound { name: String },

    #[error("Failed to resolve volume {id}: {source}")]
    VolumeResolution {
        id: String,
        #[source]
        source: Box<AgentError>,
    },

    #[error("Job cancelled")]
    JobCancelled,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Wrap a volume lookup failure with the offending volume ID
    pub fn volume_resolution(id: impl Into<String>, source: AgentError) -> Self {
        Self::VolumeResolution {
            id: id.into(),
            source: Box::new(source),
        }
    }

    /// Check if the scheduler may reasonably resubmit the command
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BusReconnecting
                | Self::VolumeNotReady(_)
                | Self::CachedImageMissing(_)
                | Self::Download { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::BusConnect(_) => Some("Check the [nats] servers setting or pass --nats-servers"),
            Self::UnsupportedVolumeType(_) => {
                Some("Supported volume types are EPHEMERAL and PERSISTENT")
            }
            Self::CacheInit { .. } => Some("Check the [cache] dir setting"),
            Self::RuntimeNotFound { .. } => {
                Some("Install the sandbox runtime or set [runtime] binary")
            }
            _ => None,
        }
    }
}
