//! Configuration schema for the agent
//!
//! Configuration is stored at `/etc/fuzzball/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::volume::TYPE_EPHEMERAL;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub node: NodeConfig,

    /// Messaging system settings
    pub nats: NatsConfig,

    /// Supported volume types, keyed by type name
    pub volumes: VolumeConfig,

    /// Image cache settings
    pub cache: CacheConfig,

    /// Sandbox runtime settings
    pub runtime: RuntimeConfig,

    /// Image library settings
    pub library: LibraryConfig,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier used to scope command subjects (`node.<id>.*`)
    pub id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { id: "1".to_string() }
    }
}

/// Messaging system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server endpoints
    pub servers: Vec<String>,

    /// Upper bound on each shutdown phase: waiting for in-flight commands,
    /// then draining the connection
    pub drain_timeout_secs: u64,
}

impl NatsConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://127.0.0.1:4222".to_string()],
            drain_timeout_secs: 30,
        }
    }
}

/// A local resource to use as a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Base directory (ephemeral) or backing path (persistent)
    pub location: PathBuf,
}

/// Volume type name to its location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeConfig(pub BTreeMap<String, VolumeSpec>);

impl Default for VolumeConfig {
    /// Only ephemeral volumes, located in the system temporary directory
    fn default() -> Self {
        let mut types = BTreeMap::new();
        types.insert(
            TYPE_EPHEMERAL.to_string(),
            VolumeSpec {
                location: std::env::temp_dir(),
            },
        );
        Self(types)
    }
}

/// Image cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory under which the agent keeps its cache
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: dirs::cache_dir().unwrap_or_else(std::env::temp_dir),
        }
    }
}

/// Sandbox runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Executable name (looked up on PATH) or path
    pub binary: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "singularity".to_string(),
        }
    }
}

/// Image library settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Library used when an image URI names no host
    pub base_url: String,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://library.sylabs.io".to_string(),
        }
    }
}
