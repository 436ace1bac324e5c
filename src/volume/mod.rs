//! Node-local volumes
//!
//! A volume is a directory on the node that jobs bind into their sandbox.
//! Each volume type is served by a [`VolumeDriver`], configured once at
//! startup from the `[volumes]` table. Drivers hand out [`Volume`] instances
//! which the [`VolumeManager`] tracks by caller-assigned ID.
//!
//! | Type | Create | Delete |
//! |------|--------|--------|
//! | `EPHEMERAL` | fresh directory under the configured base | removed recursively |
//! | `PERSISTENT` | nothing, handle is the configured path | nothing, data is kept |

mod ephemeral;
mod manager;
mod persistent;

pub use ephemeral::{EphemeralDriver, EphemeralVolume};
pub use manager::VolumeManager;
pub use persistent::{PersistentDriver, PersistentVolume};

use crate::error::AgentResult;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;

/// Short lived volume that does not retain data
pub const TYPE_EPHEMERAL: &str = "EPHEMERAL";

/// Volume that leaves data intact during creation and removal
pub const TYPE_PERSISTENT: &str = "PERSISTENT";

/// Volume type names are case-insensitive
pub fn normalize_type(kind: &str) -> String {
    kind.trim().to_ascii_uppercase()
}

/// Factory for the volumes of a single type
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    /// Perform the type's creation side effect and return the new instance
    async fn create(&self, id: &str) -> AgentResult<Box<dyn Volume>>;

    /// Human-readable driver name for logging
    fn name(&self) -> &'static str;
}

/// A single active volume
#[async_trait]
pub trait Volume: Send + Sync + fmt::Debug {
    /// Filesystem location usable as a bind source
    fn handle(&self) -> &Path;

    /// Type-specific teardown
    async fn delete(&self) -> AgentResult<()>;
}
