//! Volume registry
//!
//! The ID table is the only lock-protected state. Driver I/O always runs
//! outside the lock so unrelated volume operations never wait on each other;
//! racing creates for the same ID are decided when the ID is reserved.

use crate::config::schema::VolumeConfig;
use crate::error::{AgentError, AgentResult};
use crate::volume::{
    normalize_type, EphemeralDriver, PersistentDriver, Volume, VolumeDriver, TYPE_EPHEMERAL,
    TYPE_PERSISTENT,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Table entry for a volume ID
enum Slot {
    /// ID reserved, driver create still running
    Pending(u64),
    Ready(Arc<dyn Volume>),
}

#[derive(Default)]
struct Table {
    next_ticket: u64,
    volumes: HashMap<String, Slot>,
}

/// Creates and tracks volumes in use
#[derive(Default)]
pub struct VolumeManager {
    drivers: HashMap<String, Arc<dyn VolumeDriver>>,
    table: Mutex<Table>,
}

impl VolumeManager {
    /// Create a manager with no supported volume types
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager with a driver for every configured volume type
    pub fn from_config(config: &VolumeConfig) -> AgentResult<Self> {
        let mut manager = Self::new();

        for (kind, spec) in &config.0 {
            let kind = normalize_type(kind);
            let driver: Arc<dyn VolumeDriver> = match kind.as_str() {
                TYPE_EPHEMERAL => Arc::new(EphemeralDriver::new(&spec.location)),
                TYPE_PERSISTENT => Arc::new(PersistentDriver::new(&spec.location)),
                _ => return Err(AgentError::UnsupportedVolumeType(kind)),
            };
            if manager.supports(&kind) {
                warn!(driver = %kind, "volume type configured more than once, last one wins");
            }
            info!(
                driver = %kind,
                location = %spec.location.display(),
                "registered volume driver"
            );
            manager.register(&kind, driver);
        }

        Ok(manager)
    }

    /// Register the driver serving a volume type
    pub fn register(&mut self, kind: &str, driver: Arc<dyn VolumeDriver>) {
        self.drivers.insert(normalize_type(kind), driver);
    }

    /// Whether a driver is registered for the type
    pub fn supports(&self, kind: &str) -> bool {
        self.drivers.contains_key(&normalize_type(kind))
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a volume of the given type and register it under `id`
    pub async fn create(&self, id: &str, kind: &str) -> AgentResult<()> {
        let (driver, ticket) = self.reserve(id, kind)?;

        match driver.create(id).await {
            Ok(volume) => self.activate(id, ticket, Arc::from(volume)).await,
            Err(e) => {
                self.release(id, ticket);
                Err(e)
            }
        }
    }

    /// Atomically claim `id` for a new volume of type `kind`
    fn reserve(&self, id: &str, kind: &str) -> AgentResult<(Arc<dyn VolumeDriver>, u64)> {
        let kind = normalize_type(kind);
        let driver = self
            .drivers
            .get(&kind)
            .cloned()
            .ok_or(AgentError::UnsupportedVolumeType(kind))?;

        let mut table = self.table();
        if table.volumes.contains_key(id) {
            return Err(AgentError::VolumeExists(id.to_string()));
        }
        table.next_ticket += 1;
        let ticket = table.next_ticket;
        table.volumes.insert(id.to_string(), Slot::Pending(ticket));

        debug!("Reserved volume {} for {} driver", id, driver.name());
        Ok((driver, ticket))
    }

    /// Mark a reserved volume ready, unless the reservation was purged meanwhile
    async fn activate(&self, id: &str, ticket: u64, volume: Arc<dyn Volume>) -> AgentResult<()> {
        {
            let mut table = self.table();
            if let Some(slot) = table.volumes.get_mut(id) {
                if matches!(slot, Slot::Pending(t) if *t == ticket) {
                    *slot = Slot::Ready(volume);
                    return Ok(());
                }
            }
        }

        warn!(volume_id = %id, "volume purged while being created, deleting");
        if let Err(e) = volume.delete().await {
            warn!(volume_id = %id, error = %e, "failed to delete volume");
        }
        Err(AgentError::VolumeNotFound(id.to_string()))
    }

    /// Give up a reservation after a failed driver create
    fn release(&self, id: &str, ticket: u64) {
        let mut table = self.table();
        if matches!(table.volumes.get(id), Some(Slot::Pending(t)) if *t == ticket) {
            table.volumes.remove(id);
        }
    }

    /// Remove the volume and perform its type-specific teardown
    ///
    /// The ID is free again even if the teardown fails.
    pub async fn delete(&self, id: &str) -> AgentResult<()> {
        let volume = {
            let mut table = self.table();
            match table.volumes.get(id) {
                None => return Err(AgentError::VolumeNotFound(id.to_string())),
                Some(Slot::Pending(_)) => return Err(AgentError::VolumeNotReady(id.to_string())),
                Some(Slot::Ready(_)) => {}
            }
            match table.volumes.remove(id) {
                Some(Slot::Ready(volume)) => volume,
                _ => return Err(AgentError::VolumeNotFound(id.to_string())),
            }
        };

        volume.delete().await
    }

    /// Filesystem location of the volume
    pub fn get_handle(&self, id: &str) -> AgentResult<PathBuf> {
        match self.table().volumes.get(id) {
            Some(Slot::Ready(volume)) => Ok(volume.handle().to_path_buf()),
            Some(Slot::Pending(_)) => Err(AgentError::VolumeNotReady(id.to_string())),
            None => Err(AgentError::VolumeNotFound(id.to_string())),
        }
    }

    /// IDs of all ready volumes, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table()
            .volumes
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Delete every volume, logging failures and always moving on
    ///
    /// Only used at shutdown; the manager is not meant to be reused afterwards.
    pub async fn purge(&self) {
        let volumes: Vec<(String, Slot)> = self.table().volumes.drain().collect();

        for (id, slot) in volumes {
            let volume = match slot {
                Slot::Ready(volume) => volume,
                Slot::Pending(_) => {
                    info!(volume_id = %id, "volume still being created, left to its creator");
                    continue;
                }
            };

            info!(volume_id = %id, "deleting volume");
            match volume.delete().await {
                Ok(()) => info!(volume_id = %id, "volume deleted"),
                Err(e) => warn!(volume_id = %id, error = %e, "failed to delete volume"),
            }
        }
    }
}
