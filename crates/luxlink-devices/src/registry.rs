/*!
 * Device registry for LuxLink.
 *
 * The registry is the only structure mutated from multiple logical flows
 * (the discovery cycle and external consumers); every operation is atomic
 * with respect to the others. Sessions are keyed by device id, which is
 * known because only handshaken sessions are registered.
 */
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use luxlink_core::error::Error as CoreError;

use crate::error::{DeviceError, Result};
use crate::session::{DeviceIdentity, DeviceSession};

/// Event types for the device registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was added to the registry
    DeviceAdded(DeviceIdentity),
    /// A device was removed from the registry
    DeviceRemoved(String),
}

/// Concurrency-safe store of device sessions keyed by device id
#[derive(Debug)]
pub struct DeviceRegistry {
    sessions: RwLock<HashMap<String, Arc<DeviceSession>>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(64);
        Self {
            sessions: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Insert a handshaken session.
    ///
    /// Fails with [`DeviceError::DuplicateDevice`] if the device id is
    /// already present; registry integrity takes priority over onboarding.
    pub fn add(&self, session: Arc<DeviceSession>) -> Result<()> {
        let identity = session.identity().ok_or(DeviceError::NotConnected)?;

        let mut sessions = self.sessions.write().map_err(|_| {
            DeviceError::Core(CoreError::runtime("device registry lock poisoned"))
        })?;

        if sessions.contains_key(&identity.device_id) {
            warn!(
                device_id = %identity.device_id,
                ip = %session.ip(),
                "Rejecting session: device id already registered"
            );
            return Err(DeviceError::DuplicateDevice(identity.device_id));
        }

        sessions.insert(identity.device_id.clone(), session);
        debug!(device_id = %identity.device_id, "Registered device");
        let _ = self.event_sender.send(RegistryEvent::DeviceAdded(identity));
        Ok(())
    }

    /// Remove a session by device id. No-op if absent.
    pub fn remove(&self, device_id: &str) -> Result<Option<Arc<DeviceSession>>> {
        let mut sessions = self.sessions.write().map_err(|_| {
            DeviceError::Core(CoreError::runtime("device registry lock poisoned"))
        })?;

        let removed = sessions.remove(device_id);
        if removed.is_some() {
            debug!(device_id, "Unregistered device");
            let _ = self
                .event_sender
                .send(RegistryEvent::DeviceRemoved(device_id.to_string()));
        }
        Ok(removed)
    }

    /// Get a session by device id
    pub fn get(&self, device_id: &str) -> Result<Arc<DeviceSession>> {
        let sessions = self.sessions.read().map_err(|_| {
            DeviceError::Core(CoreError::runtime("device registry lock poisoned"))
        })?;
        sessions
            .get(device_id)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))
    }

    /// Find the session bound to an address, if any
    pub fn find_by_ip(&self, ip: IpAddr) -> Result<Option<Arc<DeviceSession>>> {
        let sessions = self.sessions.read().map_err(|_| {
            DeviceError::Core(CoreError::runtime("device registry lock poisoned"))
        })?;
        Ok(sessions.values().find(|s| s.ip() == ip).cloned())
    }

    /// Snapshot of the current sessions.
    ///
    /// The returned list does not reflect mutation after the call returns.
    pub fn list(&self) -> Result<Vec<Arc<DeviceSession>>> {
        let sessions = self.sessions.read().map_err(|_| {
            DeviceError::Core(CoreError::runtime("device registry lock poisoned"))
        })?;
        Ok(sessions.values().cloned().collect())
    }

    /// Snapshot filtered by device type code
    pub fn find_by_type(&self, type_code: u16) -> Result<Vec<Arc<DeviceSession>>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| {
                s.identity()
                    .map(|i| i.device_type_code == type_code)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Set of addresses with a registered session
    pub fn addresses(&self) -> Result<std::collections::HashSet<IpAddr>> {
        Ok(self.list()?.iter().map(|s| s.ip()).collect())
    }

    /// Number of registered devices
    pub fn len(&self) -> Result<usize> {
        let sessions = self.sessions.read().map_err(|_| {
            DeviceError::Core(CoreError::runtime("device registry lock poisoned"))
        })?;
        Ok(sessions.len())
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Disconnect every registered session; used during shutdown
    pub async fn disconnect_all(&self) -> Result<()> {
        for session in self.list()? {
            session.disconnect().await;
        }
        Ok(())
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared device registry that can be cloned
#[derive(Debug, Clone)]
pub struct SharedDeviceRegistry(Arc<DeviceRegistry>);

impl SharedDeviceRegistry {
    /// Create a new shared device registry
    pub fn new() -> Self {
        Self(Arc::new(DeviceRegistry::new()))
    }

    /// Get a reference to the device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.0
    }
}

impl Default for SharedDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<DeviceRegistry> for SharedDeviceRegistry {
    fn as_ref(&self) -> &DeviceRegistry {
        self.registry()
    }
}
