//! Management-plane collaborator.
//!
//! Managed devices are onboarded into an external management system once
//! their domain is defined, and removed again on undefine. The status
//! checker uses the same seam to bootstrap credentials and pull the device
//! configuration once a device is reachable.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::info;

use crate::error::{OrchestratorError, Result};
use crate::model::{Device, DeviceDefinition};

#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Register a device with the management plane.
    async fn onboard(&self, topology: &str, device: &Device, definition: &DeviceDefinition) -> Result<()>;

    /// Forget a device.
    async fn remove(&self, device: &str) -> Result<()>;

    /// Whether the device is administratively locked (treated as ready).
    async fn is_locked(&self, device: &str) -> Result<bool>;

    /// Learn the device's SSH host keys.
    async fn fetch_host_keys(&self, device: &Device) -> Result<()>;

    /// Pull the device configuration. `false` when the sync failed.
    async fn sync_from(&self, device: &Device) -> Result<bool>;
}

/// In-memory manager for tests and development mode.
#[derive(Default)]
pub struct MockDeviceManager {
    devices: RwLock<HashMap<String, String>>,
    locked: RwLock<HashSet<String>>,
    sync_failures: RwLock<HashSet<String>>,
    host_key_failures: RwLock<HashSet<String>>,
    calls: RwLock<Vec<String>>,
}

fn poisoned<T>(_: T) -> OrchestratorError {
    OrchestratorError::Internal("Lock poisoned".to_string())
}

impl MockDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device as locked.
    pub fn lock(&self, device: &str) {
        if let Ok(mut locked) = self.locked.write() {
            locked.insert(device.to_string());
        }
    }

    /// Make `sync_from` fail for a device.
    pub fn fail_sync(&self, device: &str) {
        if let Ok(mut failures) = self.sync_failures.write() {
            failures.insert(device.to_string());
        }
    }

    /// Make `fetch_host_keys` return an error for a device.
    pub fn fail_host_keys(&self, device: &str) {
        if let Ok(mut failures) = self.host_key_failures.write() {
            failures.insert(device.to_string());
        }
    }

    /// Onboarded devices, sorted.
    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Calls in order, as `<operation> <device>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, operation: &str, device: &str) -> Result<()> {
        self.calls.write().map_err(poisoned)?.push(format!("{} {}", operation, device));
        Ok(())
    }
}

#[async_trait]
impl DeviceManager for MockDeviceManager {
    async fn onboard(&self, topology: &str, device: &Device, _definition: &DeviceDefinition) -> Result<()> {
        self.record("onboard", &device.name)?;
        self.devices
            .write()
            .map_err(poisoned)?
            .insert(device.name.clone(), topology.to_string());
        info!(device = %device.name, "Onboarded device");
        Ok(())
    }

    async fn remove(&self, device: &str) -> Result<()> {
        self.record("remove", device)?;
        self.devices.write().map_err(poisoned)?.remove(device);
        Ok(())
    }

    async fn is_locked(&self, device: &str) -> Result<bool> {
        Ok(self.locked.read().map_err(poisoned)?.contains(device))
    }

    async fn fetch_host_keys(&self, device: &Device) -> Result<()> {
        self.record("fetch-host-keys", &device.name)?;
        if self.host_key_failures.read().map_err(poisoned)?.contains(&device.name) {
            return Err(OrchestratorError::Internal(format!("No host keys for {}", device.name)));
        }
        Ok(())
    }

    async fn sync_from(&self, device: &Device) -> Result<bool> {
        self.record("sync-from", &device.name)?;
        Ok(!self.sync_failures.read().map_err(poisoned)?.contains(&device.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_manager() {
        let manager = MockDeviceManager::new();
        let device = Device { id: 1, name: "r1".to_string(), ..Default::default() };

        manager.onboard("lab", &device, &DeviceDefinition::default()).await.unwrap();
        assert_eq!(manager.devices(), vec!["r1"]);
        assert!(manager.sync_from(&device).await.unwrap());

        manager.fail_sync("r1");
        assert!(!manager.sync_from(&device).await.unwrap());

        manager.remove("r1").await.unwrap();
        assert!(manager.devices().is_empty());
        assert_eq!(manager.calls(), vec!["onboard r1", "sync-from r1", "sync-from r1", "remove r1"]);
    }
}
