//! Management-plane hook.
//!
//! Each [`DeviceManager`] operation runs the configured executable as
//! `<hook> <operation> <device> [args]`. A zero exit status is success;
//! for `is-locked` it means locked. Without a hook every operation
//! succeeds and nothing is locked.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use topolab_orchestrator::{Device, DeviceDefinition, DeviceManager, OrchestratorError, Result};

pub struct HookManager {
    hook: Option<PathBuf>,
}

impl HookManager {
    pub fn new(hook: Option<PathBuf>) -> Self {
        Self { hook }
    }

    /// Run the hook; `None` when no hook is configured.
    async fn call(&self, operation: &str, device: &str, extra: &[&str]) -> Result<Option<bool>> {
        let Some(hook) = &self.hook else {
            debug!(operation, device, "No management hook configured");
            return Ok(None);
        };
        let status = Command::new(hook)
            .arg(operation)
            .arg(device)
            .args(extra)
            .status()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("Failed to run {}: {}", hook.display(), e)))?;
        debug!(operation, device, status = ?status.code(), "Management hook finished");
        Ok(Some(status.success()))
    }

    async fn required(&self, operation: &str, device: &str, extra: &[&str]) -> Result<()> {
        match self.call(operation, device, extra).await? {
            Some(false) => Err(OrchestratorError::Internal(format!(
                "Management hook {} failed for {}",
                operation, device
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceManager for HookManager {
    #[instrument(skip(self, device, definition), fields(device = %device.name))]
    async fn onboard(&self, topology: &str, device: &Device, definition: &DeviceDefinition) -> Result<()> {
        let address = device.management_interface.ip_address.as_deref().unwrap_or("");
        let authgroup = definition.authgroup.as_deref().unwrap_or("default");
        self.required("onboard", &device.name, &[topology, address, definition.device_type.as_str(), authgroup])
            .await?;
        info!("Device onboarded");
        Ok(())
    }

    async fn remove(&self, device: &str) -> Result<()> {
        self.required("remove", device, &[]).await
    }

    async fn is_locked(&self, device: &str) -> Result<bool> {
        Ok(self.call("is-locked", device, &[]).await?.unwrap_or(false))
    }

    async fn fetch_host_keys(&self, device: &Device) -> Result<()> {
        self.required("fetch-host-keys", &device.name, &[]).await
    }

    async fn sync_from(&self, device: &Device) -> Result<bool> {
        let synced = self.call("sync-from", &device.name, &[]).await?.unwrap_or(true);
        if !synced {
            warn!(device = %device.name, "Configuration sync failed");
        }
        Ok(synced)
    }
}
