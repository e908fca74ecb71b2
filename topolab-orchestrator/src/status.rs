//! Device readiness check.
//!
//! A managed device moves from `started` to `ready` once it answers on
//! its management address, its host keys are known and its
//! configuration has been pulled into the management plane. The check
//! computes the resulting store changes and leaves writing them to the
//! caller, so the monitor can route them through its single writer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::manager::DeviceManager;
use crate::model::{Device, Lab, OperationalStatus, ProvisioningStatus, Topology};
use crate::monitor::liveness::Prober;
use crate::store::TopologyChange;

/// Outcome of one status check.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: ProvisioningStatus,
    pub changes: Vec<TopologyChange>,
    /// Devices silent for longer than their console timeout
    pub reboots: Vec<String>,
}

impl StatusReport {
    pub fn is_ready(&self) -> bool {
        self.status == ProvisioningStatus::Ready
    }
}

/// Aggregate device statuses: all ready is ready, any sync error is a
/// sync error, anything else is still starting.
pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a ProvisioningStatus>) -> ProvisioningStatus {
    let mut all_ready = true;
    for status in statuses {
        match status {
            ProvisioningStatus::SyncError => return ProvisioningStatus::SyncError,
            ProvisioningStatus::Ready => {}
            _ => all_ready = false,
        }
    }
    if all_ready {
        ProvisioningStatus::Ready
    } else {
        ProvisioningStatus::Started
    }
}

pub struct StatusChecker {
    manager: Arc<dyn DeviceManager>,
    prober: Arc<dyn Prober>,
}

impl StatusChecker {
    pub fn new(manager: Arc<dyn DeviceManager>, prober: Arc<dyn Prober>) -> Self {
        Self { manager, prober }
    }

    /// Check every managed device of a topology that is not ready yet.
    ///
    /// `console_running` enables the reboot of silent devices; without a
    /// console watchdog there is no activity to judge them by.
    #[instrument(skip(self, lab), fields(topology = %topology))]
    pub async fn check(
        &self,
        lab: &Lab,
        topology: &str,
        console_running: bool,
        now: DateTime<Utc>,
    ) -> Result<StatusReport> {
        let topology: &Topology = lab.topology(topology)?;
        let mut changes = Vec::new();
        let mut reboots = Vec::new();
        let mut statuses = Vec::new();

        for device in &topology.devices {
            let definition = lab.definition(&device.definition)?;
            if !definition.managed {
                continue;
            }
            let status = if device.provisioning_status == ProvisioningStatus::Ready {
                ProvisioningStatus::Ready
            } else {
                self.check_device(device, definition.console_timeout, console_running, now, &mut changes, &mut reboots)
                    .await?
            };
            statuses.push(status);
        }

        let status = aggregate(&statuses);
        if status != topology.provisioning_status {
            changes.push(TopologyChange::TopologyStatus(status));
        }
        info!(status = %status, changes = changes.len(), reboots = reboots.len(), "Status check finished");
        Ok(StatusReport { status, changes, reboots })
    }

    async fn check_device(
        &self,
        device: &Device,
        console_timeout: u64,
        console_running: bool,
        now: DateTime<Utc>,
        changes: &mut Vec<TopologyChange>,
        reboots: &mut Vec<String>,
    ) -> Result<ProvisioningStatus> {
        let name = &device.name;
        let set = |provisioning: Option<ProvisioningStatus>, operational: Option<OperationalStatus>| {
            TopologyChange::DeviceStatus { device: name.clone(), provisioning, operational }
        };

        if self.manager.is_locked(name).await? {
            debug!(device = %name, "Device locked, treating as ready");
            changes.push(set(Some(ProvisioningStatus::Ready), None));
            return Ok(ProvisioningStatus::Ready);
        }

        let reachable = match &device.management_interface.ip_address {
            Some(address) => match self.prober.probe(address).await {
                Ok(lost) => lost == 0,
                Err(e) => {
                    warn!(device = %name, error = %e, "Probe failed");
                    false
                }
            },
            None => false,
        };

        if !reachable {
            if device.operational_status == OperationalStatus::Reachable {
                changes.push(set(None, Some(OperationalStatus::NotReachable)));
            }
            if console_running && Self::console_silent(device, console_timeout, now) {
                warn!(device = %name, timeout_secs = console_timeout, "No console activity, rebooting");
                reboots.push(name.clone());
            }
            return Ok(device.provisioning_status);
        }

        if device.operational_status != OperationalStatus::Reachable {
            changes.push(set(None, Some(OperationalStatus::Reachable)));
        }

        let synced = match self.manager.fetch_host_keys(device).await {
            Ok(()) => self.manager.sync_from(device).await,
            Err(e) => Err(e),
        };
        let status = match synced {
            Ok(true) => ProvisioningStatus::Ready,
            Ok(false) => ProvisioningStatus::SyncError,
            Err(e) => {
                warn!(device = %name, error = %e, "Management plane sync failed");
                ProvisioningStatus::SyncError
            }
        };
        info!(device = %name, status = %status, "Device synchronized");
        changes.push(set(Some(status), None));
        Ok(status)
    }

    fn console_silent(device: &Device, timeout_secs: u64, now: DateTime<Utc>) -> bool {
        let Some(last) = device.console.last_activity else {
            return false;
        };
        let silent = now.signed_duration_since(last);
        silent.num_seconds() > i64::try_from(timeout_secs).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MockDeviceManager;
    use crate::model::*;
    use crate::monitor::liveness::ScriptedProber;

    fn lab() -> Lab {
        let device = |id: u32, name: &str| Device {
            id,
            name: name.to_string(),
            definition: "iosv".to_string(),
            provisioning_status: ProvisioningStatus::Started,
            management_interface: InterfaceRecord {
                ip_address: Some(format!("10.0.0.{}", id)),
                ..Default::default()
            },
            ..Default::default()
        };
        Lab {
            device_definitions: vec![
                DeviceDefinition { name: "iosv".to_string(), console_timeout: 300, ..Default::default() },
                DeviceDefinition { name: "host".to_string(), managed: false, ..Default::default() },
            ],
            topologies: vec![Topology {
                name: "lab".to_string(),
                provisioning_status: ProvisioningStatus::Started,
                devices: vec![
                    device(1, "r1"),
                    device(2, "r2"),
                    Device { id: 3, name: "h1".to_string(), definition: "host".to_string(), ..Default::default() },
                ],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregate() {
        use ProvisioningStatus::*;
        assert_eq!(aggregate(&[Ready, Ready]), Ready);
        assert_eq!(aggregate(&[Ready, SyncError, Started]), SyncError);
        assert_eq!(aggregate(&[Ready, Started]), Started);
        assert_eq!(aggregate(&[]), Ready);
    }

    #[tokio::test]
    async fn test_reachable_devices_sync() {
        let manager = Arc::new(MockDeviceManager::new());
        manager.fail_sync("r2");
        let prober = Arc::new(ScriptedProber::new());
        let checker = StatusChecker::new(manager.clone(), prober.clone());

        let report = checker.check(&lab(), "lab", false, Utc::now()).await.unwrap();
        assert_eq!(report.status, ProvisioningStatus::SyncError);
        assert!(report.reboots.is_empty());
        assert!(report.changes.contains(&TopologyChange::DeviceStatus {
            device: "r1".to_string(),
            provisioning: Some(ProvisioningStatus::Ready),
            operational: None,
        }));
        assert!(report.changes.contains(&TopologyChange::TopologyStatus(ProvisioningStatus::SyncError)));
        // Unmanaged devices are never probed
        assert_eq!(prober.probes(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(
            manager.calls(),
            vec!["fetch-host-keys r1", "sync-from r1", "fetch-host-keys r2", "sync-from r2"]
        );
    }

    /// Test that a management plane error only fails its own device
    #[tokio::test]
    async fn test_host_key_error_is_per_device() {
        let manager = Arc::new(MockDeviceManager::new());
        manager.fail_host_keys("r1");
        let checker = StatusChecker::new(manager.clone(), Arc::new(ScriptedProber::new()));

        let report = checker.check(&lab(), "lab", false, Utc::now()).await.unwrap();
        assert_eq!(report.status, ProvisioningStatus::SyncError);
        assert!(report.changes.contains(&TopologyChange::DeviceStatus {
            device: "r1".to_string(),
            provisioning: Some(ProvisioningStatus::SyncError),
            operational: None,
        }));
        assert!(report.changes.contains(&TopologyChange::DeviceStatus {
            device: "r2".to_string(),
            provisioning: Some(ProvisioningStatus::Ready),
            operational: None,
        }));
        assert_eq!(manager.calls(), vec!["fetch-host-keys r1", "fetch-host-keys r2", "sync-from r2"]);
    }

    #[tokio::test]
    async fn test_locked_and_ready_devices() {
        let mut lab = lab();
        lab.topologies[0].devices[1].provisioning_status = ProvisioningStatus::Ready;
        let manager = Arc::new(MockDeviceManager::new());
        manager.lock("r1");
        let prober = Arc::new(ScriptedProber::new());
        let checker = StatusChecker::new(manager.clone(), prober.clone());

        let report = checker.check(&lab, "lab", false, Utc::now()).await.unwrap();
        assert!(report.is_ready());
        assert!(prober.probes().is_empty());
        assert!(manager.calls().is_empty());
    }

    #[tokio::test]
    async fn test_silent_device_is_rebooted_only_with_console() {
        let now = Utc::now();
        let mut lab = lab();
        lab.topologies[0].devices[0].console.last_activity = Some(now - chrono::Duration::seconds(301));
        lab.topologies[0].devices[1].console.last_activity = Some(now - chrono::Duration::seconds(10));
        let prober = Arc::new(ScriptedProber::new());
        prober.push("10.0.0.1", 3);
        prober.push("10.0.0.2", 1);
        let checker = StatusChecker::new(Arc::new(MockDeviceManager::new()), prober.clone());

        let report = checker.check(&lab, "lab", true, now).await.unwrap();
        assert_eq!(report.reboots, vec!["r1"]);
        assert_eq!(report.status, ProvisioningStatus::Started);
        assert!(report.changes.is_empty());

        prober.push("10.0.0.1", 3);
        prober.push("10.0.0.2", 3);
        let report = checker.check(&lab, "lab", false, now).await.unwrap();
        assert!(report.reboots.is_empty());
    }
}
