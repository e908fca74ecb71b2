//! Remote simulation host driver.
//!
//! Each device is one simulation driven by the simulator CLI (`vxr.py`)
//! from a local output directory holding the generated `sim.json`. The
//! simulation itself runs on a remote host reached over ssh; its tap
//! interfaces are read back from the host once the simulation is up.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::{DriverError, Result};
use crate::traits::{Driver, DriverCapabilities};
use crate::types::*;

const SIM_RELEASE: &str = "/opt/cisco/vxr2/latest";
const SIM_ROOT: &str = "/nobackup";
const TAP_POLL_INTERVAL: Duration = Duration::from_secs(10);
const TAP_POLL_ATTEMPTS: u32 = 30;

/// Driver for a simulation host.
pub struct SimulationDriver {
    name: String,
    host: String,
    username: String,
    work_dir: PathBuf,
    command: String,
}

impl SimulationDriver {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            username: username.into(),
            work_dir: PathBuf::from("vxr"),
            command: "vxr.py".to_string(),
        }
    }

    /// Local directory under which per-simulation output directories live.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Simulator CLI to invoke.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    fn output_dir(&self, sim: &str) -> PathBuf {
        self.work_dir.join(sim)
    }

    fn sim_dir(&self, sim: &str) -> String {
        format!("{}/{}/pyvxr", SIM_ROOT, sim)
    }

    /// Full simulator configuration for one device.
    pub fn simulation_config(&self, domain: &DomainDefinition) -> Result<Value> {
        let options = domain.simulation.clone().unwrap_or_default();
        let device: Value = match &options.device_config {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                DriverError::DefineFailed(format!("Invalid simulator config for {}: {}", domain.name, e))
            })?,
            None => json!({ "platform": domain.template }),
        };

        let mut custom = Map::new();
        let mgmt_bridge = domain.management.source.name();
        custom.insert(
            mgmt_bridge.to_string(),
            json!({
                "ports": [format!("{}.{}", domain.name, options.management_interface)],
                "linux_bridge": mgmt_bridge,
                "connection_type": "tap",
            }),
        );
        for interface in &domain.interfaces {
            let Some(slot) = interface.slot else { continue };
            let bridge = interface.source.name();
            custom.insert(
                bridge.to_string(),
                json!({
                    "ports": [format!("{}.{}/{}", domain.name, options.interface_prefix, slot)],
                    "linux_bridge": bridge,
                    "connection_type": "hub",
                }),
            );
        }

        Ok(json!({
            "simulation": {
                "sim_host": self.host,
                "sim_host_username": self.username,
                "sim_rel": SIM_RELEASE,
                "no_image_copy": true,
                "sim_dir": self.sim_dir(&domain.name),
            },
            "devices": { domain.name.clone(): device },
            "connections": { "custom": Value::Object(custom) },
        }))
    }

    async fn vxr(&self, sim: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(args).current_dir(self.output_dir(sim));
        let output = cmd.output().await.map_err(|e| DriverError::CommandFailed {
            command: self.command.clone(),
            message: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                command: format!("{} {}", self.command, args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn is_running(&self, sim: &str) -> Result<bool> {
        let status = match self.vxr(sim, &["status"]).await {
            Ok(status) => status,
            Err(e) => {
                debug!(sim = %sim, error = %e, "Simulation status unavailable");
                return Ok(false);
            }
        };
        Ok(parse_status(&status, &self.host))
    }

    async fn read_taps(&self, sim: &str) -> Result<String> {
        let file = format!("{}/{}/line_taps.0.txt", self.sim_dir(sim), sim);
        let output = Command::new("ssh")
            .arg(&self.host)
            .arg(format!("cat {}", file))
            .output()
            .await
            .map_err(|e| DriverError::CommandFailed {
                command: "ssh".to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(DriverError::NotFound(file));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Driver for SimulationDriver {
    async fn capabilities(&self) -> Result<DriverCapabilities> {
        Ok(DriverCapabilities {
            name: "vxr".to_string(),
            version: SIM_RELEASE.to_string(),
            // Stop is synchronous, there is nothing to wait for
            supports_graceful_shutdown: false,
            supports_network_update: false,
            supports_volumes: false,
            supports_link_discovery: false,
        })
    }

    async fn inventory(&self) -> Result<Inventory> {
        let mut inventory = Inventory::default();
        let mut entries = match tokio::fs::read_dir(&self.work_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(inventory),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(sim) = entry.file_name().to_str() {
                let running = self.is_running(sim).await?;
                inventory.domains.insert(sim.to_string(), running);
            }
        }
        Ok(inventory)
    }

    async fn state(&self, resource: &ResourceRef) -> Result<ResourceState> {
        match resource {
            ResourceRef::Domain(sim) => {
                if !tokio::fs::try_exists(self.output_dir(sim)).await.unwrap_or(false) {
                    return Ok(ResourceState::Absent);
                }
                Ok(if self.is_running(sim).await? {
                    ResourceState::Active
                } else {
                    ResourceState::Inactive
                })
            }
            _ => Ok(ResourceState::Absent),
        }
    }

    async fn define_network(&self, network: &NetworkDefinition) -> Result<()> {
        Err(DriverError::Unsupported(format!("network {} on simulation host", network.name)))
    }

    async fn update_network(&self, network: &NetworkDefinition) -> Result<()> {
        Err(DriverError::Unsupported(format!("network {} on simulation host", network.name)))
    }

    async fn create_volume(&self, volume: &VolumeDefinition) -> Result<()> {
        Err(DriverError::Unsupported(format!("volume {} on simulation host", volume.name)))
    }

    async fn delete_volume(&self, _pool: &str, name: &str) -> Result<()> {
        Err(DriverError::Unsupported(format!("volume {} on simulation host", name)))
    }

    #[instrument(skip(self, domain), fields(hypervisor = %self.name, sim = %domain.name))]
    async fn define_domain(&self, domain: &DomainDefinition) -> Result<()> {
        let config = self.simulation_config(domain)?;
        let dir = self.output_dir(&domain.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DriverError::DefineFailed(format!("{}: {}", dir.display(), e)))?;

        let body = serde_json::to_string_pretty(&config)
            .map_err(|e| DriverError::DefineFailed(e.to_string()))?;
        debug!(config = %body, "Simulation config");
        tokio::fs::write(dir.join("sim.json"), body)
            .await
            .map_err(|e| DriverError::DefineFailed(format!("{}: {}", dir.display(), e)))?;
        Ok(())
    }

    #[instrument(skip(self), fields(hypervisor = %self.name, resource = %resource))]
    async fn apply(&self, resource: &ResourceRef, action: PowerAction) -> Result<()> {
        let ResourceRef::Domain(sim) = resource else {
            return Err(DriverError::Unsupported(format!("{} on {}", action, resource)));
        };

        match action {
            PowerAction::Create => {
                info!("Starting simulation");
                self.vxr(sim, &["start", "sim.json"]).await?;
            }
            PowerAction::Shutdown | PowerAction::Destroy => {
                info!("Stopping simulation");
                // Stop and clean errors mean the simulation is already gone
                if let Err(e) = self.vxr(sim, &["stop"]).await {
                    info!(error = %e, "Simulation stop reported an error");
                }
                if let Err(e) = self.vxr(sim, &["clean"]).await {
                    info!(error = %e, "Simulation clean reported an error");
                }
            }
            PowerAction::Undefine => {}
        }
        Ok(())
    }

    async fn host_interfaces(&self, domain: &str) -> Result<Vec<(u32, String)>> {
        for attempt in 1..=TAP_POLL_ATTEMPTS {
            match self.read_taps(domain).await {
                Ok(taps) => return Ok(parse_line_taps(&taps)),
                Err(e) => {
                    info!(hypervisor = %self.name, attempt, error = %e, "Taps not ready");
                    tokio::time::sleep(TAP_POLL_INTERVAL).await;
                }
            }
        }
        warn!(hypervisor = %self.name, sim = %domain, "Gave up waiting for simulation taps");
        Err(DriverError::QueryFailed(format!("tap interfaces of {}", domain)))
    }
}

/// Parse `line_taps.0.txt`: `<tap> <iface>0/0/0/<id> ...` per line.
pub fn parse_line_taps(taps: &str) -> Vec<(u32, String)> {
    taps.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let tap = tokens.next()?;
            let iface = tokens.next()?;
            tokens.next()?;
            let (prefix, id) = iface.rsplit_once('/')?;
            if !prefix.ends_with("0/0/0") {
                return None;
            }
            Some((id.parse().ok()?, tap.to_string()))
        })
        .collect()
}

/// Whether `vxr.py status` reports the simulation host as running.
fn parse_status(status: &str, host: &str) -> bool {
    serde_json::from_str::<Value>(status)
        .ok()
        .and_then(|v| v.get(host).and_then(Value::as_str).map(|s| s == "running"))
        .unwrap_or(false)
}
