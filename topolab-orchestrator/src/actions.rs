//! Operator verbs.
//!
//! Maps the topology, link and device verbs onto orchestrator runs,
//! records the resulting topology status and starts or stops the
//! topology's monitor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::lifecycle::{Action, ActionReport};
use crate::model::{LinkId, ProvisioningStatus};
use crate::orchestrator::{action_status, Orchestrator};
use crate::store::TopologyChange;

/// Topology and device verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyVerb {
    Define,
    Start,
    Stop,
    Reboot,
    HardReset,
    Undefine,
}

impl TopologyVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyVerb::Define => "define",
            TopologyVerb::Start => "start",
            TopologyVerb::Stop => "stop",
            TopologyVerb::Reboot => "reboot",
            TopologyVerb::HardReset => "hard-reset",
            TopologyVerb::Undefine => "undefine",
        }
    }
}

impl std::str::FromStr for TopologyVerb {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "define" => Ok(TopologyVerb::Define),
            "start" => Ok(TopologyVerb::Start),
            "stop" => Ok(TopologyVerb::Stop),
            "reboot" => Ok(TopologyVerb::Reboot),
            "hard-reset" => Ok(TopologyVerb::HardReset),
            "undefine" => Ok(TopologyVerb::Undefine),
            other => Err(OrchestratorError::Configuration(format!("Unknown topology action {}", other))),
        }
    }
}

impl std::fmt::Display for TopologyVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkVerb {
    Start,
    Stop,
    /// Delay in milliseconds
    SetDelay(u32),
}

/// Starts and stops the monitor of a topology.
#[async_trait]
pub trait MonitorControl: Send + Sync {
    async fn schedule(&self, topology: &str) -> Result<()>;
    async fn unschedule(&self, topology: &str) -> Result<()>;
}

/// The operator action surface.
pub struct Actions {
    orchestrator: Arc<Orchestrator>,
    monitor: Option<Arc<dyn MonitorControl>>,
}

impl Actions {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator, monitor: None }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MonitorControl>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Run a verb on a topology, or on one of its devices.
    ///
    /// Without `force`, a whole-topology `start` only runs on a `defined`
    /// topology and `define` only on an `undefined` one.
    pub async fn topology(
        &self,
        topology: &str,
        verb: TopologyVerb,
        device: Option<&str>,
        force: bool,
    ) -> Result<ActionReport> {
        if device.is_none() && !force {
            let required = match verb {
                TopologyVerb::Start => Some(ProvisioningStatus::Defined),
                TopologyVerb::Define => Some(ProvisioningStatus::Undefined),
                _ => None,
            };
            if let Some(required) = required {
                let current = self.orchestrator.store().snapshot().await?.topology(topology)?.provisioning_status;
                if current != required {
                    info!(
                        topology = %topology,
                        verb = %verb,
                        status = %current,
                        "Topology is not {}, skipping (use force to override)",
                        required
                    );
                    return Ok(ActionReport::new(Self::primary_action(verb)));
                }
            }
        }

        info!(topology = %topology, verb = %verb, device = ?device, force, "Running operator action");
        match verb {
            TopologyVerb::Define => self.run_action(topology, Action::Define, device).await,
            TopologyVerb::Start => self.run_action(topology, Action::Create, device).await,
            TopologyVerb::Stop => self.run_action(topology, Action::Destroy, device).await,
            TopologyVerb::Undefine => self.run_action(topology, Action::Undefine, device).await,
            TopologyVerb::Reboot => {
                let mut report = self.run_action(topology, Action::Destroy, device).await?;
                report.merge(self.run_action(topology, Action::Create, device).await?);
                Ok(report)
            }
            TopologyVerb::HardReset => {
                let settle = self.orchestrator.settings().settle();
                let mut report = self.run_action(topology, Action::Destroy, device).await?;
                report.merge(self.run_action(topology, Action::Undefine, device).await?);
                tokio::time::sleep(settle).await;
                report.merge(self.run_action(topology, Action::Define, device).await?);
                tokio::time::sleep(settle).await;
                report.merge(self.run_action(topology, Action::Create, device).await?);
                Ok(report)
            }
        }
    }

    fn primary_action(verb: TopologyVerb) -> Action {
        match verb {
            TopologyVerb::Define => Action::Define,
            TopologyVerb::Start | TopologyVerb::Reboot | TopologyVerb::HardReset => Action::Create,
            TopologyVerb::Stop => Action::Destroy,
            TopologyVerb::Undefine => Action::Undefine,
        }
    }

    /// One orchestrator pass; `Destroy` stands for the full stop sequence.
    async fn run_action(&self, topology: &str, action: Action, device: Option<&str>) -> Result<ActionReport> {
        let report = match action {
            Action::Destroy => self.orchestrator.stop(topology, device).await?,
            _ => self.orchestrator.run(topology, action, device).await?,
        };

        if !report.rejected.is_empty() {
            warn!(
                topology = %topology,
                action = %action,
                devices = ?report.rejected,
                "Devices refused the action, topology status unchanged"
            );
        } else if device.is_none() {
            if let Some(status) = action_status(action) {
                self.orchestrator
                    .store()
                    .update(topology, TopologyChange::TopologyStatus(status))
                    .await?;
            }
            if let Some(monitor) = &self.monitor {
                match action {
                    Action::Create => monitor.schedule(topology).await?,
                    Action::Destroy | Action::Undefine => monitor.unschedule(topology).await?,
                    _ => {}
                }
            }
        }
        Ok(report)
    }

    /// Run a verb on one link.
    pub async fn link(&self, topology: &str, link: &LinkId, verb: LinkVerb) -> Result<ActionReport> {
        info!(topology = %topology, link = %link, verb = ?verb, "Running link action");
        match verb {
            LinkVerb::Start => self.orchestrator.link_action(topology, link, Action::Create).await,
            LinkVerb::Stop => self.orchestrator.link_action(topology, link, Action::Destroy).await,
            LinkVerb::SetDelay(delay) => {
                self.orchestrator
                    .store()
                    .update(topology, TopologyChange::LinkDelay { link: link.clone(), delay: Some(delay) })
                    .await?;
                self.orchestrator.link_action(topology, link, Action::Update).await
            }
        }
    }
}
