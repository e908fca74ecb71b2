//! Single writer of monitor results.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::MonitorEvent;
use crate::error::Result;
use crate::model::{EventKind, OperationalStatus};
use crate::orchestrator::Orchestrator;
use crate::store::{ConfigStore, TopologyChange};

/// Applies worker events to the store, in arrival order.
pub struct Supervisor {
    topology: String,
    store: Arc<dyn ConfigStore>,
    orchestrator: Option<Arc<Orchestrator>>,
}

impl Supervisor {
    pub fn new(topology: impl Into<String>, store: Arc<dyn ConfigStore>) -> Self {
        Self { topology: topology.into(), store, orchestrator: None }
    }

    /// Run reboot requests through `orchestrator`.
    pub fn with_orchestrator(mut self, orchestrator: Arc<Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Store changes an event translates to.
    pub fn changes(event: MonitorEvent) -> Vec<TopologyChange> {
        match event {
            MonitorEvent::State(event) => {
                let operational = match event.kind {
                    EventKind::Online => Some(OperationalStatus::Reachable),
                    EventKind::Offline => Some(OperationalStatus::NotReachable),
                    EventKind::Warn => None,
                };
                let mut changes = Vec::with_capacity(2);
                if let Some(operational) = operational {
                    changes.push(TopologyChange::DeviceStatus {
                        device: event.device.clone(),
                        provisioning: None,
                        operational: Some(operational),
                    });
                }
                changes.insert(0, TopologyChange::AppendEvent(event));
                changes
            }
            MonitorEvent::Console { device, at, message } => {
                vec![TopologyChange::ConsoleActivity { device, at, message }]
            }
            MonitorEvent::Change(change) => vec![change],
            MonitorEvent::Reboot(_) | MonitorEvent::Stopped(_) => Vec::new(),
        }
    }

    /// Apply one event, returning the number of changes written. Status
    /// writes made by a reboot are not counted.
    pub async fn apply(&self, event: MonitorEvent) -> Result<usize> {
        if let MonitorEvent::Reboot(device) = &event {
            self.reboot(device).await?;
            return Ok(0);
        }
        let changes = Self::changes(event);
        let count = changes.len();
        for change in changes {
            self.store.update(&self.topology, change).await?;
        }
        Ok(count)
    }

    async fn reboot(&self, device: &str) -> Result<()> {
        let Some(orchestrator) = &self.orchestrator else {
            warn!(device = %device, "No orchestrator attached, reboot skipped");
            return Ok(());
        };
        let report = orchestrator.reboot_device(&self.topology, device).await?;
        info!(
            device = %device,
            failures = report.failures.len(),
            rejected = report.rejected.len(),
            "Device rebooted"
        );
        Ok(())
    }

    /// Apply events until every one of `workers` has sent its sentinel,
    /// then drain what is left. Returns the number of changes written.
    #[instrument(skip_all, fields(topology = %self.topology, workers))]
    pub async fn run(self, mut rx: mpsc::Receiver<MonitorEvent>, workers: usize) -> usize {
        let mut remaining = workers;
        let mut written = 0;

        while remaining > 0 {
            let Some(event) = rx.recv().await else {
                warn!(remaining, "All workers gone without stopping");
                break;
            };
            if let MonitorEvent::Stopped(worker) = &event {
                remaining -= 1;
                debug!(worker = %worker, remaining, "Worker stopped");
                continue;
            }
            match self.apply(event).await {
                Ok(count) => written += count,
                Err(e) => warn!(error = %e, "Failed to write monitor event"),
            }
        }

        rx.close();
        while let Ok(event) = rx.try_recv() {
            warn!(event = ?event, "Unexpected monitor event after shutdown");
        }
        info!(written, "Supervisor stopped");
        written
    }
}
