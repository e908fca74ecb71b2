//! Running monitors, one per topology.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::console::{console_port, ConsoleSource, ConsoleWorker};
use super::liveness::{LivenessWorker, Prober};
use super::supervisor::Supervisor;
use super::{is_stopped, wait_for_stop, MonitorEvent, MonitorSettings, EVENT_CHANNEL_CAPACITY};
use crate::actions::MonitorControl;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::placement::Placement;
use crate::status::{StatusChecker, StatusReport};
use crate::store::{ConfigStore, TopologyChange};

/// Whether a topology is monitored, and by which worker set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub worker: Option<Uuid>,
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.worker {
            Some(id) if self.running => write!(f, "running ({})", id),
            _ => f.write_str("not-running"),
        }
    }
}

struct MonitorHandle {
    id: Uuid,
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    supervisor: JoinHandle<usize>,
}

pub struct MonitorRegistry {
    orchestrator: Arc<Orchestrator>,
    prober: Arc<dyn Prober>,
    console: Option<Arc<dyn ConsoleSource>>,
    settings: MonitorSettings,
    running: Mutex<HashMap<String, MonitorHandle>>,
}

impl MonitorRegistry {
    pub fn new(orchestrator: Arc<Orchestrator>, prober: Arc<dyn Prober>, settings: MonitorSettings) -> Self {
        Self {
            orchestrator,
            prober,
            console: None,
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Watch device consoles as well.
    pub fn with_console(mut self, console: Arc<dyn ConsoleSource>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    fn checker(&self) -> StatusChecker {
        StatusChecker::new(self.orchestrator.manager().clone(), self.prober.clone())
    }

    /// Console endpoints of the topology's managed devices.
    async fn console_targets(&self, topology: &str) -> Result<Vec<(String, String, u16)>> {
        let lab = self.orchestrator.store().snapshot().await?;
        let config = lab.topology(topology)?;
        let placement = Placement::new(&lab, config)?;
        let mut targets = Vec::new();
        for device in &config.devices {
            if !lab.definition(&device.definition)?.managed {
                continue;
            }
            let Some(port) = console_port(device.id) else {
                warn!(device = %device.name, id = device.id, "Device id has no console port, not watching");
                continue;
            };
            let hypervisor = lab.hypervisor(placement.hypervisor_of(device.id)?)?;
            let host = hypervisor.host.clone().unwrap_or_else(|| "localhost".to_string());
            targets.push((device.name.clone(), host, port));
        }
        Ok(targets)
    }

    /// Start monitoring a topology. Returns the worker set id; starting
    /// a running monitor returns the existing id.
    #[instrument(skip(self), fields(topology = %topology))]
    pub async fn start(&self, topology: &str) -> Result<Uuid> {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.get(topology) {
            info!(worker = %handle.id, "Monitor already running");
            return Ok(handle.id);
        }

        let consoles: Vec<ConsoleWorker> = match &self.console {
            Some(source) => self
                .console_targets(topology)
                .await?
                .into_iter()
                .map(|(device, host, port)| ConsoleWorker {
                    device,
                    host,
                    port,
                    source: source.clone(),
                    reconnect: self.settings.console_reconnect(),
                })
                .collect(),
            None => Vec::new(),
        };
        // Validates the topology name before anything is spawned
        self.orchestrator.store().snapshot().await?.topology(topology)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers = Vec::new();

        let liveness = LivenessWorker::new(
            topology,
            self.orchestrator.store().clone(),
            self.prober.clone(),
            self.settings.clone(),
        );
        workers.push(tokio::spawn(liveness.run(tx.clone(), stop_rx.clone())));

        let console_running = !consoles.is_empty();
        for console in consoles {
            workers.push(tokio::spawn(console.run(tx.clone(), stop_rx.clone())));
        }

        workers.push(tokio::spawn(run_status(
            topology.to_string(),
            self.orchestrator.store().clone(),
            self.checker(),
            console_running,
            self.settings.interval(),
            tx,
            stop_rx,
        )));

        let supervisor = Supervisor::new(topology, self.orchestrator.store().clone())
            .with_orchestrator(self.orchestrator.clone());
        let supervisor = tokio::spawn(supervisor.run(rx, workers.len()));

        let id = Uuid::new_v4();
        info!(worker = %id, workers = workers.len(), "Monitor started");
        running.insert(topology.to_string(), MonitorHandle { id, stop: stop_tx, workers, supervisor });
        Ok(id)
    }

    /// Stop a topology's monitor and wait for every worker. Returns the
    /// number of changes the supervisor wrote, `None` when not running.
    #[instrument(skip(self), fields(topology = %topology))]
    pub async fn stop(&self, topology: &str) -> Result<Option<usize>> {
        let Some(handle) = self.running.lock().await.remove(topology) else {
            info!("Monitor not running");
            return Ok(None);
        };

        let _ = handle.stop.send(true);
        for result in futures::future::join_all(handle.workers).await {
            if let Err(e) = result {
                error!(error = %e, "Monitor worker failed");
            }
        }
        let written = match handle.supervisor.await {
            Ok(written) => written,
            Err(e) => {
                error!(error = %e, "Monitor supervisor failed");
                0
            }
        };
        info!(worker = %handle.id, written, "Monitor stopped");
        Ok(Some(written))
    }

    /// Stop every running monitor.
    pub async fn stop_all(&self) -> Result<()> {
        let topologies: Vec<String> = self.running.lock().await.keys().cloned().collect();
        for topology in topologies {
            self.stop(&topology).await?;
        }
        Ok(())
    }

    pub async fn status(&self, topology: &str) -> MonitorStatus {
        match self.running.lock().await.get(topology) {
            Some(handle) => MonitorStatus { running: true, worker: Some(handle.id) },
            None => MonitorStatus { running: false, worker: None },
        }
    }

    /// Delete the topology's state events.
    pub async fn clear(&self, topology: &str) -> Result<()> {
        self.orchestrator.store().update(topology, TopologyChange::ClearEvents).await?;
        info!(topology = %topology, "Cleared state events");
        Ok(())
    }

    /// One probe round and one status check, written in place.
    #[instrument(skip(self), fields(topology = %topology))]
    pub async fn once(&self, topology: &str) -> Result<StatusReport> {
        let store = self.orchestrator.store().clone();
        let supervisor = Supervisor::new(topology, store.clone());
        let (_stop_tx, stop_rx) = watch::channel(false);

        let mut liveness = LivenessWorker::new(topology, store.clone(), self.prober.clone(), self.settings.clone());
        for event in liveness.cycle(&stop_rx).await? {
            supervisor.apply(MonitorEvent::State(event)).await?;
        }

        let lab = store.snapshot().await?;
        let report = self.checker().check(&lab, topology, false, Utc::now()).await?;
        for change in &report.changes {
            supervisor.apply(MonitorEvent::Change(change.clone())).await?;
        }
        Ok(report)
    }
}

#[async_trait]
impl MonitorControl for MonitorRegistry {
    async fn schedule(&self, topology: &str) -> Result<()> {
        self.start(topology).await.map(|_| ())
    }

    async fn unschedule(&self, topology: &str) -> Result<()> {
        self.stop(topology).await.map(|_| ())
    }
}

/// Periodic status check until the topology is ready or the monitor
/// stops. Silent devices are handed to the supervisor for a reboot.
async fn run_status(
    topology: String,
    store: Arc<dyn ConfigStore>,
    checker: StatusChecker,
    console_running: bool,
    interval: Duration,
    tx: mpsc::Sender<MonitorEvent>,
    mut stop: watch::Receiver<bool>,
) {
    info!(topology = %topology, "Starting status check");

    'outer: while !is_stopped(&stop) {
        let report = match store.snapshot().await {
            Ok(lab) => checker.check(&lab, &topology, console_running, Utc::now()).await,
            Err(e) => Err(e),
        };

        match report {
            Ok(report) => {
                for change in report.changes.iter().cloned() {
                    if tx.send(MonitorEvent::Change(change)).await.is_err() {
                        break 'outer;
                    }
                }
                for device in report.reboots.iter().cloned() {
                    if tx.send(MonitorEvent::Reboot(device)).await.is_err() {
                        break 'outer;
                    }
                }
                if report.is_ready() {
                    info!(topology = %topology, "Topology ready, status check done");
                    break;
                }
            }
            Err(e) => warn!(topology = %topology, error = %e, "Status check failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_for_stop(&mut stop) => break,
        }
    }

    let _ = tx.send(MonitorEvent::Stopped("status".to_string())).await;
}
