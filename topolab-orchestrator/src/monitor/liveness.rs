//! Reachability probing with hysteresis.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{is_stopped, wait_for_stop, MonitorEvent, MonitorSettings};
use crate::error::{OrchestratorError, Result};
use crate::model::{EventKind, StateEvent};
use crate::store::ConfigStore;

// =============================================================================
// PROBERS
// =============================================================================

/// Reachability probe. Returns the number of lost echo requests.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str) -> Result<u32>;
}

/// Probe through the system `ping`.
#[derive(Debug, Clone)]
pub struct PingProber {
    count: u32,
    wait_secs: u32,
}

impl PingProber {
    pub fn new(count: u32, wait_secs: u32) -> Self {
        Self { count: count.max(1), wait_secs }
    }

    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self::new(settings.probe_count, settings.probe_wait_secs)
    }

    /// Lost packets from the `ping` summary line, all of them when the
    /// summary is missing.
    fn lost(&self, output: &str) -> u32 {
        for line in output.lines() {
            if !line.contains("transmitted") {
                continue;
            }
            let mut transmitted = None;
            let mut received = None;
            for part in line.split(',') {
                let Some(Ok(value)) = part.split_whitespace().next().map(str::parse::<u32>) else {
                    continue;
                };
                if part.contains("transmitted") {
                    transmitted = Some(value);
                } else if part.contains("received") {
                    received = Some(value);
                }
            }
            if let (Some(transmitted), Some(received)) = (transmitted, received) {
                return transmitted.saturating_sub(received);
            }
        }
        self.count
    }
}

#[async_trait]
impl Prober for PingProber {
    #[instrument(skip(self))]
    async fn probe(&self, address: &str) -> Result<u32> {
        let output = Command::new("ping")
            .arg("-c")
            .arg(self.count.to_string())
            .arg("-W")
            .arg(self.wait_secs.to_string())
            .arg(address)
            .output()
            .await
            .map_err(|e| OrchestratorError::Probe(format!("failed to run ping: {}", e)))?;
        let lost = self.lost(&String::from_utf8_lossy(&output.stdout));
        debug!(address = %address, lost, "Probe finished");
        Ok(lost)
    }
}

fn poisoned<T>(_: T) -> OrchestratorError {
    OrchestratorError::Internal("Lock poisoned".to_string())
}

/// Prober replaying queued results; unscripted probes succeed.
#[derive(Default)]
pub struct ScriptedProber {
    results: RwLock<HashMap<String, VecDeque<u32>>>,
    probes: RwLock<Vec<String>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for an address.
    pub fn push(&self, address: &str, lost: u32) {
        if let Ok(mut results) = self.results.write() {
            results.entry(address.to_string()).or_default().push_back(lost);
        }
    }

    /// Probed addresses in order.
    pub fn probes(&self) -> Vec<String> {
        self.probes.read().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, address: &str) -> Result<u32> {
        self.probes.write().map_err(poisoned)?.push(address.to_string());
        Ok(self
            .results
            .write()
            .map_err(poisoned)?
            .get_mut(address)
            .and_then(VecDeque::pop_front)
            .unwrap_or(0))
    }
}

// =============================================================================
// HYSTERESIS
// =============================================================================

/// Per-device miss tracking.
///
/// A device goes offline after `threshold` consecutive failed probes. The
/// first clean probe afterwards reports it online; a clean probe before
/// the threshold was reached reports a warning with the losses seen.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    threshold: usize,
    issues: HashMap<String, Vec<u32>>,
}

impl Hysteresis {
    pub fn new(threshold: usize) -> Self {
        Self { threshold: threshold.max(1), issues: HashMap::new() }
    }

    /// Record one probe result, returning the transition it causes.
    pub fn observe(&mut self, device: &str, lost: u32) -> Option<(EventKind, Vec<u32>)> {
        if lost > 0 {
            let issues = self.issues.entry(device.to_string()).or_default();
            if issues.len() >= self.threshold {
                return None;
            }
            issues.push(lost);
            if issues.len() == self.threshold {
                return Some((EventKind::Offline, issues.clone()));
            }
            return None;
        }

        let issues = self.issues.remove(device)?;
        if issues.len() >= self.threshold {
            Some((EventKind::Online, issues))
        } else {
            Some((EventKind::Warn, issues))
        }
    }

    /// Misses currently recorded for a device.
    pub fn misses(&self, device: &str) -> usize {
        self.issues.get(device).map_or(0, Vec::len)
    }
}

// =============================================================================
// WORKER
// =============================================================================

/// Probe loop of one topology.
pub struct LivenessWorker {
    topology: String,
    store: Arc<dyn ConfigStore>,
    prober: Arc<dyn Prober>,
    settings: MonitorSettings,
    hysteresis: Hysteresis,
}

impl LivenessWorker {
    pub fn new(
        topology: impl Into<String>,
        store: Arc<dyn ConfigStore>,
        prober: Arc<dyn Prober>,
        settings: MonitorSettings,
    ) -> Self {
        let hysteresis = Hysteresis::new(settings.threshold);
        Self { topology: topology.into(), store, prober, settings, hysteresis }
    }

    /// Managed devices with a management address, re-read every round.
    async fn targets(&self) -> Result<Vec<(String, String)>> {
        let lab = self.store.snapshot().await?;
        let topology = lab.topology(&self.topology)?;
        let mut targets = Vec::new();
        for device in &topology.devices {
            let managed = match lab.definition(&device.definition) {
                Ok(definition) => definition.managed,
                Err(e) => {
                    warn!(device = %device.name, error = %e, "Skipping device");
                    continue;
                }
            };
            if let (true, Some(address)) = (managed, &device.management_interface.ip_address) {
                targets.push((device.name.clone(), address.clone()));
            }
        }
        Ok(targets)
    }

    /// One probe round. Stops between devices once `stop` is raised.
    pub async fn cycle(&mut self, stop: &watch::Receiver<bool>) -> Result<Vec<StateEvent>> {
        let mut events = Vec::new();
        for (device, address) in self.targets().await? {
            if is_stopped(stop) {
                break;
            }
            let lost = match self.prober.probe(&address).await {
                Ok(lost) => lost,
                Err(e) => {
                    warn!(device = %device, error = %e, "Probe failed, counting as lost");
                    self.settings.probe_count.max(1)
                }
            };
            if let Some((kind, detail)) = self.hysteresis.observe(&device, lost) {
                info!(device = %device, event = kind.as_str(), detail = ?detail, "Reachability changed");
                events.push(StateEvent { timestamp: Utc::now(), device, kind, detail });
            }
        }
        Ok(events)
    }

    /// Probe until stopped, then send the `liveness` sentinel.
    #[instrument(skip_all, fields(topology = %self.topology))]
    pub async fn run(mut self, tx: mpsc::Sender<MonitorEvent>, mut stop: watch::Receiver<bool>) {
        info!(interval_secs = self.settings.interval_secs, threshold = self.settings.threshold, "Starting liveness worker");
        let interval = self.settings.interval();

        'outer: while !is_stopped(&stop) {
            let started = Instant::now();
            match self.cycle(&stop).await {
                Ok(events) => {
                    for event in events {
                        if tx.send(MonitorEvent::State(event)).await.is_err() {
                            warn!("Supervisor gone, stopping liveness worker");
                            break 'outer;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Probe round failed"),
            }

            let remaining = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = wait_for_stop(&mut stop) => break,
            }
        }

        info!("Liveness worker stopped");
        let _ = tx.send(MonitorEvent::Stopped("liveness".to_string())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_then_online() {
        let mut hysteresis = Hysteresis::new(3);
        assert_eq!(hysteresis.observe("r1", 3), None);
        assert_eq!(hysteresis.observe("r1", 2), None);
        assert_eq!(hysteresis.observe("r1", 3), Some((EventKind::Offline, vec![3, 2, 3])));
        // Bounded at the threshold
        assert_eq!(hysteresis.observe("r1", 3), None);
        assert_eq!(hysteresis.misses("r1"), 3);
        assert_eq!(hysteresis.observe("r1", 0), Some((EventKind::Online, vec![3, 2, 3])));
        assert_eq!(hysteresis.misses("r1"), 0);
        assert_eq!(hysteresis.observe("r1", 0), None);
    }

    #[test]
    fn test_flap_below_threshold_warns() {
        let mut hysteresis = Hysteresis::new(3);
        assert_eq!(hysteresis.observe("r1", 1), None);
        assert_eq!(hysteresis.observe("r2", 0), None);
        assert_eq!(hysteresis.observe("r1", 0), Some((EventKind::Warn, vec![1])));
    }

    #[test]
    fn test_threshold_of_one() {
        let mut hysteresis = Hysteresis::new(0);
        assert_eq!(hysteresis.observe("r1", 1), Some((EventKind::Offline, vec![1])));
        assert_eq!(hysteresis.observe("r1", 0), Some((EventKind::Online, vec![1])));
    }

    #[test]
    fn test_ping_summary() {
        let prober = PingProber::new(3, 2);
        let linux = "PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.\n\n\
                     --- 10.0.0.1 ping statistics ---\n\
                     3 packets transmitted, 1 received, 66.6667% packet loss, time 2003ms\n";
        assert_eq!(prober.lost(linux), 2);
        let busybox = "3 packets transmitted, 3 packets received, 0% packet loss\n";
        assert_eq!(prober.lost(busybox), 0);
        assert_eq!(prober.lost("ping: unknown host"), 3);
    }

    #[tokio::test]
    async fn test_scripted_prober() {
        let prober = ScriptedProber::new();
        prober.push("10.0.0.1", 3);
        assert_eq!(prober.probe("10.0.0.1").await.unwrap(), 3);
        assert_eq!(prober.probe("10.0.0.1").await.unwrap(), 0);
        assert_eq!(prober.probes(), vec!["10.0.0.1", "10.0.0.1"]);
    }
}
