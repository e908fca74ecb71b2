//! Per-topology liveness monitoring.
//!
//! Each running topology gets a small set of tokio tasks: one liveness
//! worker probing every managed device, one console watchdog per device,
//! and a status task driving devices to `ready`. Workers never touch the
//! store for writes; they send [`MonitorEvent`]s over a bounded channel
//! to a supervisor task that applies them in order, reboots included.

pub mod console;
pub mod liveness;
mod registry;
mod supervisor;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::model::StateEvent;
use crate::store::TopologyChange;

pub use console::{console_port, ConsoleSource, TcpConsole};
pub use liveness::{Hysteresis, LivenessWorker, PingProber, Prober, ScriptedProber};
pub use registry::{MonitorRegistry, MonitorStatus};
pub use supervisor::Supervisor;

/// Capacity of the worker to supervisor channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Monitor tuning, the `monitor` section of the node config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Seconds between two probe rounds
    pub interval_secs: u64,
    /// Consecutive failed probes before a device is offline
    pub threshold: usize,
    /// Echo requests per probe
    pub probe_count: u32,
    /// Seconds to wait for each echo reply
    pub probe_wait_secs: u32,
    /// Seconds before a dropped console connection is retried
    pub console_reconnect_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            threshold: 3,
            probe_count: 3,
            probe_wait_secs: 2,
            console_reconnect_secs: 10,
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn console_reconnect(&self) -> Duration {
        Duration::from_secs(self.console_reconnect_secs)
    }
}

/// Message from a worker to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// Reachability transition
    State(StateEvent),
    /// A line of console output
    Console { device: String, at: DateTime<Utc>, message: String },
    /// Status change computed by the status task
    Change(TopologyChange),
    /// Power-cycle a silent device
    Reboot(String),
    /// Sentinel sent by a worker on exit
    Stopped(String),
}

/// Resolve once the stop signal is raised or its sender is gone.
pub(crate) async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) fn is_stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}
