//! Topology orchestrator.
//!
//! One run reads a lab snapshot, resolves the topology, and walks every
//! resource in dependency order:
//!
//! 1. topology networks (profile-shared, explicit, link), whole-topology runs only
//! 2. per device: isolated and extra management networks
//! 3. per device: volumes before the domain on `define`, after it otherwise
//! 4. per device: the domain action
//! 5. per device: status write-back, skipped when the domain refused the action
//!
//! Resolution and allocation happen before the first backend call, so a
//! configuration conflict aborts the run with nothing changed. After that,
//! failures are recorded per resource and the run carries on.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use topolab_virt::Day0Packager;

use crate::allocator::ResourceAllocator;
use crate::cache::{BackendCache, Connector};
use crate::error::{OrchestratorError, Result};
use crate::lifecycle::domain::domain_action;
use crate::lifecycle::{Action, ActionReport, Controllers, NetworkOwner, NetworkSpec, RunContext};
use crate::manager::DeviceManager;
use crate::model::{Device, Lab, LinkId, OperationalStatus, ProvisioningStatus, Topology};
use crate::placement::Placement;
use crate::profiles::ProfileRegistry;
use crate::resolver::NetworkResolver;
use crate::store::{ConfigStore, TopologyChange};
use crate::template::TemplateRenderer;

/// Timing of the orchestrator's blocking steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub shutdown_poll_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Pause between teardown and recreation in a hard reset
    pub settle_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            shutdown_poll_secs: 10,
            shutdown_timeout_secs: 60,
            settle_secs: 5,
        }
    }
}

impl OrchestratorSettings {
    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_secs(self.shutdown_poll_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

/// Provisioning status an action leaves a device or topology in.
pub fn action_status(action: Action) -> Option<ProvisioningStatus> {
    match action {
        Action::Define | Action::Shutdown | Action::Destroy => Some(ProvisioningStatus::Defined),
        Action::Create => Some(ProvisioningStatus::Started),
        Action::Undefine => Some(ProvisioningStatus::Undefined),
        Action::Update => None,
    }
}

/// Device status change after a successful action.
fn device_status(device: &str, action: Action, managed: bool) -> Option<TopologyChange> {
    if !managed && action == Action::Create {
        return Some(TopologyChange::DeviceStatus {
            device: device.to_string(),
            provisioning: Some(ProvisioningStatus::Unmanaged),
            operational: Some(OperationalStatus::Reachable),
        });
    }
    let provisioning = action_status(action)?;
    Some(TopologyChange::DeviceStatus {
        device: device.to_string(),
        provisioning: Some(provisioning),
        operational: action.is_teardown().then_some(OperationalStatus::NotReachable),
    })
}

/// A resolved topology plus the per-run connection cache.
struct Prepared {
    lab: Lab,
    topology: Topology,
    placement: Placement,
    resolver: NetworkResolver,
    allocators: BTreeMap<String, ResourceAllocator>,
    cache: BackendCache,
}

/// Drives lifecycle actions across a topology.
pub struct Orchestrator {
    store: Arc<dyn ConfigStore>,
    connector: Arc<dyn Connector>,
    renderer: Arc<dyn TemplateRenderer>,
    packager: Arc<dyn Day0Packager>,
    manager: Arc<dyn DeviceManager>,
    profiles: ProfileRegistry,
    controllers: Controllers,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        connector: Arc<dyn Connector>,
        renderer: Arc<dyn TemplateRenderer>,
        packager: Arc<dyn Day0Packager>,
        manager: Arc<dyn DeviceManager>,
    ) -> Self {
        Self {
            store,
            connector,
            renderer,
            packager,
            manager,
            profiles: ProfileRegistry::new(),
            controllers: Controllers::default(),
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_profiles(mut self, profiles: ProfileRegistry) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_controllers(mut self, controllers: Controllers) -> Self {
        self.controllers = controllers;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn manager(&self) -> &Arc<dyn DeviceManager> {
        &self.manager
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    async fn prepare(&self, topology: &str) -> Result<Prepared> {
        let lab = self.store.snapshot().await?;
        let topology = lab.topology(topology)?.clone();
        let placement = Placement::new(&lab, &topology)?;
        let resolver = NetworkResolver::new(&topology, &placement)?;

        let mut allocators = BTreeMap::new();
        for name in placement.all_hypervisors() {
            let allocator = ResourceAllocator::new(lab.hypervisor(&name)?)?;
            allocators.insert(name, allocator);
        }

        let cache = BackendCache::new(self.connector.clone(), &lab);
        Ok(Prepared { lab, topology, placement, resolver, allocators, cache })
    }

    fn context<'a>(&'a self, prepared: &'a Prepared) -> RunContext<'a> {
        RunContext {
            lab: &prepared.lab,
            topology: &prepared.topology,
            placement: &prepared.placement,
            resolver: &prepared.resolver,
            allocators: &prepared.allocators,
            profiles: &self.profiles,
            cache: &prepared.cache,
            store: self.store.as_ref(),
            renderer: self.renderer.as_ref(),
            packager: self.packager.as_ref(),
            manager: self.manager.as_ref(),
        }
    }

    /// Run `action` on a whole topology, or on one device of it.
    #[instrument(skip(self), fields(topology = %topology, action = %action))]
    pub async fn run(&self, topology: &str, action: Action, device: Option<&str>) -> Result<ActionReport> {
        let prepared = self.prepare(topology).await?;
        let ctx = self.context(&prepared);
        if let Some(name) = device {
            ctx.topology
                .device(name)
                .ok_or_else(|| OrchestratorError::UnknownDevice(name.to_string()))?;
        }

        info!(device = ?device, "Running topology action");
        let mut report = ActionReport::new(action);

        if device.is_none() {
            for network in self.topology_networks(&ctx)? {
                if let Err(e) = self.controllers.networks.apply(&ctx, &network, action, &mut report).await {
                    warn!(network = %network.name(), hypervisor = %network.hypervisor, error = %e, "Network action failed");
                    report.failure(network.name(), &e);
                }
            }
        }

        for target in ctx.topology.devices.iter().filter(|d| device.map_or(true, |name| d.name == name)) {
            if let Err(e) = self.device_action(&ctx, target, action, &mut report).await {
                warn!(device = %target.name, error = %e, "Device action failed");
                report.failure(&target.name, &e);
            }
        }

        info!(failures = report.failures.len(), "Topology action finished");
        Ok(report)
    }

    /// Networks of the whole topology in realization order.
    fn topology_networks(&self, ctx: &RunContext<'_>) -> Result<Vec<NetworkSpec>> {
        let mut networks = NetworkSpec::for_topology(ctx)?;

        // Positions count external bridges so a MAC stays put when one is added
        for (idx, network) in ctx.topology.networks.iter().enumerate() {
            if network.external_bridge.is_some() {
                continue;
            }
            let last = 0xff_u32.checked_sub(idx as u32).ok_or_else(|| {
                OrchestratorError::Allocation(format!("Too many networks in topology {}", ctx.topology.name))
            })?;
            networks.extend(NetworkSpec::extra(
                ctx,
                &network.name,
                None,
                NetworkOwner::Network(network.name.clone()),
                (0xfe, last),
            )?);
        }

        for link in &ctx.topology.links {
            if let Some(network) = NetworkSpec::link(ctx, link)? {
                networks.push(network);
            }
        }
        Ok(networks)
    }

    async fn device_action(
        &self,
        ctx: &RunContext<'_>,
        device: &Device,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<()> {
        let device_ctx = ctx.device(device)?;
        debug!(device = %device.name, backend = %device_ctx.profile.backend, "Device action");

        for network in NetworkSpec::for_device(ctx, &device_ctx)? {
            self.controllers.networks.apply(ctx, &network, action, report).await?;
        }
        if action == Action::Define {
            self.controllers.volumes.apply(ctx, &device_ctx, action, report).await?;
        }
        if !domain_action(ctx, &self.controllers, &device_ctx, action, report).await? {
            warn!(device = %device.name, "Domain refused {} in its current state, keeping its records", action);
            report.reject(&device.name);
            return Ok(());
        }
        if action != Action::Define {
            self.controllers.volumes.apply(ctx, &device_ctx, action, report).await?;
        }

        if let Some(change) = device_status(&device.name, action, device_ctx.is_managed()) {
            ctx.write(change).await?;
        }
        Ok(())
    }

    /// Run `action` on the network of one link.
    #[instrument(skip(self), fields(topology = %topology, link = %link, action = %action))]
    pub async fn link_action(&self, topology: &str, link: &LinkId, action: Action) -> Result<ActionReport> {
        let prepared = self.prepare(topology).await?;
        let ctx = self.context(&prepared);
        let config = ctx
            .topology
            .link(link)
            .ok_or_else(|| OrchestratorError::Configuration(format!("Unknown link {}", link)))?;

        let mut report = ActionReport::new(action);
        match NetworkSpec::link(&ctx, config)? {
            Some(network) => self.controllers.networks.apply(&ctx, &network, action, &mut report).await?,
            None => info!("Link crosses hypervisors, no link network to act on"),
        }
        Ok(report)
    }

    /// Shut down, wait for the guests, then force off whatever is left.
    pub async fn stop(&self, topology: &str, device: Option<&str>) -> Result<ActionReport> {
        let mut report = self.run(topology, Action::Shutdown, device).await?;
        self.wait_for_shutdown(topology, device).await?;
        report.merge(self.run(topology, Action::Destroy, device).await?);
        Ok(report)
    }

    /// Power-cycle one device.
    pub async fn reboot_device(&self, topology: &str, device: &str) -> Result<ActionReport> {
        info!(topology = %topology, device = %device, "Rebooting device");
        let mut report = self.stop(topology, Some(device)).await?;
        report.merge(self.run(topology, Action::Create, Some(device)).await?);
        Ok(report)
    }

    /// Block until every targeted device that shuts down gracefully is
    /// inactive, polling at a fixed interval up to the timeout. Devices on
    /// backends without graceful shutdown are not waited for.
    #[instrument(skip(self), fields(topology = %topology))]
    pub async fn wait_for_shutdown(&self, topology: &str, device: Option<&str>) -> Result<()> {
        let prepared = self.prepare(topology).await?;
        let ctx = self.context(&prepared);
        let poll = self.settings.shutdown_poll();
        let timeout = self.settings.shutdown_timeout();
        let mut waited = Duration::ZERO;

        loop {
            let mut running = None;
            for target in ctx.topology.devices.iter().filter(|d| device.map_or(true, |name| d.name == name)) {
                let device_ctx = ctx.device(target)?;
                if !device_ctx.profile.graceful_shutdown {
                    continue;
                }
                match ctx.connection(&device_ctx.hypervisor.name, device_ctx.profile.backend).await {
                    Ok(connection) if !connection.capabilities.supports_graceful_shutdown => continue,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(device = %target.name, error = %e, "Backend unavailable, not waiting");
                        continue;
                    }
                }
                let controller = self.controllers.domains(device_ctx.profile.backend)?;
                match controller.is_active(&ctx, &device_ctx).await {
                    Ok(true) => {
                        running = Some(target.name.clone());
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(device = %target.name, error = %e, "Could not read domain state"),
                }
            }

            let Some(running) = running else {
                debug!(waited_secs = waited.as_secs(), "All devices shut down");
                return Ok(());
            };
            if waited >= timeout {
                warn!(device = %running, waited_secs = waited.as_secs(), "Gave up waiting for shutdown");
                return Ok(());
            }
            debug!(device = %running, "Waiting for shutdown");
            tokio::time::sleep(poll).await;
            waited += poll;
        }
    }
}
