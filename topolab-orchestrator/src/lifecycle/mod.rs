//! Resource lifecycle controllers.
//!
//! Networks, volumes and domains share one state machine driven by the
//! live state each backend reports:
//!
//! | action     | allowed when        |
//! |------------|---------------------|
//! | `define`   | absent              |
//! | `create`   | defined, inactive   |
//! | `shutdown` | active              |
//! | `destroy`  | active              |
//! | `undefine` | defined, inactive   |
//! | `update`   | defined             |
//!
//! Anything else is a silent no-op, which makes every action safe to
//! repeat. Each resource kind has a controller trait; the orchestrator
//! picks implementations from a [`Controllers`] table.

pub mod domain;
pub mod network;
pub mod volume;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use topolab_virt::{Day0Packager, PowerAction, ResourceRef, ResourceState};

use crate::allocator::ResourceAllocator;
use crate::cache::{BackendCache, BackendKind, Connection};
use crate::error::{OrchestratorError, Result};
use crate::manager::DeviceManager;
use crate::model::{Device, DeviceDefinition, Hypervisor, Lab, Topology};
use crate::placement::Placement;
use crate::profiles::{DeviceProfile, ProfileRegistry};
use crate::resolver::NetworkResolver;
use crate::store::{ConfigStore, TopologyChange};
use crate::template::TemplateRenderer;

pub use domain::{ContainerDomains, SimulationDomains, VmDomains};
pub use network::{NetworkOwner, NetworkSpec, VirtualNetworks};
pub use volume::PoolVolumes;

// =============================================================================
// ACTIONS
// =============================================================================

/// A lifecycle action on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Define,
    Create,
    Shutdown,
    Destroy,
    Undefine,
    Update,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Define => "define",
            Action::Create => "create",
            Action::Shutdown => "shutdown",
            Action::Destroy => "destroy",
            Action::Undefine => "undefine",
            Action::Update => "update",
        }
    }

    /// Backend power transition, for the actions that have one.
    pub fn power(&self) -> Option<PowerAction> {
        match self {
            Action::Create => Some(PowerAction::Create),
            Action::Shutdown => Some(PowerAction::Shutdown),
            Action::Destroy => Some(PowerAction::Destroy),
            Action::Undefine => Some(PowerAction::Undefine),
            Action::Define | Action::Update => None,
        }
    }

    /// Teardown actions run volumes after domains.
    pub fn is_teardown(&self) -> bool {
        matches!(self, Action::Shutdown | Action::Destroy | Action::Undefine)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "define" => Ok(Action::Define),
            "create" => Ok(Action::Create),
            "shutdown" => Ok(Action::Shutdown),
            "destroy" => Ok(Action::Destroy),
            "undefine" => Ok(Action::Undefine),
            "update" => Ok(Action::Update),
            other => Err(OrchestratorError::Configuration(format!("Unknown action {}", other))),
        }
    }
}

/// Whether `action` applies to a resource in `state`.
pub fn action_allowed(state: ResourceState, action: Action) -> bool {
    match action {
        Action::Define => state == ResourceState::Absent,
        Action::Create | Action::Undefine => state == ResourceState::Inactive,
        Action::Shutdown | Action::Destroy => state == ResourceState::Active,
        Action::Update => state.exists(),
    }
}

/// Whether a resource in `state` is already where `action` leads.
pub fn action_settled(state: ResourceState, action: Action) -> bool {
    match action {
        Action::Define => state.exists(),
        Action::Create => state == ResourceState::Active,
        Action::Shutdown | Action::Destroy => state != ResourceState::Active,
        Action::Undefine => state == ResourceState::Absent,
        Action::Update => true,
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// Resources touched on one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendOutput {
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    pub domains: Vec<String>,
}

/// Operator-visible result of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub action: Action,
    /// Keyed by hypervisor name
    pub backends: BTreeMap<String, BackendOutput>,
    /// Keyed by device name
    pub failures: BTreeMap<String, String>,
    /// Devices whose domain refused the action in its current state
    pub rejected: Vec<String>,
}

impl ActionReport {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            backends: BTreeMap::new(),
            failures: BTreeMap::new(),
            rejected: Vec::new(),
        }
    }

    fn backend(&mut self, hypervisor: &str) -> &mut BackendOutput {
        self.backends.entry(hypervisor.to_string()).or_default()
    }

    pub fn network(&mut self, hypervisor: &str, name: impl Into<String>) {
        self.backend(hypervisor).networks.push(name.into());
    }

    pub fn volume(&mut self, hypervisor: &str, name: impl Into<String>) {
        self.backend(hypervisor).volumes.push(name.into());
    }

    pub fn domain(&mut self, hypervisor: &str, name: impl Into<String>) {
        self.backend(hypervisor).domains.push(name.into());
    }

    pub fn failure(&mut self, resource: impl Into<String>, error: &OrchestratorError) {
        self.failures.insert(resource.into(), error.to_string());
    }

    pub fn reject(&mut self, device: impl Into<String>) {
        self.rejected.push(device.into());
    }

    /// Fold another run into this one.
    pub fn merge(&mut self, other: ActionReport) {
        for (hypervisor, output) in other.backends {
            let entry = self.backend(&hypervisor);
            entry.networks.extend(output.networks);
            entry.volumes.extend(output.volumes);
            entry.domains.extend(output.domains);
        }
        self.failures.extend(other.failures);
        self.rejected.extend(other.rejected);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for ActionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "action: {}", self.action)?;
        for (hypervisor, output) in &self.backends {
            writeln!(f, "  {}:", hypervisor)?;
            for (kind, names) in [
                ("networks", &output.networks),
                ("volumes", &output.volumes),
                ("domains", &output.domains),
            ] {
                if !names.is_empty() {
                    writeln!(f, "    {}: {}", kind, names.join(", "))?;
                }
            }
        }
        for (resource, error) in &self.failures {
            writeln!(f, "  failed {}: {}", resource, error)?;
        }
        if !self.rejected.is_empty() {
            writeln!(f, "  rejected: {}", self.rejected.join(", "))?;
        }
        Ok(())
    }
}

// =============================================================================
// RUN CONTEXT
// =============================================================================

/// Everything a controller reads during one orchestration run.
pub struct RunContext<'a> {
    pub lab: &'a Lab,
    pub topology: &'a Topology,
    pub placement: &'a Placement,
    pub resolver: &'a NetworkResolver,
    pub allocators: &'a BTreeMap<String, ResourceAllocator>,
    pub profiles: &'a ProfileRegistry,
    pub cache: &'a BackendCache,
    pub store: &'a dyn ConfigStore,
    pub renderer: &'a dyn TemplateRenderer,
    pub packager: &'a dyn Day0Packager,
    pub manager: &'a dyn DeviceManager,
}

/// A device with everything derived from it.
pub struct DeviceContext<'a> {
    pub device: &'a Device,
    pub definition: &'a DeviceDefinition,
    pub profile: &'a DeviceProfile,
    pub hypervisor: &'a Hypervisor,
    pub allocator: &'a ResourceAllocator,
}

impl DeviceContext<'_> {
    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn is_managed(&self) -> bool {
        self.definition.managed
    }
}

impl<'a> RunContext<'a> {
    pub fn allocator(&self, hypervisor: &str) -> Result<&'a ResourceAllocator> {
        self.allocators
            .get(hypervisor)
            .ok_or_else(|| OrchestratorError::UnknownHypervisor(hypervisor.to_string()))
    }

    pub fn device(&self, device: &'a Device) -> Result<DeviceContext<'a>> {
        let definition = self.lab.definition(&device.definition)?;
        let hypervisor = self.lab.hypervisor(self.placement.hypervisor_of(device.id)?)?;
        Ok(DeviceContext {
            device,
            definition,
            profile: self.profiles.get(&definition.device_type),
            allocator: self.allocator(&hypervisor.name)?,
            hypervisor,
        })
    }

    pub async fn connection(&self, hypervisor: &str, kind: BackendKind) -> Result<Arc<Connection>> {
        self.cache.connection(hypervisor, kind).await
    }

    pub async fn write(&self, change: TopologyChange) -> Result<()> {
        self.store.update(&self.topology.name, change).await
    }

    pub async fn write_all(&self, changes: impl IntoIterator<Item = TopologyChange>) -> Result<()> {
        for change in changes {
            self.write(change).await?;
        }
        Ok(())
    }
}

/// Live state of a resource on a connection.
pub(crate) async fn live_state(connection: &Connection, resource: &ResourceRef) -> Result<ResourceState> {
    Ok(connection.driver.state(resource).await?)
}

// =============================================================================
// CONTROLLERS
// =============================================================================

/// Network lifecycle.
#[async_trait]
pub trait NetworkController: Send + Sync {
    async fn apply(
        &self,
        ctx: &RunContext<'_>,
        network: &NetworkSpec,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<()>;
}

/// Volume lifecycle. Volumes only know define and undefine.
#[async_trait]
pub trait VolumeController: Send + Sync {
    async fn apply(
        &self,
        ctx: &RunContext<'_>,
        device: &DeviceContext<'_>,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<()>;
}

/// Domain or container lifecycle.
#[async_trait]
pub trait DomainController: Send + Sync {
    /// Run `action`. Returns whether the backend acted, which gates the
    /// management-plane and store follow-ups.
    async fn apply(
        &self,
        ctx: &RunContext<'_>,
        device: &DeviceContext<'_>,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<bool>;

    /// Live state of the device's domain.
    async fn state(&self, ctx: &RunContext<'_>, device: &DeviceContext<'_>) -> Result<ResourceState>;

    async fn is_active(&self, ctx: &RunContext<'_>, device: &DeviceContext<'_>) -> Result<bool> {
        Ok(self.state(ctx, device).await?.is_active())
    }

    /// Whether a domain the controller did not act on already is where
    /// `action` leads.
    async fn settled(&self, ctx: &RunContext<'_>, device: &DeviceContext<'_>, action: Action) -> Result<bool> {
        Ok(action_settled(self.state(ctx, device).await?, action))
    }
}

/// Controller implementations per resource kind and backend.
#[derive(Clone)]
pub struct Controllers {
    pub networks: Arc<dyn NetworkController>,
    pub volumes: Arc<dyn VolumeController>,
    domains: BTreeMap<BackendKind, Arc<dyn DomainController>>,
}

impl Default for Controllers {
    fn default() -> Self {
        Self {
            networks: Arc::new(VirtualNetworks),
            volumes: Arc::new(PoolVolumes),
            domains: BTreeMap::from([
                (BackendKind::Libvirt, Arc::new(VmDomains) as Arc<dyn DomainController>),
                (BackendKind::Container, Arc::new(ContainerDomains) as Arc<dyn DomainController>),
                (BackendKind::Simulation, Arc::new(SimulationDomains) as Arc<dyn DomainController>),
            ]),
        }
    }
}

impl Controllers {
    pub fn with_domains(mut self, kind: BackendKind, controller: Arc<dyn DomainController>) -> Self {
        self.domains.insert(kind, controller);
        self
    }

    /// Domain controller of a backend kind, falling back to the VM one.
    pub fn domains(&self, kind: BackendKind) -> Result<&dyn DomainController> {
        self.domains
            .get(&kind)
            .or_else(|| self.domains.get(&BackendKind::Libvirt))
            .map(|c| c.as_ref())
            .ok_or_else(|| OrchestratorError::Internal(format!("No domain controller for {}", kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_allowed() {
        use ResourceState::*;
        assert!(action_allowed(Absent, Action::Define));
        assert!(!action_allowed(Inactive, Action::Define));
        assert!(action_allowed(Inactive, Action::Create));
        assert!(!action_allowed(Active, Action::Create));
        assert!(action_allowed(Active, Action::Shutdown));
        assert!(action_allowed(Active, Action::Destroy));
        assert!(!action_allowed(Inactive, Action::Destroy));
        assert!(action_allowed(Inactive, Action::Undefine));
        assert!(!action_allowed(Active, Action::Undefine));
        assert!(!action_allowed(Absent, Action::Undefine));
        assert!(action_allowed(Active, Action::Update));
        assert!(!action_allowed(Absent, Action::Update));
    }

    #[test]
    fn test_action_settled() {
        use ResourceState::*;
        assert!(action_settled(Inactive, Action::Define));
        assert!(action_settled(Active, Action::Define));
        assert!(!action_settled(Absent, Action::Create));
        assert!(action_settled(Active, Action::Create));
        assert!(action_settled(Inactive, Action::Destroy));
        assert!(action_settled(Absent, Action::Shutdown));
        assert!(!action_settled(Active, Action::Shutdown));
        assert!(action_settled(Absent, Action::Undefine));
        assert!(!action_settled(Active, Action::Undefine));
        assert!(!action_settled(Inactive, Action::Undefine));
    }

    #[test]
    fn test_action_names() {
        for action in [Action::Define, Action::Create, Action::Shutdown, Action::Destroy, Action::Undefine] {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("start".parse::<Action>().is_err());
        assert_eq!(Action::Define.power(), None);
        assert_eq!(Action::Destroy.power(), Some(PowerAction::Destroy));
    }

    #[test]
    fn test_report_merge_and_display() {
        let mut report = ActionReport::new(Action::Define);
        report.network("hv1", "net-1-2");
        report.domain("hv1", "r1");

        let mut other = ActionReport::new(Action::Define);
        other.domain("hv1", "r2");
        other.failure("r3", &OrchestratorError::UnknownDevice("r3".to_string()));
        other.reject("r4");
        report.merge(other);

        assert_eq!(report.backends["hv1"].domains, vec!["r1", "r2"]);
        assert_eq!(report.rejected, vec!["r4"]);
        assert!(!report.is_success());
        let text = report.to_string();
        assert!(text.contains("networks: net-1-2"));
        assert!(text.contains("failed r3"));
        assert!(text.contains("rejected: r4"));
    }
}
