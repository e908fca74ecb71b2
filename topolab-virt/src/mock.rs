//! Mock backend driver for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::{DriverError, Result};
use crate::traits::{Driver, DriverCapabilities};
use crate::types::*;

/// Mock driver backed by in-memory maps.
///
/// Behaves like a libvirt daemon that applies every request immediately:
/// networks and domains have an active flag, volumes only exist or not.
/// A shutdown delay makes guests linger in the active state instead.
/// Every call is counted so tests can assert how often the orchestrator
/// reached the backend. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed (`--dev`)
pub struct MockDriver {
    name: String,
    networks: RwLock<HashMap<String, MockNetwork>>,
    domains: RwLock<HashMap<String, MockDomain>>,
    volumes: RwLock<BTreeMap<String, BTreeMap<String, VolumeDefinition>>>,
    links: RwLock<Vec<DiscoveredLink>>,
    failures: RwLock<HashSet<String>>,
    calls: RwLock<HashMap<String, usize>>,
    graceful_shutdown: bool,
    shutdown_delay: usize,
}

struct MockNetwork {
    definition: NetworkDefinition,
    uuid: String,
    active: bool,
}

struct MockDomain {
    definition: DomainDefinition,
    active: bool,
    /// State reads left before a shut down domain goes inactive
    stopping: Option<usize>,
}

fn poisoned<T>(_: T) -> DriverError {
    DriverError::Internal("Lock poisoned".to_string())
}

impl MockDriver {
    /// Create a new mock driver with one empty `default` storage pool.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        info!(backend = %name, "Creating mock backend driver");
        let mut volumes = BTreeMap::new();
        volumes.insert("default".to_string(), BTreeMap::new());
        Self {
            name,
            networks: RwLock::new(HashMap::new()),
            domains: RwLock::new(HashMap::new()),
            volumes: RwLock::new(volumes),
            links: RwLock::new(Vec::new()),
            failures: RwLock::new(HashSet::new()),
            calls: RwLock::new(HashMap::new()),
            graceful_shutdown: true,
            shutdown_delay: 0,
        }
    }

    /// Whether the reported capabilities include graceful shutdown.
    pub fn with_graceful_shutdown(mut self, supported: bool) -> Self {
        self.graceful_shutdown = supported;
        self
    }

    /// Keep a shut down domain active for `reads` state reads, like a
    /// guest that takes a while to power off.
    pub fn with_shutdown_delay(mut self, reads: usize) -> Self {
        self.shutdown_delay = reads;
        self
    }

    /// Add an empty storage pool.
    pub fn with_pool(self, pool: impl Into<String>) -> Self {
        if let Ok(mut volumes) = self.volumes.write() {
            volumes.entry(pool.into()).or_default();
        }
        self
    }

    /// Pre-populate a volume, e.g. a base image.
    pub fn with_volume(self, pool: impl Into<String>, name: impl Into<String>) -> Self {
        let (pool, name) = (pool.into(), name.into());
        if let Ok(mut volumes) = self.volumes.write() {
            volumes.entry(pool.clone()).or_default().insert(name.clone(), VolumeDefinition {
                name,
                pool,
                format: VolumeFormat::Qcow2,
                source: VolumeSource::Upload(Vec::new()),
                resize_gib: None,
            });
        }
        self
    }

    /// Links returned by [`Driver::discover_links`].
    pub fn with_links(self, links: Vec<DiscoveredLink>) -> Self {
        if let Ok(mut l) = self.links.write() {
            *l = links;
        }
        self
    }

    /// Make every call to `operation` fail (names as in [`MockDriver::calls`]).
    pub fn fail_on(&self, operation: &str) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(operation.to_string());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of calls to `operation`: `inventory`, `state`,
    /// `define_network`, `update_network`, `create_volume`, `delete_volume`,
    /// `define_domain`, or a power action (`create`, `shutdown`, `destroy`,
    /// `undefine`).
    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .read()
            .map(|calls| calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total number of mutating calls.
    pub fn mutations(&self) -> usize {
        [
            "define_network", "update_network", "create_volume", "delete_volume",
            "define_domain", "create", "shutdown", "destroy", "undefine",
        ]
        .iter()
        .map(|op| self.calls(op))
        .sum()
    }

    pub fn domain(&self, name: &str) -> Option<DomainDefinition> {
        self.domains.read().ok()?.get(name).map(|d| d.definition.clone())
    }

    pub fn network(&self, name: &str) -> Option<NetworkDefinition> {
        self.networks.read().ok()?.get(name).map(|n| n.definition.clone())
    }

    pub fn network_uuid(&self, name: &str) -> Option<String> {
        self.networks.read().ok()?.get(name).map(|n| n.uuid.clone())
    }

    pub fn network_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .networks
            .read()
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .domains
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn volume(&self, pool: &str, name: &str) -> Option<VolumeDefinition> {
        self.volumes.read().ok()?.get(pool)?.get(name).cloned()
    }

    pub fn is_active(&self, resource: &ResourceRef) -> bool {
        match resource {
            ResourceRef::Network(name) => self
                .networks
                .read()
                .map(|n| n.get(name).map_or(false, |n| n.active))
                .unwrap_or(false),
            ResourceRef::Domain(name) => self
                .domains
                .read()
                .map(|d| d.get(name).map_or(false, |d| d.active))
                .unwrap_or(false),
            ResourceRef::Volume { .. } => false,
        }
    }

    fn record(&self, operation: &str) -> Result<()> {
        let mut calls = self.calls.write().map_err(poisoned)?;
        *calls.entry(operation.to_string()).or_insert(0) += 1;
        drop(calls);

        let failures = self.failures.read().map_err(poisoned)?;
        if failures.contains(operation) {
            return Err(DriverError::ActionFailed(format!(
                "injected failure on {} ({})",
                operation, self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn capabilities(&self) -> Result<DriverCapabilities> {
        Ok(DriverCapabilities {
            name: "mock".to_string(),
            version: "1.0.0".to_string(),
            supports_graceful_shutdown: self.graceful_shutdown,
            supports_network_update: true,
            supports_volumes: true,
            supports_link_discovery: true,
        })
    }

    async fn inventory(&self) -> Result<Inventory> {
        self.record("inventory")?;

        let networks = self.networks.read().map_err(poisoned)?;
        let domains = self.domains.read().map_err(poisoned)?;
        let volumes = self.volumes.read().map_err(poisoned)?;
        let links = self.links.read().map_err(poisoned)?;

        Ok(Inventory {
            networks: networks.iter().map(|(k, v)| (k.clone(), v.active)).collect(),
            domains: domains.iter().map(|(k, v)| (k.clone(), v.active)).collect(),
            volumes: volumes
                .iter()
                .map(|(pool, vols)| (pool.clone(), vols.keys().cloned().collect()))
                .collect(),
            links: links.clone(),
        })
    }

    async fn state(&self, resource: &ResourceRef) -> Result<ResourceState> {
        self.record("state")?;

        let state = match resource {
            ResourceRef::Network(name) => {
                let networks = self.networks.read().map_err(poisoned)?;
                networks.get(name).map(|n| n.active)
            }
            ResourceRef::Domain(name) => {
                let mut domains = self.domains.write().map_err(poisoned)?;
                domains.get_mut(name).map(|d| {
                    match d.stopping {
                        Some(0) => {
                            d.active = false;
                            d.stopping = None;
                        }
                        Some(left) => d.stopping = Some(left - 1),
                        None => {}
                    }
                    d.active
                })
            }
            ResourceRef::Volume { pool, name } => {
                let volumes = self.volumes.read().map_err(poisoned)?;
                volumes.get(pool).and_then(|v| v.get(name)).map(|_| false)
            }
        };

        Ok(match state {
            None => ResourceState::Absent,
            Some(false) => ResourceState::Inactive,
            Some(true) => ResourceState::Active,
        })
    }

    #[instrument(skip(self, network), fields(backend = %self.name, network = %network.name))]
    async fn define_network(&self, network: &NetworkDefinition) -> Result<()> {
        self.record("define_network")?;

        let mut networks = self.networks.write().map_err(poisoned)?;
        match networks.get_mut(&network.name) {
            Some(existing) => existing.definition = network.clone(),
            None => {
                networks.insert(network.name.clone(), MockNetwork {
                    definition: network.clone(),
                    uuid: uuid::Uuid::new_v4().to_string(),
                    active: false,
                });
            }
        }

        debug!("Mock network defined");
        Ok(())
    }

    #[instrument(skip(self, network), fields(backend = %self.name, network = %network.name))]
    async fn update_network(&self, network: &NetworkDefinition) -> Result<()> {
        self.record("update_network")?;

        let mut networks = self.networks.write().map_err(poisoned)?;
        let existing = networks
            .get_mut(&network.name)
            .ok_or_else(|| DriverError::NotFound(network.name.clone()))?;
        existing.definition = network.clone();

        debug!("Mock network updated");
        Ok(())
    }

    #[instrument(skip(self, volume), fields(backend = %self.name, volume = %volume.name))]
    async fn create_volume(&self, volume: &VolumeDefinition) -> Result<()> {
        self.record("create_volume")?;

        let mut volumes = self.volumes.write().map_err(poisoned)?;
        let pool = volumes
            .get_mut(&volume.pool)
            .ok_or_else(|| DriverError::NotFound(format!("storage pool {}", volume.pool)))?;

        if pool.contains_key(&volume.name) {
            return Err(DriverError::DefineFailed(format!(
                "volume {} already exists",
                volume.name
            )));
        }
        if let VolumeSource::Backing { base_image } | VolumeSource::Clone { base_image } =
            &volume.source
        {
            if !pool.contains_key(base_image) {
                return Err(DriverError::NotFound(format!("base image {}", base_image)));
            }
        }

        pool.insert(volume.name.clone(), volume.clone());
        debug!("Mock volume created");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.record("delete_volume")?;

        let mut volumes = self.volumes.write().map_err(poisoned)?;
        volumes
            .get_mut(pool)
            .and_then(|p| p.remove(name))
            .ok_or_else(|| DriverError::NotFound(format!("volume {}/{}", pool, name)))?;
        Ok(())
    }

    #[instrument(skip(self, domain), fields(backend = %self.name, domain = %domain.name))]
    async fn define_domain(&self, domain: &DomainDefinition) -> Result<()> {
        self.record("define_domain")?;

        let mut domains = self.domains.write().map_err(poisoned)?;
        let (active, stopping) = domains.get(&domain.name).map_or((false, None), |d| (d.active, d.stopping));
        domains.insert(domain.name.clone(), MockDomain {
            definition: domain.clone(),
            active,
            stopping,
        });

        debug!(interfaces = domain.interfaces.len(), "Mock domain defined");
        Ok(())
    }

    #[instrument(skip(self), fields(backend = %self.name, resource = %resource))]
    async fn apply(&self, resource: &ResourceRef, action: PowerAction) -> Result<()> {
        self.record(action.as_str())?;

        let name = resource.name().to_string();
        match resource {
            ResourceRef::Network(_) => {
                let mut networks = self.networks.write().map_err(poisoned)?;
                let network = networks
                    .get_mut(&name)
                    .ok_or_else(|| DriverError::NotFound(name.clone()))?;
                let remove = transition(&mut network.active, action, &name)?;
                if remove {
                    networks.remove(&name);
                }
            }
            ResourceRef::Domain(_) => {
                let mut domains = self.domains.write().map_err(poisoned)?;
                let domain = domains
                    .get_mut(&name)
                    .ok_or_else(|| DriverError::NotFound(name.clone()))?;
                let remove = transition(&mut domain.active, action, &name)?;
                domain.stopping = None;
                if action == PowerAction::Shutdown && self.shutdown_delay > 0 {
                    domain.active = true;
                    domain.stopping = Some(self.shutdown_delay);
                }
                if remove {
                    domains.remove(&name);
                }
            }
            ResourceRef::Volume { .. } => {
                return Err(DriverError::Unsupported(format!("{} on volumes", action)));
            }
        }

        info!(action = %action, "Mock action applied");
        Ok(())
    }

    async fn exec(&self, domain: &str, command: &str) -> Result<String> {
        self.record("exec")?;
        if !self.is_active(&ResourceRef::domain(domain)) {
            return Err(DriverError::InvalidState(format!("{} is not running", domain)));
        }
        debug!(domain = %domain, command = %command, "Mock exec");
        Ok(String::new())
    }

    async fn discover_links(&self) -> Result<Vec<DiscoveredLink>> {
        Ok(self.links.read().map_err(poisoned)?.clone())
    }
}

/// Apply `action` to an active flag; returns true when the resource is gone.
fn transition(active: &mut bool, action: PowerAction, name: &str) -> Result<bool> {
    match (action, *active) {
        (PowerAction::Create, false) => *active = true,
        (PowerAction::Shutdown | PowerAction::Destroy, true) => *active = false,
        (PowerAction::Undefine, false) => return Ok(true),
        (action, active) => {
            return Err(DriverError::InvalidState(format!(
                "{} on {} resource {}",
                action,
                if active { "active" } else { "inactive" },
                name
            )));
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::from_parts([0x52, 0x54, 0x00], [0x00, 0x01, last])
    }

    fn domain(name: &str) -> DomainDefinition {
        DomainDefinition::new(name, 1, InterfaceAttachment {
            source: InterfaceSource::Bridge("virbr0".to_string()),
            mac_address: mac(0xff),
            model: NicModel::Virtio,
            target_dev: None,
            slot: None,
            ip_address: None,
        })
    }

    #[tokio::test]
    async fn test_domain_lifecycle() {
        let driver = MockDriver::new("hv1");
        let r1 = ResourceRef::domain("r1");

        assert_eq!(driver.state(&r1).await.unwrap(), ResourceState::Absent);

        driver.define_domain(&domain("r1")).await.unwrap();
        assert_eq!(driver.state(&r1).await.unwrap(), ResourceState::Inactive);

        driver.apply(&r1, PowerAction::Create).await.unwrap();
        assert_eq!(driver.state(&r1).await.unwrap(), ResourceState::Active);

        // Undefine is refused while running
        assert!(driver.apply(&r1, PowerAction::Undefine).await.is_err());

        driver.apply(&r1, PowerAction::Destroy).await.unwrap();
        driver.apply(&r1, PowerAction::Undefine).await.unwrap();
        assert_eq!(driver.state(&r1).await.unwrap(), ResourceState::Absent);

        assert_eq!(driver.calls("create"), 1);
        assert_eq!(driver.calls("undefine"), 2);
    }

    #[tokio::test]
    async fn test_slow_shutdown() {
        let driver = MockDriver::new("hv1").with_shutdown_delay(2).with_graceful_shutdown(false);
        let r1 = ResourceRef::domain("r1");
        assert!(!driver.capabilities().await.unwrap().supports_graceful_shutdown);

        driver.define_domain(&domain("r1")).await.unwrap();
        driver.apply(&r1, PowerAction::Create).await.unwrap();
        driver.apply(&r1, PowerAction::Shutdown).await.unwrap();
        assert_eq!(driver.state(&r1).await.unwrap(), ResourceState::Active);
        assert_eq!(driver.state(&r1).await.unwrap(), ResourceState::Active);
        assert_eq!(driver.state(&r1).await.unwrap(), ResourceState::Inactive);

        // Destroy cuts the wait short
        driver.apply(&r1, PowerAction::Create).await.unwrap();
        driver.apply(&r1, PowerAction::Shutdown).await.unwrap();
        driver.apply(&r1, PowerAction::Destroy).await.unwrap();
        assert_eq!(driver.state(&r1).await.unwrap(), ResourceState::Inactive);
    }

    #[tokio::test]
    async fn test_network_redefine_keeps_uuid() {
        let driver = MockDriver::new("hv1");
        let net = NetworkDefinition::new("net-1-2", "vbr-1-2", mac(0x02));

        driver.define_network(&net).await.unwrap();
        let uuid = driver.network_uuid("net-1-2").unwrap();

        driver.update_network(&net.clone().with_delay(Some(20))).await.unwrap();
        assert_eq!(driver.network_uuid("net-1-2").unwrap(), uuid);
        assert_eq!(driver.network("net-1-2").unwrap().delay_ms, Some(20));
    }

    #[tokio::test]
    async fn test_volumes_need_base_image() {
        let driver = MockDriver::new("hv1").with_volume("default", "base.qcow2");
        let mut volume = VolumeDefinition {
            name: "r1.qcow2".to_string(),
            pool: "default".to_string(),
            format: VolumeFormat::Qcow2,
            source: VolumeSource::Clone { base_image: "missing.qcow2".to_string() },
            resize_gib: None,
        };

        assert!(driver.create_volume(&volume).await.is_err());

        volume.source = VolumeSource::Clone { base_image: "base.qcow2".to_string() };
        driver.create_volume(&volume).await.unwrap();
        assert!(driver.volume("default", "r1.qcow2").is_some());

        let inventory = driver.inventory().await.unwrap();
        assert!(inventory.has_volume("default", "r1.qcow2"));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let driver = MockDriver::new("hv1");
        driver.fail_on("define_domain");

        assert!(driver.define_domain(&domain("r1")).await.is_err());
        assert_eq!(driver.calls("define_domain"), 1);
        assert!(driver.domain("r1").is_none());
    }
}
