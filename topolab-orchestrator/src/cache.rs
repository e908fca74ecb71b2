//! Backend connection cache.
//!
//! One cache is built per orchestration run. The first request for a
//! (hypervisor, backend kind) pair connects, takes an inventory snapshot
//! and memoizes both; a failed connect is memoized too so a dead backend
//! is tried once per run, not once per device.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use topolab_virt::{Driver, DriverCapabilities, DriverError, Inventory, MockDriver};

use crate::error::{OrchestratorError, Result};
use crate::model::{Hypervisor, Lab};

/// The kind of compute backend a device profile runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    Libvirt,
    Container,
    Simulation,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Libvirt => "libvirt",
            BackendKind::Container => "container",
            BackendKind::Simulation => "simulation",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens driver connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        hypervisor: &Hypervisor,
        kind: BackendKind,
    ) -> std::result::Result<Arc<dyn Driver>, DriverError>;
}

/// A live backend connection with the snapshot taken when it opened.
pub struct Connection {
    pub hypervisor: String,
    pub kind: BackendKind,
    pub driver: Arc<dyn Driver>,
    pub capabilities: DriverCapabilities,
    /// Advisory only: never used for action-allowed decisions
    pub inventory: Inventory,
}

type Entry = std::result::Result<Arc<Connection>, String>;

/// Per-run cache of backend connections.
pub struct BackendCache {
    connector: Arc<dyn Connector>,
    hypervisors: BTreeMap<String, Hypervisor>,
    entries: AsyncMutex<HashMap<(String, BackendKind), Entry>>,
}

impl BackendCache {
    pub fn new(connector: Arc<dyn Connector>, lab: &Lab) -> Self {
        Self {
            connector,
            hypervisors: lab
                .hypervisors
                .iter()
                .map(|h| (h.name.clone(), h.clone()))
                .collect(),
            entries: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Connection to a hypervisor's backend of the given kind.
    pub async fn connection(&self, hypervisor: &str, kind: BackendKind) -> Result<Arc<Connection>> {
        let key = (hypervisor.to_string(), kind);
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(&key) {
            return entry.clone().map_err(|message| OrchestratorError::BackendUnreachable {
                hypervisor: hypervisor.to_string(),
                message,
            });
        }

        let config = self
            .hypervisors
            .get(hypervisor)
            .ok_or_else(|| OrchestratorError::UnknownHypervisor(hypervisor.to_string()))?;

        let entry = match self.open(config, kind).await {
            Ok(connection) => {
                info!(
                    hypervisor = %hypervisor,
                    backend = %kind,
                    domains = connection.inventory.domains.len(),
                    networks = connection.inventory.networks.len(),
                    "Connected to backend"
                );
                Ok(Arc::new(connection))
            }
            Err(e) => {
                warn!(hypervisor = %hypervisor, backend = %kind, error = %e, "Backend unreachable");
                Err(e.to_string())
            }
        };
        entries.insert(key, entry.clone());

        entry.map_err(|message| OrchestratorError::BackendUnreachable {
            hypervisor: hypervisor.to_string(),
            message,
        })
    }

    async fn open(&self, hypervisor: &Hypervisor, kind: BackendKind) -> std::result::Result<Connection, DriverError> {
        let driver = self.connector.connect(hypervisor, kind).await?;
        let capabilities = driver.capabilities().await?;
        let inventory = driver.inventory().await?;
        Ok(Connection {
            hypervisor: hypervisor.name.clone(),
            kind,
            driver,
            capabilities,
            inventory,
        })
    }
}

// =============================================================================
// MOCK CONNECTOR
// =============================================================================

/// Connector handing out [`MockDriver`]s, one per (hypervisor, kind).
///
/// Used by tests and by the node's development mode.
#[derive(Default)]
pub struct MockConnector {
    drivers: Mutex<HashMap<(String, BackendKind), Arc<MockDriver>>>,
    unreachable: Mutex<Vec<String>>,
    connects: Mutex<usize>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a prepared driver.
    pub fn insert(&self, hypervisor: &str, kind: BackendKind, driver: MockDriver) -> Arc<MockDriver> {
        let driver = Arc::new(driver);
        if let Ok(mut drivers) = self.drivers.lock() {
            drivers.insert((hypervisor.to_string(), kind), driver.clone());
        }
        driver
    }

    /// Driver for a pair, created on first use.
    pub fn driver(&self, hypervisor: &str, kind: BackendKind) -> Arc<MockDriver> {
        match self.drivers.lock() {
            Ok(mut drivers) => drivers
                .entry((hypervisor.to_string(), kind))
                .or_insert_with(|| Arc::new(MockDriver::new(format!("{}-{}", hypervisor, kind))))
                .clone(),
            Err(_) => Arc::new(MockDriver::new(hypervisor)),
        }
    }

    /// Make every connect to `hypervisor` fail.
    pub fn set_unreachable(&self, hypervisor: &str) {
        if let Ok(mut unreachable) = self.unreachable.lock() {
            unreachable.push(hypervisor.to_string());
        }
    }

    /// Number of connect attempts.
    pub fn connects(&self) -> usize {
        self.connects.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        hypervisor: &Hypervisor,
        kind: BackendKind,
    ) -> std::result::Result<Arc<dyn Driver>, DriverError> {
        if let Ok(mut connects) = self.connects.lock() {
            *connects += 1;
        }
        let unreachable = self
            .unreachable
            .lock()
            .map(|u| u.contains(&hypervisor.name))
            .unwrap_or(false);
        if unreachable {
            return Err(DriverError::ConnectionFailed(format!("{} is unreachable", hypervisor.name)));
        }
        let driver: Arc<dyn Driver> = self.driver(&hypervisor.name, kind);
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab() -> Lab {
        Lab {
            hypervisors: vec![
                Hypervisor { name: "hv1".to_string(), ..Default::default() },
                Hypervisor { name: "hv2".to_string(), ..Default::default() },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connection_is_memoized() {
        let connector = Arc::new(MockConnector::new());
        let cache = BackendCache::new(connector.clone(), &lab());

        cache.connection("hv1", BackendKind::Libvirt).await.unwrap();
        cache.connection("hv1", BackendKind::Libvirt).await.unwrap();
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.driver("hv1", BackendKind::Libvirt).calls("inventory"), 1);

        cache.connection("hv1", BackendKind::Container).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_is_memoized_per_backend() {
        let connector = Arc::new(MockConnector::new());
        connector.set_unreachable("hv2");
        let cache = BackendCache::new(connector.clone(), &lab());

        for _ in 0..3 {
            let err = cache.connection("hv2", BackendKind::Libvirt).await.err().unwrap();
            assert!(matches!(err, OrchestratorError::BackendUnreachable { .. }));
        }
        assert_eq!(connector.connects(), 1);

        assert!(cache.connection("hv1", BackendKind::Libvirt).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_hypervisor() {
        let cache = BackendCache::new(Arc::new(MockConnector::new()), &lab());
        assert!(matches!(
            cache.connection("nope", BackendKind::Libvirt).await,
            Err(OrchestratorError::UnknownHypervisor(_))
        ));
    }
}
