//! Backend driver wiring.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use topolab_orchestrator::{BackendKind, Connector, Hypervisor};
use topolab_virt::{ContainerDriver, Driver, DriverError, SimulationDriver};

/// Opens real drivers for a hypervisor: libvirt for VMs (when built with
/// the `libvirt` feature), the docker CLI for containers and the
/// simulator CLI for simulations.
pub struct NodeConnector {
    simulation_dir: PathBuf,
    simulation_command: String,
}

impl NodeConnector {
    pub fn new(simulation_dir: impl Into<PathBuf>, simulation_command: impl Into<String>) -> Self {
        Self { simulation_dir: simulation_dir.into(), simulation_command: simulation_command.into() }
    }

    #[cfg(feature = "libvirt")]
    async fn libvirt(&self, hypervisor: &Hypervisor) -> Result<Arc<dyn Driver>, DriverError> {
        let driver = topolab_virt::LibvirtDriver::new(&hypervisor.name, &hypervisor.uri).await?;
        Ok(Arc::new(driver))
    }

    #[cfg(not(feature = "libvirt"))]
    async fn libvirt(&self, hypervisor: &Hypervisor) -> Result<Arc<dyn Driver>, DriverError> {
        Err(DriverError::Unsupported(format!(
            "{}: built without libvirt support (enable the libvirt feature)",
            hypervisor.name
        )))
    }
}

#[async_trait]
impl Connector for NodeConnector {
    async fn connect(&self, hypervisor: &Hypervisor, kind: BackendKind) -> Result<Arc<dyn Driver>, DriverError> {
        info!(hypervisor = %hypervisor.name, backend = %kind, "Opening backend connection");
        match kind {
            BackendKind::Libvirt => self.libvirt(hypervisor).await,
            BackendKind::Container => {
                let driver = ContainerDriver::new(hypervisor.name.clone(), hypervisor.host.clone());
                driver.connect().await?;
                Ok(Arc::new(driver))
            }
            BackendKind::Simulation => {
                let host = hypervisor.host.clone().unwrap_or_else(|| "localhost".to_string());
                let username = hypervisor.username.clone().unwrap_or_else(|| "root".to_string());
                let driver = SimulationDriver::new(hypervisor.name.clone(), host, username)
                    .with_work_dir(self.simulation_dir.join(&hypervisor.name))
                    .with_command(self.simulation_command.clone());
                Ok(Arc::new(driver))
            }
        }
    }
}
