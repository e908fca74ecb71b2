//! Libvirt driver implementation.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::stream::Stream;
use virt::sys;

use crate::error::{DriverError, Result};
use crate::traits::{Driver, DriverCapabilities};
use crate::types::*;
use crate::xml::{portgroup_xml, DomainXmlBuilder, NetworkXmlBuilder, VolumeXmlBuilder};

/// Libvirt/QEMU driver for one daemon.
pub struct LibvirtDriver {
    name: String,
    uri: String,
    connection: Connect,
}

impl LibvirtDriver {
    /// Connect to the daemon at `uri`.
    ///
    /// Common URIs:
    /// - `qemu:///system` - local system daemon
    /// - `qemu+ssh://user@host/system` - remote via SSH
    pub async fn new(name: &str, uri: &str) -> Result<Self> {
        info!(hypervisor = %name, uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| DriverError::ConnectionFailed(format!("{}: {}", uri, e)))?;

        info!(hypervisor = %name, "Connected to libvirt");

        Ok(Self {
            name: name.to_string(),
            uri: uri.to_string(),
            connection,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn lookup_domain(&self, name: &str) -> Option<Domain> {
        Domain::lookup_by_name(&self.connection, name).ok()
    }

    fn lookup_network(&self, name: &str) -> Option<Network> {
        Network::lookup_by_name(&self.connection, name).ok()
    }

    fn lookup_pool(&self, pool: &str) -> Result<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, pool)
            .map_err(|e| DriverError::NotFound(format!("storage pool {}: {}", pool, e)))
    }

    fn lookup_volume(pool: &StoragePool, name: &str) -> Result<StorageVol> {
        StorageVol::lookup_by_name(pool, name)
            .map_err(|e| DriverError::NotFound(format!("volume {}: {}", name, e)))
    }

    /// On-disk path of a pool volume, or a best-effort guess when the volume
    /// does not exist yet.
    fn volume_path(&self, pool: &str, name: &str) -> String {
        self.lookup_pool(pool)
            .ok()
            .and_then(|p| Self::lookup_volume(&p, name).ok())
            .and_then(|v| v.get_path().ok())
            .unwrap_or_else(|| format!("/var/lib/libvirt/images/{}", name))
    }
}

#[async_trait]
impl Driver for LibvirtDriver {
    #[instrument(skip(self))]
    async fn capabilities(&self) -> Result<DriverCapabilities> {
        let version = self
            .connection
            .get_lib_version()
            .map_err(|e| DriverError::QueryFailed(e.to_string()))?;

        Ok(DriverCapabilities {
            name: "libvirt/QEMU".to_string(),
            version: format!(
                "{}.{}.{}",
                version / 1_000_000,
                (version / 1000) % 1000,
                version % 1000
            ),
            supports_graceful_shutdown: true,
            supports_network_update: true,
            supports_volumes: true,
            supports_link_discovery: false,
        })
    }

    #[instrument(skip(self), fields(hypervisor = %self.name))]
    async fn inventory(&self) -> Result<Inventory> {
        let mut inventory = Inventory::default();

        let domains = self
            .connection
            .list_all_domains(0)
            .map_err(|e| DriverError::QueryFailed(e.to_string()))?;
        for domain in domains {
            let name = domain.get_name().map_err(|e| DriverError::QueryFailed(e.to_string()))?;
            let active = domain.is_active().unwrap_or(false);
            inventory.domains.insert(name, active);
        }

        let networks = self
            .connection
            .list_all_networks(0)
            .map_err(|e| DriverError::QueryFailed(e.to_string()))?;
        for network in networks {
            let name = network.get_name().map_err(|e| DriverError::QueryFailed(e.to_string()))?;
            let active = network.is_active().unwrap_or(false);
            inventory.networks.insert(name, active);
        }

        let pools = self
            .connection
            .list_all_storage_pools(0)
            .map_err(|e| DriverError::QueryFailed(e.to_string()))?;
        let mut volumes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for pool in pools {
            let name = pool.get_name().map_err(|e| DriverError::QueryFailed(e.to_string()))?;
            let names = pool.list_volumes().unwrap_or_default();
            volumes.insert(name, names.into_iter().collect());
        }
        inventory.volumes = volumes;

        debug!(
            domains = inventory.domains.len(),
            networks = inventory.networks.len(),
            "Libvirt inventory"
        );
        Ok(inventory)
    }

    async fn state(&self, resource: &ResourceRef) -> Result<ResourceState> {
        let active = match resource {
            ResourceRef::Domain(name) => match self.lookup_domain(name) {
                Some(domain) => domain.is_active().map_err(|e| DriverError::QueryFailed(e.to_string()))?,
                None => return Ok(ResourceState::Absent),
            },
            ResourceRef::Network(name) => match self.lookup_network(name) {
                Some(network) => network.is_active().map_err(|e| DriverError::QueryFailed(e.to_string()))?,
                None => return Ok(ResourceState::Absent),
            },
            ResourceRef::Volume { pool, name } => {
                let exists = self
                    .lookup_pool(pool)
                    .ok()
                    .map_or(false, |p| Self::lookup_volume(&p, name).is_ok());
                return Ok(if exists { ResourceState::Inactive } else { ResourceState::Absent });
            }
        };

        Ok(if active { ResourceState::Active } else { ResourceState::Inactive })
    }

    #[instrument(skip(self, network), fields(hypervisor = %self.name, network = %network.name))]
    async fn define_network(&self, network: &NetworkDefinition) -> Result<()> {
        let uuid = self
            .lookup_network(&network.name)
            .and_then(|n| n.get_uuid_string().ok());
        let xml = NetworkXmlBuilder::new(network).with_uuid(uuid.as_deref()).build();
        debug!(xml = %xml, "Generated network XML");

        Network::define_xml(&self.connection, &xml)
            .map_err(|e| DriverError::DefineFailed(e.to_string()))?;
        info!("Network defined");
        Ok(())
    }

    #[instrument(skip(self, network), fields(hypervisor = %self.name, network = %network.name))]
    async fn update_network(&self, network: &NetworkDefinition) -> Result<()> {
        self.define_network(network).await?;

        let live = self
            .lookup_network(&network.name)
            .ok_or_else(|| DriverError::NotFound(network.name.clone()))?;
        // Touch the portgroup so the running bridge picks up the new definition
        live.update(
            sys::VIR_NETWORK_UPDATE_COMMAND_MODIFY,
            sys::VIR_NETWORK_SECTION_PORTGROUP,
            -1,
            &portgroup_xml(),
            sys::VIR_NETWORK_UPDATE_AFFECT_LIVE | sys::VIR_NETWORK_UPDATE_AFFECT_CONFIG,
        )
        .map_err(|e| DriverError::ActionFailed(e.to_string()))?;

        info!(delay_ms = ?network.delay_ms, "Network updated");
        Ok(())
    }

    #[instrument(skip(self, volume), fields(hypervisor = %self.name, volume = %volume.name))]
    async fn create_volume(&self, volume: &VolumeDefinition) -> Result<()> {
        let pool = self.lookup_pool(&volume.pool)?;

        let created = match &volume.source {
            VolumeSource::Clone { base_image } => {
                let base = Self::lookup_volume(&pool, base_image)?;
                let xml = VolumeXmlBuilder::new(volume, 0).build();
                info!(base = %base_image, "Cloning volume");
                StorageVol::create_xml_from(&pool, &xml, &base, 0)
                    .map_err(|e| DriverError::DefineFailed(e.to_string()))?
            }
            VolumeSource::Backing { base_image } => {
                let base = Self::lookup_volume(&pool, base_image)?;
                let capacity = base
                    .get_info()
                    .map_err(|e| DriverError::QueryFailed(e.to_string()))?
                    .capacity;
                let xml = VolumeXmlBuilder::new(volume, capacity).build();
                info!(capacity, "Creating volume");
                StorageVol::create_xml(&pool, &xml, 0)
                    .map_err(|e| DriverError::DefineFailed(e.to_string()))?
            }
            VolumeSource::Upload(bytes) => {
                let xml = VolumeXmlBuilder::new(volume, bytes.len() as u64).build();
                let vol = StorageVol::create_xml(&pool, &xml, 0)
                    .map_err(|e| DriverError::DefineFailed(e.to_string()))?;

                info!(size = bytes.len(), "Uploading volume content");
                let stream = Stream::new(&self.connection, 0)
                    .map_err(|e| DriverError::ActionFailed(e.to_string()))?;
                vol.upload(&stream, 0, bytes.len() as u64, 0)
                    .map_err(|e| DriverError::ActionFailed(e.to_string()))?;
                let mut sent = 0;
                while sent < bytes.len() {
                    sent += stream
                        .send(&bytes[sent..])
                        .map_err(|e| DriverError::ActionFailed(e.to_string()))?;
                }
                stream
                    .finish()
                    .map_err(|e| DriverError::ActionFailed(e.to_string()))?;
                vol
            }
        };

        if let Some(gib) = volume.resize_gib {
            created
                .resize(gib * 1024 * 1024 * 1024, 0)
                .map_err(|e| DriverError::ActionFailed(e.to_string()))?;
        }

        info!("Volume created");
        Ok(())
    }

    #[instrument(skip(self), fields(hypervisor = %self.name))]
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        let pool = self.lookup_pool(pool)?;
        let volume = Self::lookup_volume(&pool, name)?;
        volume
            .delete(0)
            .map_err(|e| DriverError::ActionFailed(e.to_string()))?;
        info!(volume = %name, "Volume deleted");
        Ok(())
    }

    #[instrument(skip(self, domain), fields(hypervisor = %self.name, domain = %domain.name))]
    async fn define_domain(&self, domain: &DomainDefinition) -> Result<()> {
        let xml = DomainXmlBuilder::new(domain, |pool, vol| self.volume_path(pool, vol)).build();
        debug!(xml = %xml, "Generated domain XML");

        Domain::define_xml(&self.connection, &xml)
            .map_err(|e| DriverError::DefineFailed(e.to_string()))?;
        info!("Domain defined");
        Ok(())
    }

    #[instrument(skip(self), fields(hypervisor = %self.name, resource = %resource))]
    async fn apply(&self, resource: &ResourceRef, action: PowerAction) -> Result<()> {
        let failed = |e: virt::error::Error| DriverError::ActionFailed(format!("{} {}: {}", action, resource, e));

        match resource {
            ResourceRef::Domain(name) => {
                let domain = self
                    .lookup_domain(name)
                    .ok_or_else(|| DriverError::NotFound(name.clone()))?;
                match action {
                    PowerAction::Create => domain.create().map(|_| ()).map_err(failed)?,
                    PowerAction::Shutdown => domain.shutdown().map(|_| ()).map_err(failed)?,
                    PowerAction::Destroy => domain.destroy().map_err(failed)?,
                    PowerAction::Undefine => domain
                        .undefine_flags(sys::VIR_DOMAIN_UNDEFINE_NVRAM)
                        .map_err(failed)?,
                }
            }
            ResourceRef::Network(name) => {
                let network = self
                    .lookup_network(name)
                    .ok_or_else(|| DriverError::NotFound(name.clone()))?;
                match action {
                    PowerAction::Create => network.create().map(|_| ()).map_err(failed)?,
                    PowerAction::Shutdown | PowerAction::Destroy => network.destroy().map_err(failed)?,
                    PowerAction::Undefine => network.undefine().map_err(failed)?,
                }
            }
            ResourceRef::Volume { .. } => {
                return Err(DriverError::Unsupported(format!("{} on volumes", action)));
            }
        }

        info!(action = %action, "Action applied");
        Ok(())
    }
}
