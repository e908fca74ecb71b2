//! Backend driver capability contract.

use async_trait::async_trait;

use crate::error::{DriverError, Result};
use crate::types::*;

/// Capabilities supported by a driver.
#[derive(Debug, Clone)]
pub struct DriverCapabilities {
    /// Name of the driver (e.g., "libvirt", "docker", "mock")
    pub name: String,
    /// Version string
    pub version: String,
    /// Graceful shutdown completes asynchronously and can be polled
    pub supports_graceful_shutdown: bool,
    /// Networks can be redefined in place
    pub supports_network_update: bool,
    /// Storage volumes are managed by the backend
    pub supports_volumes: bool,
    /// Network namespace interfaces can be enumerated
    pub supports_link_discovery: bool,
}

/// Core backend driver trait.
///
/// A driver talks to one compute endpoint (a libvirt daemon, a container
/// engine, a simulation host). Every call is a single backend round trip;
/// sequencing and idempotency live in the orchestrator, which always asks
/// [`Driver::state`] before acting.
#[async_trait]
pub trait Driver: Send + Sync {
    // =========================================================================
    // Capabilities & Inventory
    // =========================================================================

    /// Get driver capabilities.
    async fn capabilities(&self) -> Result<DriverCapabilities>;

    /// Snapshot existing networks, domains and volumes.
    async fn inventory(&self) -> Result<Inventory>;

    /// Query the live state of one resource.
    async fn state(&self, resource: &ResourceRef) -> Result<ResourceState>;

    // =========================================================================
    // Networks
    // =========================================================================

    /// Define (or redefine) a virtual network without starting it.
    async fn define_network(&self, network: &NetworkDefinition) -> Result<()>;

    /// Redefine an existing network in place, applying mutable attributes
    /// such as the propagation delay to the running bridge.
    async fn update_network(&self, network: &NetworkDefinition) -> Result<()>;

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Create a volume in a storage pool.
    async fn create_volume(&self, volume: &VolumeDefinition) -> Result<()>;

    /// Delete a volume from a storage pool.
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;

    // =========================================================================
    // Domains
    // =========================================================================

    /// Define a domain (or container) without powering it on.
    async fn define_domain(&self, domain: &DomainDefinition) -> Result<()>;

    /// Apply a power transition to a network or domain.
    async fn apply(&self, resource: &ResourceRef, action: PowerAction) -> Result<()>;

    /// Host-side interfaces created for a running domain, as (slot, host device).
    async fn host_interfaces(&self, _domain: &str) -> Result<Vec<(u32, String)>> {
        Ok(Vec::new())
    }

    /// Run a shell command inside a running container.
    async fn exec(&self, domain: &str, _command: &str) -> Result<String> {
        Err(DriverError::Unsupported(format!("exec in {}", domain)))
    }

    // =========================================================================
    // Link discovery
    // =========================================================================

    /// Enumerate point-to-point links between containers, and between
    /// containers and VM taps. Only container engines implement this.
    async fn discover_links(&self) -> Result<Vec<DiscoveredLink>> {
        Ok(Vec::new())
    }
}
