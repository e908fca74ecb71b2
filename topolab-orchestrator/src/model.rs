//! Lab data model: hypervisors, device definitions and topologies.
//!
//! The whole lab is one serde document. Configuration (devices, links,
//! networks, hypervisors) and operational state (statuses, interface
//! write-backs, state events) live side by side, the same way the
//! configuration store presents them.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use topolab_virt::MacAddress;

use crate::error::{OrchestratorError, Result};

// =============================================================================
// LAB
// =============================================================================

/// Everything the orchestrator reads from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Lab {
    /// Hypervisor used by topologies that do not name one
    pub default_hypervisor: Option<String>,
    pub hypervisors: Vec<Hypervisor>,
    pub device_definitions: Vec<DeviceDefinition>,
    pub authgroups: Vec<AuthGroup>,
    pub topologies: Vec<Topology>,
}

impl Lab {
    /// Parse a lab document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| OrchestratorError::Configuration(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| OrchestratorError::Store(e.to_string()))
    }

    pub fn topology(&self, name: &str) -> Result<&Topology> {
        self.topologies
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| OrchestratorError::UnknownTopology(name.to_string()))
    }

    pub fn topology_mut(&mut self, name: &str) -> Result<&mut Topology> {
        self.topologies
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| OrchestratorError::UnknownTopology(name.to_string()))
    }

    pub fn hypervisor(&self, name: &str) -> Result<&Hypervisor> {
        self.hypervisors
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| OrchestratorError::UnknownHypervisor(name.to_string()))
    }

    pub fn definition(&self, name: &str) -> Result<&DeviceDefinition> {
        self.device_definitions
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| OrchestratorError::UnknownDefinition(name.to_string()))
    }

    pub fn authgroup(&self, name: &str) -> Option<&AuthGroup> {
        self.authgroups.iter().find(|a| a.name == name)
    }

    /// Hypervisor a topology is assigned to.
    pub fn topology_hypervisor(&self, topology: &Topology) -> Result<&Hypervisor> {
        let name = topology
            .hypervisor
            .as_deref()
            .or(self.default_hypervisor.as_deref())
            .ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "No hypervisor defined for topology {}",
                    topology.name
                ))
            })?;
        self.hypervisor(name)
    }
}

// =============================================================================
// HYPERVISORS
// =============================================================================

/// A named compute endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Hypervisor {
    pub name: String,
    /// libvirt connection URI
    pub uri: String,
    /// Host reached over ssh by the container engine and the simulator
    pub host: Option<String>,
    pub username: Option<String>,
    /// Bridge used for link ends that cross to another hypervisor
    pub external_bridge: Option<String>,
    /// Wire same-host VM links as UDP socket pairs on this address
    pub udp_tunnel_address: Option<Ipv4Addr>,
    pub management_network: ManagementNetwork,
    /// First three octets of every generated MAC address
    pub mac_address_start: String,
    /// Directory backing the default storage pool
    pub images_dir: String,
}

impl Default for Hypervisor {
    fn default() -> Self {
        Self {
            name: String::new(),
            uri: "qemu:///system".to_string(),
            host: None,
            username: None,
            external_bridge: None,
            udp_tunnel_address: None,
            management_network: ManagementNetwork::default(),
            mac_address_start: "52:54:00".to_string(),
            images_dir: "/var/lib/libvirt/images".to_string(),
        }
    }
}

/// Management network of a hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ManagementNetwork {
    pub bridge: String,
    /// Device `n` gets `ip-address-start + n`
    pub ip_address_start: Option<Ipv4Addr>,
    pub prefix_length: u8,
    pub gateway_address: Option<String>,
    pub dns_server_address: Option<String>,
}

impl Default for ManagementNetwork {
    fn default() -> Self {
        Self {
            bridge: "virbr0".to_string(),
            ip_address_start: None,
            prefix_length: 24,
            gateway_address: None,
            dns_server_address: None,
        }
    }
}

// =============================================================================
// DEVICE DEFINITIONS
// =============================================================================

/// How the main disk relates to the base image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BaseImageType {
    /// Copy-on-write overlay referencing the base image
    #[default]
    BackingStore,
    /// Full copy of the base image
    Clone,
}

/// Template and sizing shared by devices of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeviceDefinition {
    pub name: String,
    /// Device type tag selecting the profile (`IOSv`, `XRd`, ...)
    pub device_type: String,
    /// Machine profile, container image or simulation platform
    pub template: String,
    pub vcpus: u32,
    /// Memory in MiB
    pub memory: u64,
    pub storage_pool: String,
    pub base_image: Option<String>,
    pub base_image_type: BaseImageType,
    /// Resize the main disk to this many GiB
    pub disk_size: Option<u64>,
    pub day0_file: Option<String>,
    /// File embedded base64-encoded in the day-0 variables
    pub day0_upload_file: Option<String>,
    /// Onboard devices into the management plane
    pub managed: bool,
    pub authgroup: Option<String>,
    /// Seconds without reachability and console output before a reboot
    pub console_timeout: u64,
}

impl Default for DeviceDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            device_type: String::new(),
            template: String::new(),
            vcpus: 1,
            memory: 1024,
            storage_pool: "default".to_string(),
            base_image: None,
            base_image_type: BaseImageType::default(),
            disk_size: None,
            day0_file: None,
            day0_upload_file: None,
            managed: true,
            authgroup: None,
            console_timeout: 600,
        }
    }
}

/// Credentials rendered into day-0 configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthGroup {
    pub name: String,
    pub username: String,
    pub password: String,
}

// =============================================================================
// STATUS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisioningStatus {
    #[default]
    Undefined,
    Defined,
    Started,
    Ready,
    SyncError,
    Unmanaged,
}

impl ProvisioningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningStatus::Undefined => "undefined",
            ProvisioningStatus::Defined => "defined",
            ProvisioningStatus::Started => "started",
            ProvisioningStatus::Ready => "ready",
            ProvisioningStatus::SyncError => "sync-error",
            ProvisioningStatus::Unmanaged => "unmanaged",
        }
    }
}

impl std::fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationalStatus {
    Reachable,
    #[default]
    NotReachable,
}

// =============================================================================
// TOPOLOGY
// =============================================================================

/// A named graph of devices, links and networks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Topology {
    pub name: String,
    pub hypervisor: Option<String>,
    pub provisioning_status: ProvisioningStatus,
    pub devices: Vec<Device>,
    pub links: Vec<Link>,
    pub networks: Vec<Network>,
    pub state_events: Vec<StateEvent>,
}

impl Topology {
    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn device_mut(&mut self, name: &str) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.name == name)
    }

    pub fn link(&self, id: &LinkId) -> Option<&Link> {
        self.links.iter().find(|l| id.matches(l))
    }

    pub fn link_mut(&mut self, id: &LinkId) -> Option<&mut Link> {
        self.links.iter_mut().find(|l| id.matches(l))
    }

    pub fn network_mut(&mut self, name: &str) -> Option<&mut Network> {
        self.networks.iter_mut().find(|n| n.name == name)
    }
}

/// Console activity observed by the watchdog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ConsoleActivity {
    pub last_activity: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
}

/// One emulated device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Device {
    /// Small positive integer, unique within the topology
    pub id: u32,
    pub name: String,
    pub definition: String,
    /// Overrides the topology hypervisor
    pub hypervisor: Option<String>,
    /// Control-plane peer of a split control/data-plane pair
    pub control_plane_id: Option<u32>,
    pub management_interface: InterfaceRecord,
    pub provisioning_status: ProvisioningStatus,
    pub operational_status: OperationalStatus,
    pub console: ConsoleActivity,
}

/// Configured id plus the values written back when an interface is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InterfaceRecord {
    pub id: Option<u32>,
    pub host_interface: Option<String>,
    pub mac_address: Option<MacAddress>,
    pub ip_address: Option<String>,
}

impl InterfaceRecord {
    pub fn with_id(id: u32) -> Self {
        Self { id: Some(id), ..Default::default() }
    }
}

/// Point-to-point connection between two device interfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Link {
    pub a_end_device: String,
    pub z_end_device: String,
    /// Interface id defaults to the z-end device id
    pub a_end_interface: InterfaceRecord,
    /// Interface id defaults to the a-end device id
    pub z_end_interface: InterfaceRecord,
    /// Bridge override for an a-end on another hypervisor
    pub a_end_bridge: Option<String>,
    pub z_end_bridge: Option<String>,
    /// Propagation delay in milliseconds
    pub delay: Option<u32>,
    pub host_bridge: Option<String>,
    pub mac_address: Option<MacAddress>,
}

impl Link {
    pub fn new(a_end: impl Into<String>, z_end: impl Into<String>) -> Self {
        Self {
            a_end_device: a_end.into(),
            z_end_device: z_end.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> LinkId {
        LinkId::new(&self.a_end_device, &self.z_end_device)
    }
}

/// Identifies a link by its end devices, in either order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkId {
    pub a_end: String,
    pub z_end: String,
}

impl LinkId {
    pub fn new(a_end: impl Into<String>, z_end: impl Into<String>) -> Self {
        Self { a_end: a_end.into(), z_end: z_end.into() }
    }

    pub fn matches(&self, link: &Link) -> bool {
        (link.a_end_device == self.a_end && link.z_end_device == self.z_end)
            || (link.a_end_device == self.z_end && link.z_end_device == self.a_end)
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.a_end, self.z_end)
    }
}

/// A group of device interfaces sharing one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Network {
    pub name: String,
    /// Attach members to this host bridge instead of a managed network
    pub external_bridge: Option<String>,
    /// First three octets of the data subnet, e.g. `10.0.5`
    pub ipv4_subnet_start: Option<String>,
    /// Interface id for members that do not set one
    pub interface_id: Option<u32>,
    pub devices: Vec<NetworkMember>,
    pub host_bridge: Option<String>,
    pub mac_address: Option<MacAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NetworkMember {
    pub name: String,
    pub interface: InterfaceRecord,
}

// =============================================================================
// STATE EVENTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Online,
    Offline,
    Warn,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Online => "online",
            EventKind::Offline => "offline",
            EventKind::Warn => "warn",
        }
    }
}

/// Reachability transition of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StateEvent {
    pub timestamp: DateTime<Utc>,
    pub device: String,
    pub kind: EventKind,
    /// Lost packets per failed probe
    #[serde(default)]
    pub detail: Vec<u32>,
}
