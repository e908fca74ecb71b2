//! Backend-neutral resource definitions, inventory and link discovery types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

// =============================================================================
// ADDRESSING
// =============================================================================

/// A 48-bit MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build an address from a three octet prefix and three suffix octets.
    pub fn from_parts(prefix: [u8; 3], suffix: [u8; 3]) -> Self {
        Self([prefix[0], prefix[1], prefix[2], suffix[0], suffix[1], suffix[2]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| DriverError::Internal(format!("Invalid MAC address: {}", s)))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| DriverError::Internal(format!("Invalid MAC address: {}", s)))?;
        }
        if parts.next().is_some() {
            return Err(DriverError::Internal(format!("Invalid MAC address: {}", s)));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// RESOURCE REFERENCES
// =============================================================================

/// The three resource kinds a backend manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Network,
    Volume,
    Domain,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Domain => write!(f, "domain"),
        }
    }
}

/// Identifies one resource on a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceRef {
    Network(String),
    Domain(String),
    Volume { pool: String, name: String },
}

impl ResourceRef {
    pub fn network(name: impl Into<String>) -> Self {
        Self::Network(name.into())
    }

    pub fn domain(name: impl Into<String>) -> Self {
        Self::Domain(name.into())
    }

    pub fn volume(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Volume { pool: pool.into(), name: name.into() }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceRef::Network(_) => ResourceKind::Network,
            ResourceRef::Domain(_) => ResourceKind::Domain,
            ResourceRef::Volume { .. } => ResourceKind::Volume,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ResourceRef::Network(name) | ResourceRef::Domain(name) => name,
            ResourceRef::Volume { name, .. } => name,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Volume { pool, name } => write!(f, "volume {}/{}", pool, name),
            other => write!(f, "{} {}", other.kind(), other.name()),
        }
    }
}

/// Observed state of a resource. Volumes are never `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Absent,
    Inactive,
    Active,
}

impl ResourceState {
    pub fn exists(&self) -> bool {
        !matches!(self, ResourceState::Absent)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ResourceState::Active)
    }
}

/// Power transitions applied to an existing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    /// Start / power on.
    Create,
    /// Graceful stop.
    Shutdown,
    /// Forced stop.
    Destroy,
    /// Remove the definition.
    Undefine,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Create => "create",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Destroy => "destroy",
            PowerAction::Undefine => "undefine",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// NETWORKS
// =============================================================================

/// A host virtual network backed by a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// Backend network name (`net-<id>`)
    pub name: String,
    /// Host bridge name (`vbr-<id>`)
    pub bridge: String,
    /// MAC address of the bridge
    pub mac_address: MacAddress,
    /// No forwarding between ports (null interfaces)
    pub isolated: bool,
    /// Propagation delay in milliseconds
    pub delay_ms: Option<u32>,
    /// IPv4 subnet in CIDR notation (container networks only)
    pub subnet: Option<String>,
}

impl NetworkDefinition {
    pub fn new(name: impl Into<String>, bridge: impl Into<String>, mac_address: MacAddress) -> Self {
        Self {
            name: name.into(),
            bridge: bridge.into(),
            mac_address,
            isolated: false,
            delay_ms: None,
            subnet: None,
        }
    }

    pub fn with_isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    pub fn with_delay(mut self, delay_ms: Option<u32>) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = Some(subnet.into());
        self
    }
}

// =============================================================================
// VOLUMES
// =============================================================================

/// On-disk format of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    Qcow2,
    Raw,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Raw => "raw",
        }
    }
}

/// Where the content of a new volume comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    /// Empty volume sized like the base image; the domain layers it over the
    /// base image as a copy-on-write backing store.
    Backing { base_image: String },
    /// Full copy of the base image.
    Clone { base_image: String },
    /// Raw bytes uploaded into a new volume of exactly that size.
    Upload(Vec<u8>),
}

/// A storage volume to create in a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDefinition {
    pub name: String,
    pub pool: String,
    pub format: VolumeFormat,
    pub source: VolumeSource,
    /// Resize to this many GiB after creation
    pub resize_gib: Option<u64>,
}

// =============================================================================
// DOMAINS
// =============================================================================

/// NIC model presented to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    Virtio,
    E1000,
}

impl NicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
        }
    }
}

/// What an interface is plugged into on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceSource {
    /// Backend-managed virtual network, by network name.
    Network(String),
    /// Pre-existing host bridge, by bridge name.
    Bridge(String),
    /// Point-to-point UDP socket pair to another guest NIC.
    Udp {
        address: String,
        local_port: u16,
        remote_port: u16,
    },
}

impl InterfaceSource {
    pub fn name(&self) -> &str {
        match self {
            InterfaceSource::Network(name) | InterfaceSource::Bridge(name) => name,
            InterfaceSource::Udp { address, .. } => address,
        }
    }
}

/// One guest NIC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAttachment {
    pub source: InterfaceSource,
    pub mac_address: MacAddress,
    pub model: NicModel,
    /// Host-side tap device name
    pub target_dev: Option<String>,
    /// Device interface id, `None` for management interfaces
    pub slot: Option<u32>,
    /// Static address (container backends)
    pub ip_address: Option<String>,
}

/// Guest-visible device type of a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    Disk,
    Cdrom,
}

impl DiskDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskDevice::Disk => "disk",
            DiskDevice::Cdrom => "cdrom",
        }
    }
}

/// A pool volume attached to a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachment {
    pub pool: String,
    pub volume: String,
    pub device: DiskDevice,
    pub format: VolumeFormat,
    /// Guest target device (`vda`, `hdc`, `sdb`)
    pub target: String,
    /// Bus (`virtio`, `sata`, `usb`)
    pub bus: String,
    /// Base image volume used as copy-on-write backing store
    pub backing_store: Option<String>,
}

/// Container-only settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOptions {
    pub environment: Vec<String>,
    pub capabilities: Vec<String>,
    pub devices: Vec<String>,
    pub command: Option<String>,
    pub privileged: bool,
    /// Management network subnet (CIDR) for the container engine
    pub management_subnet: Option<String>,
    /// Bind-mount of the day-0 file: (host path, container path)
    pub config_mount: Option<(String, String)>,
    /// Commands run inside the container after it starts
    pub post_start: Vec<String>,
}

/// Remote simulation settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationOptions {
    /// Interface name prefix, data interfaces are `<prefix>/<id>`
    pub interface_prefix: String,
    /// Management interface name inside the simulation
    pub management_interface: String,
    /// Rendered per-device simulator configuration (JSON object)
    pub device_config: Option<String>,
}

/// Everything a backend needs to define a domain or container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDefinition {
    pub name: String,
    /// Small integer device id, unique within a topology
    pub device_id: u32,
    /// Platform template (libvirt machine profile, container image, simulation platform)
    pub template: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disks: Vec<DiskAttachment>,
    pub management: InterfaceAttachment,
    /// Additional out-of-band interfaces, attached after management
    pub extra_management: Vec<InterfaceAttachment>,
    /// Data interfaces in slot order
    pub interfaces: Vec<InterfaceAttachment>,
    pub container: Option<ContainerOptions>,
    pub simulation: Option<SimulationOptions>,
}

impl DomainDefinition {
    pub fn new(name: impl Into<String>, device_id: u32, management: InterfaceAttachment) -> Self {
        Self {
            name: name.into(),
            device_id,
            template: String::new(),
            vcpus: 1,
            memory_mib: 1024,
            disks: Vec::new(),
            management,
            extra_management: Vec::new(),
            interfaces: Vec::new(),
            container: None,
            simulation: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn with_resources(mut self, vcpus: u32, memory_mib: u64) -> Self {
        self.vcpus = vcpus;
        self.memory_mib = memory_mib;
        self
    }

    pub fn with_disk(mut self, disk: DiskAttachment) -> Self {
        self.disks.push(disk);
        self
    }

    pub fn with_interface(mut self, interface: InterfaceAttachment) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Every attachment in guest order: management, extra management, data.
    pub fn all_interfaces(&self) -> impl Iterator<Item = &InterfaceAttachment> {
        std::iter::once(&self.management)
            .chain(self.extra_management.iter())
            .chain(self.interfaces.iter())
    }
}

// =============================================================================
// INVENTORY
// =============================================================================

/// Snapshot of what exists on a backend, taken once per connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    /// Network name -> active
    pub networks: BTreeMap<String, bool>,
    /// Domain or container name -> active
    pub domains: BTreeMap<String, bool>,
    /// Pool name -> volume names
    pub volumes: BTreeMap<String, BTreeSet<String>>,
    /// Container links found by inspecting network namespaces
    pub links: Vec<DiscoveredLink>,
}

impl Inventory {
    pub fn has_network(&self, name: &str) -> bool {
        self.networks.contains_key(name)
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.domains.contains_key(name)
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        self.volumes.contains_key(pool)
    }

    pub fn has_volume(&self, pool: &str, name: &str) -> bool {
        self.volumes.get(pool).map_or(false, |v| v.contains(name))
    }
}

/// How two discovered interfaces are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    /// veth pair between two containers
    CrossConnect,
    /// veth between a container and a VM tap on the host
    Tap,
}

/// One end of a discovered link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEndpoint {
    /// Container name, or `None` for the host namespace
    pub container: Option<String>,
    pub interface: String,
}

/// A point-to-point link found in kernel link state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub kind: LinkKind,
    pub a_end: LinkEndpoint,
    pub z_end: LinkEndpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display_and_parse() {
        let mac = MacAddress::from_parts([0x52, 0x54, 0x00], [0x01, 0x05, 0xff]);
        assert_eq!(mac.to_string(), "52:54:00:01:05:ff");
        assert_eq!("52:54:00:01:05:ff".parse::<MacAddress>().unwrap(), mac);
        assert!("52:54:00:01:05".parse::<MacAddress>().is_err());
        assert!("52:54:00:01:05:ff:00".parse::<MacAddress>().is_err());
        assert!("52:54:zz:01:05:ff".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_inventory_lookup() {
        let mut inventory = Inventory::default();
        inventory.networks.insert("net-1-2".to_string(), true);
        inventory.volumes.entry("default".to_string()).or_default().insert("r1.qcow2".to_string());

        assert!(inventory.has_network("net-1-2"));
        assert!(!inventory.has_domain("r1"));
        assert!(inventory.has_pool("default"));
        assert!(inventory.has_volume("default", "r1.qcow2"));
        assert!(!inventory.has_volume("images", "r1.qcow2"));
    }
}
