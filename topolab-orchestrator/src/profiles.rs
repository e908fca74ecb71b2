//! Device profiles.
//!
//! Everything that differs between device types lives in one table built
//! at startup. A profile selects the backend, the NIC models, how data
//! interfaces are numbered and padded, the day-0 artifact and where it is
//! attached, and any out-of-band networks the device needs. Unknown device
//! types fall back to [`DeviceProfile::default`].

use std::collections::HashMap;

use topolab_virt::{DiskDevice, NicModel};

use crate::cache::BackendKind;

/// Where the day-0 volume is attached to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Day0Attachment {
    Disk,
    Cdrom,
    Usb,
}

impl Day0Attachment {
    /// (device type, guest target, bus)
    pub fn placement(&self) -> (DiskDevice, &'static str, &'static str) {
        match self {
            Day0Attachment::Disk => (DiskDevice::Disk, "vdb", "virtio"),
            Day0Attachment::Cdrom => (DiskDevice::Cdrom, "hdc", "sata"),
            Day0Attachment::Usb => (DiskDevice::Disk, "sdb", "usb"),
        }
    }
}

/// How the rendered day-0 configuration is packaged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Day0Format {
    /// Rendered text as-is
    Text,
    /// Single file on a FAT disk
    Fat { file_name: &'static str, partition_table: bool },
    /// Junos `vmm-config.tgz` on a FAT disk, with an optional rendered loader template
    JunosFat { loader_template: Option<&'static str>, partition_table: bool },
    /// Single file on an ISO image
    Iso { file_name: &'static str, volume_id: &'static str },
    /// cloud-init `cidata` ISO with meta-data, network-config and user-data
    CloudInit,
}

/// Which device id names an extra management network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkScope {
    /// Shared by the topology: the network id is the bare name
    Topology,
    /// Per device: `<name>-<device id>`
    Device,
    /// Per split pair: `<name>-<control plane id, else device id>`
    ControlPlane,
}

/// Backend networks a device type needs besides its data networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNetworks {
    None,
    /// One network per distinct extra management name, mac `(0xfd, 0xff - idx)`
    PerDevice,
    /// `int-<id>` style networks for devices without a control-plane peer,
    /// mac `(0xfc, id)`
    ControlPlaneOnly,
}

/// Container engine settings of a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerProfile {
    /// Path the day-0 file is mounted at inside the container
    pub config_target: &'static str,
    pub capabilities: Vec<&'static str>,
    pub devices: Vec<&'static str>,
    pub command: Option<&'static str>,
    pub privileged: bool,
    pub post_start: Vec<String>,
    /// Fixed management interface name; `None` derives `eth<n>` from the
    /// sorted interface list
    pub management_interface: Option<&'static str>,
    /// Export the XR interface mapping environment
    pub xr_environment: bool,
}

/// Remote simulation settings of a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationProfile {
    pub interface_prefix: &'static str,
    pub management_interface: &'static str,
}

/// Behaviour of one device type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub backend: BackendKind,
    pub management_model: NicModel,
    pub data_model: NicModel,
    /// Attach unconnected interfaces to the device's isolated network
    pub include_null_interfaces: bool,
    /// Pad the interface list up to this many
    pub min_data_interfaces: u32,
    pub first_interface: u32,
    /// Shutdown completes asynchronously and is worth waiting for
    pub graceful_shutdown: bool,
    pub day0_attachment: Day0Attachment,
    pub day0_format: Day0Format,
    /// Extra management interface network names, in attach order
    pub extra_management: Vec<&'static str>,
    pub extra_scope: NetworkScope,
    pub device_networks: DeviceNetworks,
    /// Networks shared by every device of this type in a topology
    pub topology_networks: Vec<&'static str>,
    /// Only devices with a control-plane peer carry data interfaces
    pub split_data_plane: bool,
    pub container: Option<ContainerProfile>,
    pub simulation: Option<SimulationProfile>,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            backend: BackendKind::Libvirt,
            management_model: NicModel::Virtio,
            data_model: NicModel::Virtio,
            include_null_interfaces: false,
            min_data_interfaces: 0,
            first_interface: 0,
            graceful_shutdown: true,
            day0_attachment: Day0Attachment::Disk,
            day0_format: Day0Format::Text,
            extra_management: Vec::new(),
            extra_scope: NetworkScope::Topology,
            device_networks: DeviceNetworks::None,
            topology_networks: Vec::new(),
            split_data_plane: false,
            container: None,
            simulation: None,
        }
    }
}

impl DeviceProfile {
    pub fn is_vm(&self) -> bool {
        self.backend == BackendKind::Libvirt
    }

    /// Whether a device carries data interfaces.
    pub fn has_data_plane(&self, control_plane_id: Option<u32>) -> bool {
        !self.split_data_plane || control_plane_id.is_some()
    }

    /// Network id behind an extra management interface.
    pub fn extra_network_id(&self, name: &str, device_id: u32, control_plane_id: Option<u32>) -> String {
        match self.extra_scope {
            NetworkScope::Topology => name.to_string(),
            NetworkScope::Device => format!("{}-{}", name, device_id),
            NetworkScope::ControlPlane => format!("{}-{}", name, control_plane_id.unwrap_or(device_id)),
        }
    }

    /// Per-device extra networks as (network id, mac octets).
    pub fn device_network_plan(&self, device_id: u32, control_plane_id: Option<u32>) -> Vec<(String, (u32, u32))> {
        match self.device_networks {
            DeviceNetworks::None => Vec::new(),
            DeviceNetworks::PerDevice => {
                let mut names: Vec<&str> = self.extra_management.clone();
                names.sort_unstable();
                names.dedup();
                names
                    .into_iter()
                    .enumerate()
                    .map(|(idx, name)| (format!("{}-{}", name, device_id), (0xfd, 0xff - idx as u32)))
                    .collect()
            }
            DeviceNetworks::ControlPlaneOnly if control_plane_id.is_none() => self
                .extra_management
                .iter()
                .map(|name| (format!("{}-{}", name, device_id), (0xfc, device_id)))
                .collect(),
            DeviceNetworks::ControlPlaneOnly => Vec::new(),
        }
    }
}

/// Device type tag to profile.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, DeviceProfile>,
    fallback: DeviceProfile,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRegistry {
    /// Registry of every supported device type.
    pub fn new() -> Self {
        let profiles = HashMap::from([
            ("IOSv".to_string(), iosv()),
            ("XRv-9000".to_string(), xrv9000()),
            ("vMX".to_string(), vmx()),
            ("vJunos-Evolved".to_string(), vjunos_evolved()),
            ("Linux".to_string(), linux()),
            ("XRd".to_string(), xrd()),
            ("SR-Linux".to_string(), sr_linux()),
            ("VXR-8000".to_string(), vxr8000()),
        ]);
        Self {
            profiles,
            fallback: DeviceProfile::default(),
        }
    }

    /// Profile for a device type, or the default profile.
    pub fn get(&self, device_type: &str) -> &DeviceProfile {
        self.profiles.get(device_type).unwrap_or(&self.fallback)
    }

    pub fn insert(&mut self, device_type: impl Into<String>, profile: DeviceProfile) {
        self.profiles.insert(device_type.into(), profile);
    }
}

// =============================================================================
// PROFILES
// =============================================================================

fn iosv() -> DeviceProfile {
    DeviceProfile {
        management_model: NicModel::E1000,
        data_model: NicModel::E1000,
        min_data_interfaces: 4,
        first_interface: 1,
        graceful_shutdown: false,
        day0_format: Day0Format::Fat { file_name: "ios_config.txt", partition_table: true },
        ..Default::default()
    }
}

fn xrv9000() -> DeviceProfile {
    DeviceProfile {
        management_model: NicModel::E1000,
        data_model: NicModel::E1000,
        include_null_interfaces: true,
        day0_attachment: Day0Attachment::Cdrom,
        day0_format: Day0Format::Iso { file_name: "iosxr_config.txt", volume_id: "config-1" },
        extra_management: vec!["ctrl", "host"],
        extra_scope: NetworkScope::Topology,
        topology_networks: vec!["ctrl", "host"],
        ..Default::default()
    }
}

fn vmx() -> DeviceProfile {
    DeviceProfile {
        include_null_interfaces: true,
        graceful_shutdown: false,
        day0_format: Day0Format::JunosFat {
            loader_template: Some("junos-vmx-loader.conf"),
            partition_table: false,
        },
        extra_management: vec!["int"],
        extra_scope: NetworkScope::ControlPlane,
        device_networks: DeviceNetworks::ControlPlaneOnly,
        split_data_plane: true,
        ..Default::default()
    }
}

fn vjunos_evolved() -> DeviceProfile {
    DeviceProfile {
        include_null_interfaces: true,
        day0_attachment: Day0Attachment::Usb,
        day0_format: Day0Format::JunosFat { loader_template: None, partition_table: true },
        extra_management: vec!["pfe", "rpio", "rpio", "pfe"],
        extra_scope: NetworkScope::Device,
        device_networks: DeviceNetworks::PerDevice,
        ..Default::default()
    }
}

fn linux() -> DeviceProfile {
    DeviceProfile {
        day0_format: Day0Format::CloudInit,
        ..Default::default()
    }
}

fn xrd() -> DeviceProfile {
    DeviceProfile {
        backend: BackendKind::Container,
        container: Some(ContainerProfile {
            config_target: "/startup.cfg",
            capabilities: vec!["NET_ADMIN", "SYS_ADMIN", "IPC_LOCK", "SYS_NICE", "SYS_PTRACE", "SYS_RESOURCE"],
            devices: vec!["/dev/fuse", "/dev/net/tun"],
            xr_environment: true,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn sr_linux() -> DeviceProfile {
    const CONFIG_TARGET: &str = "/etc/opt/srlinux/startup-config.cli";
    DeviceProfile {
        backend: BackendKind::Container,
        container: Some(ContainerProfile {
            config_target: CONFIG_TARGET,
            command: Some("sudo bash /opt/srlinux/bin/sr_linux"),
            privileged: true,
            management_interface: Some("eth0"),
            post_start: vec![
                r#"sudo bash -c 'while ! /opt/srlinux/bin/sr_cli -d "info from state system app-management application mgmt_server state" | grep running; do sleep 1; done'"#.to_string(),
                r#"sudo bash -c 'while ! cat /etc/opt/srlinux/devices/app_ephemeral.mgmt_server.ready_for_config | grep "loaded initial configuration"; do sleep 1; done'"#.to_string(),
                format!(r#"sudo bash -c "/opt/srlinux/bin/sr_cli -ed < {}""#, CONFIG_TARGET),
                r#"sudo bash -c "/opt/srlinux/bin/sr_cli -ed commit save""#.to_string(),
            ],
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn vxr8000() -> DeviceProfile {
    DeviceProfile {
        backend: BackendKind::Simulation,
        graceful_shutdown: false,
        simulation: Some(SimulationProfile {
            interface_prefix: "FourHundredGigE0/0/0",
            management_interface: "eth0",
        }),
        ..Default::default()
    }
}
