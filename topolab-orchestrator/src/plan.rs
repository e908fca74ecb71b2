//! Backend-neutral interface plan.
//!
//! One allocation pass per device decides every NIC it gets: management,
//! extra management and data interfaces with their sources, MACs, tap
//! names and the store records they write back to. The domain controllers
//! then encode the plan for their backend.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use topolab_virt::{InterfaceAttachment, InterfaceSource, MacAddress, NicModel};

use crate::allocator::{ResourceAllocator, MGMT_OCTET};
use crate::error::{OrchestratorError, Result};
use crate::model::Device;
use crate::names;
use crate::profiles::DeviceProfile;
use crate::resolver::{Attachment, NetworkResolver, Tunnel};
use crate::store::{InterfacePatch, InterfaceSlot, TopologyChange};

/// One planned NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedInterface {
    /// Device interface id; `None` for management interfaces
    pub slot: Option<u32>,
    pub source: InterfaceSource,
    pub mac_address: MacAddress,
    pub model: NicModel,
    pub target_dev: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
    /// Record updated once the domain is defined
    pub write_back: Option<(InterfaceSlot, InterfacePatch)>,
}

impl PlannedInterface {
    pub fn attachment(&self) -> InterfaceAttachment {
        InterfaceAttachment {
            source: self.source.clone(),
            mac_address: self.mac_address,
            model: self.model,
            target_dev: self.target_dev.clone(),
            slot: self.slot,
            ip_address: self.ip_address.map(|ip| ip.to_string()),
        }
    }
}

/// Every NIC of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePlan {
    pub device: String,
    pub management: PlannedInterface,
    pub management_patch: InterfacePatch,
    pub extra_management: Vec<PlannedInterface>,
    pub data: Vec<PlannedInterface>,
}

impl InterfacePlan {
    /// Store changes recording the plan.
    pub fn write_backs(&self) -> Vec<TopologyChange> {
        let mut changes = vec![TopologyChange::Management {
            device: self.device.clone(),
            patch: self.management_patch.clone(),
        }];
        changes.extend(self.data.iter().filter_map(|iface| {
            iface
                .write_back
                .clone()
                .map(|(slot, patch)| TopologyChange::Interface { slot, patch })
        }));
        changes
    }

    /// Where management sits among the bridge-sorted interfaces.
    pub fn management_position(&self) -> usize {
        let bridge = self.management.source.name();
        self.data.iter().filter(|iface| iface.source.name() < bridge).count()
    }

    /// Container interface order: data and management sorted by bridge name.
    fn sort_by_bridge(&mut self) -> usize {
        let mut all: Vec<PlannedInterface> = std::mem::take(&mut self.data);
        all.push(self.management.clone());
        all.sort_by(|a, b| a.source.name().cmp(b.source.name()));
        let position = all.iter().position(|iface| iface.slot.is_none()).unwrap_or(0);
        self.data = all.into_iter().filter(|iface| iface.slot.is_some()).collect();
        position
    }
}

/// Inputs shared by every planner.
pub struct Planner<'a> {
    pub resolver: &'a NetworkResolver,
    pub allocator: &'a ResourceAllocator,
}

impl<'a> Planner<'a> {
    pub fn new(resolver: &'a NetworkResolver, allocator: &'a ResourceAllocator) -> Self {
        Self { resolver, allocator }
    }

    fn management(&self, device: &Device, model: NicModel) -> Result<PlannedInterface> {
        let bridge = self.allocator.mgmt_bridge().to_string();
        Ok(PlannedInterface {
            slot: None,
            mac_address: self.allocator.interface_mac(device.id, MGMT_OCTET)?,
            model,
            target_dev: Some(names::tap_name(device.id, &bridge)),
            ip_address: Some(self.allocator.mgmt_ip(device.id)?),
            source: InterfaceSource::Bridge(bridge),
            write_back: None,
        })
    }

    fn source(attachment: &Attachment) -> InterfaceSource {
        match attachment {
            Attachment::Network(id) => InterfaceSource::Network(names::network_name(id)),
            Attachment::Bridge(bridge) => InterfaceSource::Bridge(bridge.clone()),
        }
    }

    fn tunnel(local: (u32, u32), tunnel: &Tunnel) -> Result<InterfaceSource> {
        let port = |(device, iface): (u32, u32)| {
            names::udp_port(device, iface).ok_or_else(|| {
                OrchestratorError::Allocation(format!(
                    "No UDP port for device {} interface {}, ids above 99",
                    device, iface
                ))
            })
        };
        Ok(InterfaceSource::Udp {
            address: tunnel.address.to_string(),
            local_port: port(local)?,
            remote_port: port(tunnel.peer)?,
        })
    }

    /// Bridge a container or simulation joins for a claimed interface.
    fn bridge(attachment: &Attachment) -> String {
        match attachment {
            Attachment::Network(id) => names::bridge_name(id),
            Attachment::Bridge(bridge) => bridge.clone(),
        }
    }

    /// Libvirt VM plan.
    pub fn vm(&self, device: &Device, profile: &DeviceProfile) -> Result<InterfacePlan> {
        let id = device.id;
        let management = self.management(device, profile.management_model)?;
        let management_patch = InterfacePatch {
            host_interface: management.target_dev.clone(),
            mac_address: Some(management.mac_address),
            ip_address: management.ip_address.map(|ip| ip.to_string()),
            ..Default::default()
        };

        let mut taps = HashSet::new();
        let mut extra_management = Vec::new();
        for (idx, name) in profile.extra_management.iter().enumerate() {
            let network = profile.extra_network_id(name, id, device.control_plane_id);
            let mut tap = names::tap_name(id, name);
            if !taps.insert(tap.clone()) {
                tap = format!("{}-{}", tap, idx);
                taps.insert(tap.clone());
            }
            extra_management.push(PlannedInterface {
                slot: None,
                source: InterfaceSource::Network(names::network_name(&network)),
                mac_address: self.allocator.interface_mac(id, 0xfe - idx as u32)?,
                model: profile.management_model,
                target_dev: Some(tap),
                ip_address: None,
                write_back: None,
            });
        }

        let mut data = Vec::new();
        if profile.has_data_plane(device.control_plane_id) {
            // Split pairs look their links up under the control-plane id
            let lookup = device.control_plane_id.unwrap_or(id);
            let end = self.resolver.num_interfaces().max(profile.min_data_interfaces);
            for iface in profile.first_interface..end {
                let attachment = self.resolver.attachment(lookup, iface);
                let padded = iface + 1 < profile.min_data_interfaces;
                if attachment.is_none() && !profile.include_null_interfaces && !padded {
                    continue;
                }

                let tap = names::tap_name(id, iface);
                let mac = self.allocator.interface_mac(id, iface)?;
                let tunnel = self.resolver.iface_tunnel(lookup, iface);
                let source = match (tunnel, attachment) {
                    (Some(tunnel), _) => Self::tunnel((lookup, iface), tunnel)?,
                    (None, Some(attachment)) => Self::source(attachment),
                    (None, None) => InterfaceSource::Network(names::network_name(&names::network_id(id, None))),
                };
                let write_back = attachment
                    .and_then(|_| self.resolver.iface_slot(lookup, iface))
                    .map(|slot| {
                        (slot.clone(), InterfacePatch {
                            id: Some(iface),
                            host_interface: Some(tap.clone()),
                            mac_address: Some(mac),
                            ..Default::default()
                        })
                    });

                data.push(PlannedInterface {
                    slot: Some(iface),
                    source,
                    mac_address: mac,
                    model: profile.data_model,
                    target_dev: tunnel.is_none().then_some(tap),
                    ip_address: None,
                    write_back,
                });
            }
        }

        Ok(InterfacePlan {
            device: device.name.clone(),
            management,
            management_patch,
            extra_management,
            data,
        })
    }

    /// Container plan: every claimed interface plus management, ordered by
    /// bridge name so `eth<n>` follows the container engine's numbering.
    /// Returns the plan and the management interface name.
    pub fn container(&self, device: &Device, profile: &DeviceProfile) -> Result<(InterfacePlan, String)> {
        let id = device.id;
        let mut management = self.management(device, profile.data_model)?;
        management.target_dev = None;

        let mut data = Vec::new();
        for iface in 0..self.resolver.num_interfaces() {
            let Some(attachment) = self.resolver.attachment(id, iface) else {
                continue;
            };
            let mac = self.allocator.interface_mac(id, iface)?;
            let write_back = self.resolver.iface_slot(id, iface).map(|slot| {
                (slot.clone(), InterfacePatch {
                    id: Some(iface),
                    mac_address: Some(mac),
                    ..Default::default()
                })
            });
            data.push(PlannedInterface {
                slot: Some(iface),
                source: InterfaceSource::Bridge(Self::bridge(attachment)),
                mac_address: mac,
                model: profile.data_model,
                target_dev: None,
                ip_address: None,
                write_back,
            });
        }

        let mut plan = InterfacePlan {
            device: device.name.clone(),
            management_patch: InterfacePatch::default(),
            management,
            extra_management: Vec::new(),
            data,
        };
        let position = plan.sort_by_bridge();
        let name = profile
            .container
            .as_ref()
            .and_then(|c| c.management_interface)
            .map(str::to_string)
            .unwrap_or_else(|| format!("eth{}", position));

        plan.management_patch = InterfacePatch {
            host_interface: Some(name.clone()),
            mac_address: Some(plan.management.mac_address),
            ip_address: plan.management.ip_address.map(|ip| ip.to_string()),
            ..Default::default()
        };
        Ok((plan, name))
    }

    /// Remote simulation plan: claimed interfaces become hub ports on
    /// their bridges.
    pub fn simulation(&self, device: &Device, profile: &DeviceProfile) -> Result<InterfacePlan> {
        let id = device.id;
        let lookup = device.control_plane_id.unwrap_or(id);
        let mut management = self.management(device, profile.data_model)?;
        management.target_dev = None;

        let mut data = Vec::new();
        for iface in profile.first_interface..self.resolver.num_interfaces() {
            let Some(attachment) = self.resolver.attachment(lookup, iface) else {
                continue;
            };
            let write_back = self.resolver.iface_slot(lookup, iface).map(|slot| {
                (slot.clone(), InterfacePatch { id: Some(iface), ..Default::default() })
            });
            data.push(PlannedInterface {
                slot: Some(iface),
                source: InterfaceSource::Bridge(Self::bridge(attachment)),
                mac_address: self.allocator.interface_mac(id, iface)?,
                model: profile.data_model,
                target_dev: None,
                ip_address: None,
                write_back,
            });
        }

        let management_patch = InterfacePatch {
            mac_address: Some(management.mac_address),
            ip_address: management.ip_address.map(|ip| ip.to_string()),
            ..Default::default()
        };
        Ok(InterfacePlan {
            device: device.name.clone(),
            management,
            management_patch,
            extra_management: Vec::new(),
            data,
        })
    }
}

/// `XR_*` environment of an XRd container from its sorted interface list.
pub fn xr_environment(plan: &InterfacePlan, management_interface: &str) -> Vec<String> {
    let management = plan.management_position();
    let interfaces: Vec<String> = plan
        .data
        .iter()
        .enumerate()
        .filter_map(|(position, iface)| {
            let slot = iface.slot?;
            // eth numbering skips over the management interface
            let eth = if position >= management { position + 1 } else { position };
            Some(format!("linux:eth{},xr_name=GigabitEthernet0/0/0/{}", eth, slot))
        })
        .collect();

    vec![
        "XR_EVERY_BOOT_CONFIG=/startup.cfg".to_string(),
        format!("XR_MGMT_INTERFACES=linux:{}", management_interface),
        format!("XR_INTERFACES={}", interfaces.join(";")),
    ]
}
