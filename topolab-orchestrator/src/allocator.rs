//! Deterministic MAC and management address generation.

use std::net::Ipv4Addr;

use topolab_virt::MacAddress;

use crate::error::{OrchestratorError, Result};
use crate::model::Hypervisor;

/// Last octet of a management interface MAC.
pub const MGMT_OCTET: u32 = 0xff;

/// Derives addresses from device ids for one hypervisor.
///
/// MAC layout is `prefix:FF:PP:LL` where `FF` is `01` for device-owned
/// interfaces and `00` for orchestrator-owned networks. Every address is
/// checked against its range; an id that does not fit is an
/// [`OrchestratorError::Allocation`] rather than a wrapped address.
#[derive(Debug, Clone)]
pub struct ResourceAllocator {
    prefix: [u8; 3],
    mgmt_start: Option<Ipv4Addr>,
    prefix_length: u8,
    mgmt_bridge: String,
    gateway: Option<String>,
    dns_server: Option<String>,
}

impl ResourceAllocator {
    pub fn new(hypervisor: &Hypervisor) -> Result<Self> {
        let prefix = parse_prefix(&hypervisor.mac_address_start).ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "Invalid mac-address-start {:?} on hypervisor {}",
                hypervisor.mac_address_start, hypervisor.name
            ))
        })?;

        let network = &hypervisor.management_network;
        if network.prefix_length > 32 {
            return Err(OrchestratorError::Configuration(format!(
                "Invalid management prefix length {}",
                network.prefix_length
            )));
        }

        Ok(Self {
            prefix,
            mgmt_start: network.ip_address_start,
            prefix_length: network.prefix_length,
            mgmt_bridge: network.bridge.clone(),
            gateway: network.gateway_address.clone(),
            dns_server: network.dns_server_address.clone(),
        })
    }

    /// MAC from two caller octets and the interface flag.
    pub fn mac(&self, penultimate: u32, last: u32, is_interface: bool) -> Result<MacAddress> {
        let octet = |value: u32| {
            u8::try_from(value).map_err(|_| {
                OrchestratorError::Allocation(format!("MAC octet {} out of range", value))
            })
        };
        Ok(MacAddress::from_parts(
            self.prefix,
            [u8::from(is_interface), octet(penultimate)?, octet(last)?],
        ))
    }

    /// MAC of a device interface (`last` is the interface id or a well-known octet).
    pub fn interface_mac(&self, device_id: u32, last: u32) -> Result<MacAddress> {
        self.mac(device_id, last, true)
    }

    /// Management address of a device: the configured start plus the device id.
    pub fn mgmt_ip(&self, device_id: u32) -> Result<Ipv4Addr> {
        let start = self.mgmt_start.ok_or_else(|| {
            OrchestratorError::Configuration("Management network has no ip-address-start".to_string())
        })?;

        let mask = mask(self.prefix_length);
        let network = u32::from(start) & mask;
        let broadcast = network | !mask;
        let address = u32::from(start)
            .checked_add(device_id)
            .filter(|a| *a < broadcast)
            .ok_or_else(|| {
                OrchestratorError::Allocation(format!(
                    "Device id {} does not fit management network {}/{}",
                    device_id,
                    Ipv4Addr::from(network),
                    self.prefix_length
                ))
            })?;
        Ok(Ipv4Addr::from(address))
    }

    /// Management subnet in CIDR notation.
    pub fn mgmt_subnet(&self) -> Result<String> {
        let start = self.mgmt_start.ok_or_else(|| {
            OrchestratorError::Configuration("Management network has no ip-address-start".to_string())
        })?;
        let network = Ipv4Addr::from(u32::from(start) & mask(self.prefix_length));
        Ok(format!("{}/{}", network, self.prefix_length))
    }

    pub fn mgmt_bridge(&self) -> &str {
        &self.mgmt_bridge
    }

    /// Management network variables exposed to day-0 templates.
    pub fn template_variables(&self) -> Vec<(String, String)> {
        vec![
            ("gateway-address".to_string(), self.gateway.clone().unwrap_or_default()),
            ("dns-server".to_string(), self.dns_server.clone().unwrap_or_default()),
        ]
    }
}

/// Data address of a device on a network with subnet start `a.b.c`.
pub fn data_ip(subnet_start: &str, device_id: u32) -> Result<Ipv4Addr> {
    let base: Ipv4Addr = format!("{}.0", subnet_start)
        .parse()
        .map_err(|_| OrchestratorError::Configuration(format!("Invalid ipv4-subnet-start {}", subnet_start)))?;
    if device_id > 254 {
        return Err(OrchestratorError::Allocation(format!(
            "Device id {} does not fit subnet {}.0/24",
            device_id, subnet_start
        )));
    }
    Ok(Ipv4Addr::from(u32::from(base) + device_id))
}

fn mask(prefix_length: u8) -> u32 {
    if prefix_length == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_length))
    }
}

fn parse_prefix(s: &str) -> Option<[u8; 3]> {
    let mut prefix = [0u8; 3];
    let mut parts = s.split(':');
    for octet in prefix.iter_mut() {
        *octet = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(prefix)
}
