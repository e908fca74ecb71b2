//! Network topology resolution.
//!
//! Turns the device/link/network graph into one claim per
//! (device, interface) pair. A link whose ends share a hypervisor becomes
//! a link network named from the sorted device pair; a link that crosses
//! hypervisors becomes a bridge claim on each side. Explicit networks
//! claim their members last. Resolution is read-only and rebuilt per run.
//!
//! On a hypervisor with a UDP tunnel address, both ends of a same-host
//! link also get a tunnel to each other, which VM backends use in place
//! of the link network.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::model::{Link, Topology};
use crate::names;
use crate::placement::Placement;
use crate::store::{InterfaceSlot, LinkEnd};

/// What a claimed interface is plugged into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    /// Orchestrator-managed network, by network id
    Network(String),
    /// Existing host bridge, by bridge name
    Bridge(String),
}

/// UDP socket pair standing in for a link network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunnel {
    pub address: Ipv4Addr,
    /// (device id, interface id) of the other end
    pub peer: (u32, u32),
}

#[derive(Debug, Clone)]
struct Claim {
    attachment: Attachment,
    slot: InterfaceSlot,
}

/// Resolved interface claims of one topology.
#[derive(Debug, Clone, Default)]
pub struct NetworkResolver {
    claims: BTreeMap<(u32, u32), Claim>,
    link_networks: BTreeMap<(u32, u32), String>,
    tunnels: BTreeMap<(u32, u32), Tunnel>,
    subnets: BTreeMap<String, String>,
}

impl NetworkResolver {
    /// Resolve a topology. Fails on the first interface claimed twice, and
    /// on links or networks naming unknown devices.
    pub fn new(topology: &Topology, placement: &Placement) -> Result<Self> {
        let mut resolver = Self::default();

        for link in &topology.links {
            let a = placement.device_id(&link.a_end_device)?;
            let z = placement.device_id(&link.z_end_device)?;
            let a_iface = link.a_end_interface.id.unwrap_or(z);
            let z_iface = link.z_end_interface.id.unwrap_or(a);

            let a_hv = placement.hypervisor_of(a)?;
            let z_hv = placement.hypervisor_of(z)?;

            let (a_attach, z_attach) = if a_hv == z_hv {
                let (id, pair) = names::link_network_id(a, z);
                resolver.link_networks.insert(pair, id.clone());
                if let Some(address) = placement.tunnel_address(a_hv) {
                    resolver.tunnels.insert((a, a_iface), Tunnel { address, peer: (z, z_iface) });
                    resolver.tunnels.insert((z, z_iface), Tunnel { address, peer: (a, a_iface) });
                }
                (Attachment::Network(id.clone()), Attachment::Network(id))
            } else {
                let bridge = |over: &Option<String>, hv: &str| {
                    over.clone()
                        .or_else(|| placement.external_bridge(hv).map(str::to_string))
                        .ok_or_else(|| {
                            OrchestratorError::Configuration(format!(
                                "Link {} crosses hypervisors but {} has no external bridge",
                                link.id(),
                                hv
                            ))
                        })
                };
                (
                    Attachment::Bridge(bridge(&link.a_end_bridge, a_hv)?),
                    Attachment::Bridge(bridge(&link.z_end_bridge, z_hv)?),
                )
            };

            resolver.claim(
                (a, a_iface),
                a_attach,
                InterfaceSlot::LinkEnd { link: link.id(), end: LinkEnd::A },
            )?;
            resolver.claim(
                (z, z_iface),
                z_attach,
                InterfaceSlot::LinkEnd { link: link.id(), end: LinkEnd::Z },
            )?;
        }

        for network in &topology.networks {
            let key = network.external_bridge.clone().unwrap_or_else(|| network.name.clone());
            if let Some(start) = &network.ipv4_subnet_start {
                resolver.subnets.insert(key, start.clone());
            }

            for member in &network.devices {
                let device = placement.device_id(&member.name)?;
                let iface = member.interface.id.or(network.interface_id).ok_or_else(|| {
                    OrchestratorError::Configuration(format!(
                        "No interface id for {} on network {}",
                        member.name, network.name
                    ))
                })?;
                let attachment = match &network.external_bridge {
                    Some(bridge) => Attachment::Bridge(bridge.clone()),
                    None => Attachment::Network(network.name.clone()),
                };
                resolver.claim(
                    (device, iface),
                    attachment,
                    InterfaceSlot::NetworkMember {
                        network: network.name.clone(),
                        device: member.name.clone(),
                    },
                )?;
            }
        }

        debug!(
            claims = resolver.claims.len(),
            link_networks = resolver.link_networks.len(),
            "Resolved topology {}",
            topology.name
        );
        Ok(resolver)
    }

    fn claim(&mut self, key: (u32, u32), attachment: Attachment, slot: InterfaceSlot) -> Result<()> {
        if self.claims.contains_key(&key) {
            return Err(OrchestratorError::ConfigurationConflict {
                device: key.0,
                interface: key.1,
            });
        }
        self.claims.insert(key, Claim { attachment, slot });
        Ok(())
    }

    /// Managed network id of an interface, if it is on one.
    pub fn iface_network(&self, device_id: u32, iface_id: u32) -> Option<&str> {
        match self.claims.get(&(device_id, iface_id)).map(|c| &c.attachment) {
            Some(Attachment::Network(id)) => Some(id),
            _ => None,
        }
    }

    /// Host bridge of an interface, if it is on one.
    pub fn iface_bridge(&self, device_id: u32, iface_id: u32) -> Option<&str> {
        match self.claims.get(&(device_id, iface_id)).map(|c| &c.attachment) {
            Some(Attachment::Bridge(bridge)) => Some(bridge),
            _ => None,
        }
    }

    /// UDP tunnel of a link interface, on tunnel-mode hypervisors only.
    pub fn iface_tunnel(&self, device_id: u32, iface_id: u32) -> Option<&Tunnel> {
        self.tunnels.get(&(device_id, iface_id))
    }

    pub fn attachment(&self, device_id: u32, iface_id: u32) -> Option<&Attachment> {
        self.claims.get(&(device_id, iface_id)).map(|c| &c.attachment)
    }

    /// Where interface write-backs for this pair go.
    pub fn iface_slot(&self, device_id: u32, iface_id: u32) -> Option<&InterfaceSlot> {
        self.claims.get(&(device_id, iface_id)).map(|c| &c.slot)
    }

    pub fn is_claimed(&self, device_id: u32, iface_id: u32) -> bool {
        self.claims.contains_key(&(device_id, iface_id))
    }

    /// Highest claimed interface id plus one; zero when nothing is claimed.
    pub fn num_interfaces(&self) -> u32 {
        self.claims.keys().map(|(_, iface)| iface + 1).max().unwrap_or(0)
    }

    /// Link network id of a link (when both ends share a hypervisor) and its
    /// sorted device pair.
    pub fn link_network(&self, link: &Link, placement: &Placement) -> Result<(Option<String>, (u32, u32))> {
        let pair = names::sorted_pair(
            placement.device_id(&link.a_end_device)?,
            placement.device_id(&link.z_end_device)?,
        );
        Ok((self.link_networks.get(&pair).cloned(), pair))
    }

    /// Data subnet start of an explicit network, keyed by network name or
    /// external bridge.
    pub fn network_subnet(&self, key: &str) -> Option<&str> {
        self.subnets.get(key).map(String::as_str)
    }

    /// Devices with an interface on an explicit network.
    pub fn network_devices(&self, network: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .claims
            .iter()
            .filter(|(_, claim)| {
                matches!(&claim.slot, InterfaceSlot::NetworkMember { network: n, .. } if n == network)
            })
            .map(|((device, _), _)| *device)
            .collect();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn fixture(devices: &[(u32, &str, Option<&str>)]) -> (Lab, Topology) {
        let topology = Topology {
            name: "lab".to_string(),
            devices: devices
                .iter()
                .map(|(id, name, hv)| Device {
                    id: *id,
                    name: name.to_string(),
                    hypervisor: hv.map(str::to_string),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let lab = Lab {
            default_hypervisor: Some("hv1".to_string()),
            hypervisors: vec![
                Hypervisor { name: "hv1".to_string(), external_bridge: Some("br1".to_string()), ..Default::default() },
                Hypervisor { name: "hv2".to_string(), external_bridge: Some("br2".to_string()), ..Default::default() },
            ],
            ..Default::default()
        };
        (lab, topology)
    }

    fn resolve(lab: &Lab, topology: &Topology) -> Result<(NetworkResolver, Placement)> {
        let placement = Placement::new(lab, topology)?;
        Ok((NetworkResolver::new(topology, &placement)?, placement))
    }

    #[test]
    fn test_same_hypervisor_link_network() {
        let (lab, mut topology) = fixture(&[(3, "a", None), (7, "b", None)]);
        topology.links.push(Link::new("b", "a"));

        let (resolver, placement) = resolve(&lab, &topology).unwrap();
        // Interface ids default to the other end's device id
        assert_eq!(resolver.iface_network(7, 3), Some("3-7"));
        assert_eq!(resolver.iface_network(3, 7), Some("3-7"));
        assert_eq!(resolver.num_interfaces(), 8);

        let (network, pair) = resolver.link_network(&topology.links[0], &placement).unwrap();
        assert_eq!(network.as_deref(), Some("3-7"));
        assert_eq!(pair, (3, 7));
    }

    #[test]
    fn test_tunnel_mode_pairs_link_ends() {
        let (mut lab, mut topology) = fixture(&[(1, "a", None), (2, "b", None), (3, "c", Some("hv2"))]);
        lab.hypervisors[0].udp_tunnel_address = "127.0.0.1".parse().ok();
        topology.links.push(Link::new("a", "b"));
        topology.links.push(Link::new("c", "a"));

        let (resolver, _) = resolve(&lab, &topology).unwrap();
        let tunnel = resolver.iface_tunnel(1, 2).unwrap();
        assert_eq!(tunnel.address.to_string(), "127.0.0.1");
        assert_eq!(tunnel.peer, (2, 1));
        assert_eq!(resolver.iface_tunnel(2, 1).unwrap().peer, (1, 2));
        // The link network stays for backends that cannot tunnel
        assert_eq!(resolver.iface_network(1, 2), Some("1-2"));
        // Cross-hypervisor links keep their bridges
        assert!(resolver.iface_tunnel(1, 3).is_none());
    }

    #[test]
    fn test_cross_hypervisor_link_uses_bridges() {
        let (lab, mut topology) = fixture(&[(1, "a", None), (2, "b", Some("hv2"))]);
        let mut link = Link::new("a", "b");
        link.z_end_bridge = Some("br-override".to_string());
        topology.links.push(link);

        let (resolver, placement) = resolve(&lab, &topology).unwrap();
        assert_eq!(resolver.iface_bridge(1, 2), Some("br1"));
        assert_eq!(resolver.iface_bridge(2, 1), Some("br-override"));
        assert_eq!(resolver.iface_network(1, 2), None);
        assert_eq!(resolver.link_network(&topology.links[0], &placement).unwrap().0, None);
    }

    #[test]
    fn test_duplicate_claim_conflicts() {
        let (lab, mut topology) = fixture(&[(1, "a", None), (2, "b", None), (3, "c", None)]);
        let mut first = Link::new("a", "b");
        first.a_end_interface = InterfaceRecord::with_id(0);
        let mut second = Link::new("a", "c");
        second.a_end_interface = InterfaceRecord::with_id(0);
        topology.links = vec![first, second];

        let err = resolve(&lab, &topology).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigurationConflict { device: 1, interface: 0 }));
    }

    #[test]
    fn test_network_member_conflicts_with_link() {
        let (lab, mut topology) = fixture(&[(1, "a", None), (2, "b", None)]);
        topology.links.push(Link::new("a", "b"));
        topology.networks.push(Network {
            name: "lan".to_string(),
            interface_id: Some(2),
            devices: vec![NetworkMember { name: "a".to_string(), ..Default::default() }],
            ..Default::default()
        });

        assert!(matches!(
            resolve(&lab, &topology),
            Err(OrchestratorError::ConfigurationConflict { device: 1, interface: 2 })
        ));
    }

    #[test]
    fn test_networks() {
        let (lab, mut topology) = fixture(&[(1, "a", None), (2, "b", None)]);
        topology.networks.push(Network {
            name: "lan".to_string(),
            ipv4_subnet_start: Some("10.0.5".to_string()),
            interface_id: Some(4),
            devices: vec![
                NetworkMember { name: "a".to_string(), ..Default::default() },
                NetworkMember { name: "b".to_string(), interface: InterfaceRecord::with_id(6) },
            ],
            ..Default::default()
        });
        topology.networks.push(Network {
            name: "ext".to_string(),
            external_bridge: Some("br-lab".to_string()),
            ipv4_subnet_start: Some("10.0.6".to_string()),
            interface_id: Some(1),
            devices: vec![NetworkMember { name: "a".to_string(), ..Default::default() }],
            ..Default::default()
        });

        let (resolver, _) = resolve(&lab, &topology).unwrap();
        assert_eq!(resolver.iface_network(1, 4), Some("lan"));
        assert_eq!(resolver.iface_network(2, 6), Some("lan"));
        assert_eq!(resolver.iface_bridge(1, 1), Some("br-lab"));
        assert_eq!(resolver.network_subnet("lan"), Some("10.0.5"));
        assert_eq!(resolver.network_subnet("br-lab"), Some("10.0.6"));
        assert_eq!(resolver.network_devices("lan"), vec![1, 2]);
        assert!(resolver.network_devices("ext").contains(&1));
        assert!(matches!(
            resolver.iface_slot(2, 6),
            Some(InterfaceSlot::NetworkMember { network, device }) if network == "lan" && device == "b"
        ));
    }

    #[test]
    fn test_unknown_device_and_missing_iface_id() {
        let (lab, mut topology) = fixture(&[(1, "a", None)]);
        topology.links.push(Link::new("a", "zz"));
        assert!(matches!(resolve(&lab, &topology), Err(OrchestratorError::UnknownDevice(_))));

        let (lab, mut topology) = fixture(&[(1, "a", None)]);
        topology.networks.push(Network {
            name: "lan".to_string(),
            devices: vec![NetworkMember { name: "a".to_string(), ..Default::default() }],
            ..Default::default()
        });
        assert!(matches!(resolve(&lab, &topology), Err(OrchestratorError::Configuration(_))));
    }

    #[test]
    fn test_empty_topology_has_no_interfaces() {
        let (lab, topology) = fixture(&[(1, "a", None)]);
        let (resolver, _) = resolve(&lab, &topology).unwrap();
        assert_eq!(resolver.num_interfaces(), 0);
    }
}
