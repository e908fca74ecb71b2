//! Configuration/state store seam.
//!
//! The orchestrator reads a [`Lab`] snapshot once per run and writes
//! results back as discrete [`TopologyChange`]s. Every store applies the
//! same change semantics through [`TopologyChange::apply`].

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use topolab_virt::MacAddress;

use crate::error::{OrchestratorError, Result};
use crate::model::*;

/// Which end of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEnd {
    A,
    Z,
}

/// Location of a data interface record in the topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InterfaceSlot {
    LinkEnd { link: LinkId, end: LinkEnd },
    NetworkMember { network: String, device: String },
}

/// Fields to set on an interface record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfacePatch {
    pub id: Option<u32>,
    pub host_interface: Option<String>,
    pub mac_address: Option<MacAddress>,
    pub ip_address: Option<String>,
}

impl InterfacePatch {
    fn apply(&self, record: &mut InterfaceRecord) {
        if let Some(id) = self.id {
            record.id = Some(id);
        }
        if let Some(host_interface) = &self.host_interface {
            record.host_interface = Some(host_interface.clone());
        }
        if let Some(mac) = self.mac_address {
            record.mac_address = Some(mac);
        }
        if let Some(ip) = &self.ip_address {
            record.ip_address = Some(ip.clone());
        }
    }
}

fn clear(record: &mut InterfaceRecord) {
    record.host_interface = None;
    record.mac_address = None;
    record.ip_address = None;
}

/// One write-back into a topology.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyChange {
    Interface { slot: InterfaceSlot, patch: InterfacePatch },
    ClearInterface { slot: InterfaceSlot },
    Management { device: String, patch: InterfacePatch },
    ClearManagement { device: String },
    /// Host bridge and MAC of a link network, `None` clears
    LinkBridge { link: LinkId, host_bridge: Option<String>, mac_address: Option<MacAddress> },
    NetworkBridge { network: String, host_bridge: Option<String>, mac_address: Option<MacAddress> },
    LinkDelay { link: LinkId, delay: Option<u32> },
    DeviceStatus {
        device: String,
        provisioning: Option<ProvisioningStatus>,
        operational: Option<OperationalStatus>,
    },
    TopologyStatus(ProvisioningStatus),
    ConsoleActivity { device: String, at: DateTime<Utc>, message: String },
    AppendEvent(StateEvent),
    ClearEvents,
}

impl TopologyChange {
    /// Apply the change to a topology in place.
    pub fn apply(&self, topology: &mut Topology) -> Result<()> {
        match self {
            TopologyChange::Interface { slot, patch } => patch.apply(interface_record(topology, slot)?),
            TopologyChange::ClearInterface { slot } => clear(interface_record(topology, slot)?),
            TopologyChange::Management { device, patch } => {
                patch.apply(&mut device_mut(topology, device)?.management_interface)
            }
            TopologyChange::ClearManagement { device } => {
                clear(&mut device_mut(topology, device)?.management_interface)
            }
            TopologyChange::LinkBridge { link, host_bridge, mac_address } => {
                let link = link_mut(topology, link)?;
                link.host_bridge = host_bridge.clone();
                link.mac_address = *mac_address;
            }
            TopologyChange::NetworkBridge { network, host_bridge, mac_address } => {
                let network = topology
                    .network_mut(network)
                    .ok_or_else(|| OrchestratorError::Store(format!("Unknown network {}", network)))?;
                network.host_bridge = host_bridge.clone();
                network.mac_address = *mac_address;
            }
            TopologyChange::LinkDelay { link, delay } => {
                link_mut(topology, link)?.delay = *delay;
            }
            TopologyChange::DeviceStatus { device, provisioning, operational } => {
                let device = device_mut(topology, device)?;
                if let Some(status) = provisioning {
                    device.provisioning_status = *status;
                }
                if let Some(status) = operational {
                    device.operational_status = *status;
                }
            }
            TopologyChange::TopologyStatus(status) => topology.provisioning_status = *status,
            TopologyChange::ConsoleActivity { device, at, message } => {
                let console = &mut device_mut(topology, device)?.console;
                console.last_activity = Some(*at);
                if !message.is_empty() {
                    console.last_message = Some(message.clone());
                }
            }
            TopologyChange::AppendEvent(event) => topology.state_events.push(event.clone()),
            TopologyChange::ClearEvents => topology.state_events.clear(),
        }
        Ok(())
    }
}

fn device_mut<'a>(topology: &'a mut Topology, name: &str) -> Result<&'a mut Device> {
    topology
        .device_mut(name)
        .ok_or_else(|| OrchestratorError::UnknownDevice(name.to_string()))
}

fn link_mut<'a>(topology: &'a mut Topology, id: &LinkId) -> Result<&'a mut Link> {
    topology
        .link_mut(id)
        .ok_or_else(|| OrchestratorError::Store(format!("Unknown link {}", id)))
}

fn interface_record<'a>(topology: &'a mut Topology, slot: &InterfaceSlot) -> Result<&'a mut InterfaceRecord> {
    match slot {
        InterfaceSlot::LinkEnd { link, end } => {
            let link = link_mut(topology, link)?;
            Ok(match end {
                LinkEnd::A => &mut link.a_end_interface,
                LinkEnd::Z => &mut link.z_end_interface,
            })
        }
        InterfaceSlot::NetworkMember { network, device } => {
            let network = topology
                .network_mut(network)
                .ok_or_else(|| OrchestratorError::Store(format!("Unknown network {}", network)))?;
            network
                .devices
                .iter_mut()
                .find(|m| &m.name == device)
                .map(|m| &mut m.interface)
                .ok_or_else(|| OrchestratorError::UnknownDevice(device.clone()))
        }
    }
}

/// Persistent configuration and operational state.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read the whole lab.
    async fn snapshot(&self) -> Result<Lab>;

    /// Write one change into a topology.
    async fn update(&self, topology: &str, change: TopologyChange) -> Result<()>;
}

/// In-memory store.
pub struct MemoryStore {
    lab: RwLock<Lab>,
}

impl MemoryStore {
    pub fn new(lab: Lab) -> Self {
        Self { lab: RwLock::new(lab) }
    }

    /// Current contents.
    pub fn lab(&self) -> Result<Lab> {
        self.lab
            .read()
            .map(|lab| lab.clone())
            .map_err(|_| OrchestratorError::Internal("Lock poisoned".to_string()))
    }

    pub fn topology(&self, name: &str) -> Result<Topology> {
        self.lab()?.topology(name).cloned()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn snapshot(&self) -> Result<Lab> {
        self.lab()
    }

    async fn update(&self, topology: &str, change: TopologyChange) -> Result<()> {
        let mut lab = self
            .lab
            .write()
            .map_err(|_| OrchestratorError::Internal("Lock poisoned".to_string()))?;
        change.apply(lab.topology_mut(topology)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab() -> Lab {
        let mut topology = Topology { name: "lab".to_string(), ..Default::default() };
        for (id, name) in [(1, "r1"), (2, "r2")] {
            topology.devices.push(Device { id, name: name.to_string(), ..Default::default() });
        }
        topology.links.push(Link::new("r1", "r2"));
        topology.networks.push(Network {
            name: "lan".to_string(),
            devices: vec![NetworkMember { name: "r1".to_string(), ..Default::default() }],
            ..Default::default()
        });
        Lab { topologies: vec![topology], ..Default::default() }
    }

    #[tokio::test]
    async fn test_interface_write_back_and_clear() {
        let store = MemoryStore::new(lab());
        let slot = InterfaceSlot::LinkEnd { link: LinkId::new("r2", "r1"), end: LinkEnd::Z };
        let mac: MacAddress = "52:54:00:01:02:01".parse().unwrap();

        store
            .update(
                "lab",
                TopologyChange::Interface {
                    slot: slot.clone(),
                    patch: InterfacePatch {
                        id: Some(1),
                        host_interface: Some("vtap-2-1".to_string()),
                        mac_address: Some(mac),
                        ip_address: None,
                    },
                },
            )
            .await
            .unwrap();

        let topology = store.topology("lab").unwrap();
        let record = &topology.links[0].z_end_interface;
        assert_eq!(record.id, Some(1));
        assert_eq!(record.host_interface.as_deref(), Some("vtap-2-1"));
        assert_eq!(record.mac_address, Some(mac));

        store.update("lab", TopologyChange::ClearInterface { slot }).await.unwrap();
        let record = store.topology("lab").unwrap().links[0].z_end_interface.clone();
        assert_eq!(record.id, Some(1));
        assert!(record.host_interface.is_none());
        assert!(record.mac_address.is_none());
    }

    #[tokio::test]
    async fn test_status_and_events() {
        let store = MemoryStore::new(lab());
        store
            .update(
                "lab",
                TopologyChange::DeviceStatus {
                    device: "r1".to_string(),
                    provisioning: Some(ProvisioningStatus::Started),
                    operational: None,
                },
            )
            .await
            .unwrap();
        store
            .update(
                "lab",
                TopologyChange::AppendEvent(StateEvent {
                    timestamp: Utc::now(),
                    device: "r1".to_string(),
                    kind: EventKind::Offline,
                    detail: vec![3, 3, 3],
                }),
            )
            .await
            .unwrap();

        let topology = store.topology("lab").unwrap();
        assert_eq!(topology.devices[0].provisioning_status, ProvisioningStatus::Started);
        assert_eq!(topology.devices[0].operational_status, OperationalStatus::NotReachable);
        assert_eq!(topology.state_events.len(), 1);

        store.update("lab", TopologyChange::ClearEvents).await.unwrap();
        assert!(store.topology("lab").unwrap().state_events.is_empty());
    }

    #[tokio::test]
    async fn test_console_activity_keeps_last_message_on_blank_line() {
        let store = MemoryStore::new(lab());
        let at = Utc::now();
        for message in ["Router>", ""] {
            store
                .update(
                    "lab",
                    TopologyChange::ConsoleActivity { device: "r2".to_string(), at, message: message.to_string() },
                )
                .await
                .unwrap();
        }
        let console = store.topology("lab").unwrap().devices[1].console.clone();
        assert_eq!(console.last_activity, Some(at));
        assert_eq!(console.last_message.as_deref(), Some("Router>"));
    }

    #[tokio::test]
    async fn test_unknown_targets() {
        let store = MemoryStore::new(lab());
        let err = store
            .update("lab", TopologyChange::ClearManagement { device: "r9".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownDevice(_)));

        let err = store.update("other", TopologyChange::ClearEvents).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownTopology(_)));
    }
}
