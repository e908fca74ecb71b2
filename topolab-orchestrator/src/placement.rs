//! Device to hypervisor placement.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use crate::error::{OrchestratorError, Result};
use crate::model::{Lab, Topology};

/// Which hypervisor each device of a topology runs on.
#[derive(Debug, Clone)]
pub struct Placement {
    ids: BTreeMap<String, u32>,
    hypervisors: BTreeMap<u32, String>,
    external_bridges: BTreeMap<String, Option<String>>,
    tunnel_addresses: BTreeMap<String, Ipv4Addr>,
}

impl Placement {
    /// A device runs on its own hypervisor, else the topology's, else the
    /// lab default.
    pub fn new(lab: &Lab, topology: &Topology) -> Result<Self> {
        let default = lab.topology_hypervisor(topology)?.name.clone();

        let mut ids = BTreeMap::new();
        let mut hypervisors = BTreeMap::new();
        for device in &topology.devices {
            let hypervisor = device.hypervisor.clone().unwrap_or_else(|| default.clone());
            lab.hypervisor(&hypervisor)?;
            if ids.insert(device.name.clone(), device.id).is_some() {
                return Err(OrchestratorError::Configuration(format!(
                    "Duplicate device name {}",
                    device.name
                )));
            }
            if hypervisors.insert(device.id, hypervisor).is_some() {
                return Err(OrchestratorError::Configuration(format!("Duplicate device id {}", device.id)));
            }
        }

        let external_bridges = lab
            .hypervisors
            .iter()
            .map(|h| (h.name.clone(), h.external_bridge.clone()))
            .collect();

        let tunnel_addresses = lab
            .hypervisors
            .iter()
            .filter_map(|h| h.udp_tunnel_address.map(|address| (h.name.clone(), address)))
            .collect();

        Ok(Self { ids, hypervisors, external_bridges, tunnel_addresses })
    }

    pub fn device_id(&self, name: &str) -> Result<u32> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| OrchestratorError::UnknownDevice(name.to_string()))
    }

    pub fn hypervisor_of(&self, device_id: u32) -> Result<&str> {
        self.hypervisors
            .get(&device_id)
            .map(String::as_str)
            .ok_or_else(|| OrchestratorError::UnknownDevice(device_id.to_string()))
    }

    pub fn external_bridge(&self, hypervisor: &str) -> Option<&str> {
        self.external_bridges.get(hypervisor).and_then(|b| b.as_deref())
    }

    /// UDP tunnel address of a hypervisor that wires its links as tunnels.
    pub fn tunnel_address(&self, hypervisor: &str) -> Option<Ipv4Addr> {
        self.tunnel_addresses.get(hypervisor).copied()
    }

    /// Distinct hypervisors hosting the given devices, sorted by name.
    pub fn hypervisors_of(&self, device_ids: impl IntoIterator<Item = u32>) -> BTreeSet<String> {
        device_ids
            .into_iter()
            .filter_map(|id| self.hypervisors.get(&id).cloned())
            .collect()
    }

    /// Every hypervisor in use by the topology.
    pub fn all_hypervisors(&self) -> BTreeSet<String> {
        self.hypervisors.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, Hypervisor};

    fn lab() -> Lab {
        Lab {
            default_hypervisor: Some("hv1".to_string()),
            hypervisors: vec![
                Hypervisor { name: "hv1".to_string(), ..Default::default() },
                Hypervisor {
                    name: "hv2".to_string(),
                    external_bridge: Some("br-ext".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn device(id: u32, name: &str, hypervisor: Option<&str>) -> Device {
        Device {
            id,
            name: name.to_string(),
            hypervisor: hypervisor.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_device_override_and_default() {
        let topology = Topology {
            name: "lab".to_string(),
            devices: vec![device(1, "r1", None), device(2, "r2", Some("hv2"))],
            ..Default::default()
        };
        let placement = Placement::new(&lab(), &topology).unwrap();
        assert_eq!(placement.hypervisor_of(1).unwrap(), "hv1");
        assert_eq!(placement.hypervisor_of(2).unwrap(), "hv2");
        assert_eq!(placement.external_bridge("hv2"), Some("br-ext"));
        assert_eq!(placement.external_bridge("hv1"), None);
        assert_eq!(placement.hypervisors_of([1, 2, 1]).len(), 2);
    }

    #[test]
    fn test_unknown_hypervisor_and_duplicates() {
        let topology = Topology {
            name: "lab".to_string(),
            devices: vec![device(1, "r1", Some("hv9"))],
            ..Default::default()
        };
        assert!(matches!(
            Placement::new(&lab(), &topology),
            Err(OrchestratorError::UnknownHypervisor(_))
        ));

        let topology = Topology {
            name: "lab".to_string(),
            devices: vec![device(1, "r1", None), device(1, "r2", None)],
            ..Default::default()
        };
        assert!(Placement::new(&lab(), &topology).is_err());
    }
}
