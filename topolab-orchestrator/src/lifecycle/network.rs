//! Virtual network specs and their controller.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use topolab_virt::{MacAddress, NetworkDefinition, ResourceRef, ResourceState};

use super::{action_allowed, live_state, Action, ActionReport, DeviceContext, NetworkController, RunContext};
use crate::cache::BackendKind;
use crate::error::{OrchestratorError, Result};
use crate::model::{Link, LinkId};
use crate::names;
use crate::store::TopologyChange;

/// Topology record a network writes its bridge and MAC back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkOwner {
    Link(LinkId),
    Network(String),
    None,
}

/// One backend network to realize on one hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub id: String,
    pub hypervisor: String,
    pub mac_address: MacAddress,
    pub isolated: bool,
    pub delay: Option<u32>,
    pub owner: NetworkOwner,
}

impl NetworkSpec {
    pub fn name(&self) -> String {
        names::network_name(&self.id)
    }

    pub fn bridge(&self) -> String {
        names::bridge_name(&self.id)
    }

    pub fn definition(&self) -> NetworkDefinition {
        NetworkDefinition::new(self.name(), self.bridge(), self.mac_address)
            .with_isolated(self.isolated)
            .with_delay(self.delay)
    }

    /// Network of a link whose ends share a hypervisor; `None` for a link
    /// that crosses hypervisors.
    pub fn link(ctx: &RunContext<'_>, link: &Link) -> Result<Option<Self>> {
        let (id, pair) = ctx.resolver.link_network(link, ctx.placement)?;
        let Some(id) = id else {
            return Ok(None);
        };
        let hypervisor = ctx.placement.hypervisor_of(pair.0)?;
        Ok(Some(Self {
            id,
            hypervisor: hypervisor.to_string(),
            mac_address: ctx.allocator(hypervisor)?.mac(pair.0, pair.1, false)?,
            isolated: false,
            delay: link.delay,
            owner: NetworkOwner::Link(link.id()),
        }))
    }

    /// Isolated sink for a device's unconnected interfaces.
    pub fn isolated(device: &DeviceContext<'_>) -> Result<Self> {
        let id = device.device.id;
        Ok(Self {
            id: names::network_id(id, None),
            hypervisor: device.hypervisor.name.clone(),
            mac_address: device.allocator.mac(id, 0x00, false)?,
            isolated: true,
            delay: None,
            owner: NetworkOwner::None,
        })
    }

    /// A named network spanning every hypervisor that hosts one of
    /// `device_ids` (default: the members of the explicit network `name`).
    /// The n-th hypervisor in name order shifts the first octet down by
    /// `0x10 * n`.
    pub fn extra(
        ctx: &RunContext<'_>,
        name: &str,
        device_ids: Option<Vec<u32>>,
        owner: NetworkOwner,
        octets: (u32, u32),
    ) -> Result<Vec<Self>> {
        let ids = device_ids.unwrap_or_else(|| ctx.resolver.network_devices(name));
        let hypervisors: BTreeSet<String> = ctx.placement.hypervisors_of(ids);

        hypervisors
            .into_iter()
            .enumerate()
            .map(|(idx, hypervisor)| {
                let first = (idx as u32)
                    .checked_mul(0x10)
                    .and_then(|shift| octets.0.checked_sub(shift))
                    .ok_or_else(|| {
                        OrchestratorError::Allocation(format!("Network {} spans too many hypervisors", name))
                    })?;
                Ok(Self {
                    id: name.to_string(),
                    mac_address: ctx.allocator(&hypervisor)?.mac(first, octets.1, false)?,
                    hypervisor,
                    isolated: false,
                    delay: None,
                    owner: owner.clone(),
                })
            })
            .collect()
    }

    /// Out-of-band networks one device needs before its domain is defined.
    pub fn for_device(ctx: &RunContext<'_>, device: &DeviceContext<'_>) -> Result<Vec<Self>> {
        let id = device.device.id;
        let mut specs = Vec::new();
        for (name, octets) in device.profile.device_network_plan(id, device.device.control_plane_id) {
            specs.extend(Self::extra(ctx, &name, Some(vec![id]), NetworkOwner::None, octets)?);
        }
        if device.profile.is_vm() {
            specs.push(Self::isolated(device)?);
        }
        Ok(specs)
    }

    /// Networks shared by every device of a type, e.g. the XRv 9000
    /// control and host networks.
    pub fn for_topology(ctx: &RunContext<'_>) -> Result<Vec<Self>> {
        let mut device_types: BTreeSet<&str> = BTreeSet::new();
        let mut definitions = Vec::new();
        for device in &ctx.topology.devices {
            let definition = ctx.lab.definition(&device.definition)?;
            definitions.push((device.id, definition.device_type.as_str()));
            device_types.insert(definition.device_type.as_str());
        }

        let mut specs = Vec::new();
        for device_type in device_types {
            let profile = ctx.profiles.get(device_type);
            let ids: Vec<u32> = definitions
                .iter()
                .filter(|(_, t)| *t == device_type)
                .map(|(id, _)| *id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            for (idx, name) in profile.topology_networks.iter().enumerate() {
                let last = 0xff_u32.checked_sub(idx as u32).ok_or_else(|| {
                    OrchestratorError::Allocation(format!("Too many topology networks for {}", device_type))
                })?;
                specs.extend(Self::extra(ctx, name, Some(ids.clone()), NetworkOwner::None, (0xff, last))?);
            }
        }
        Ok(specs)
    }

    /// Store change recording where this network landed, if it has an owner.
    fn write_back(&self, defined: bool) -> Option<TopologyChange> {
        let (host_bridge, mac_address) = if defined {
            (Some(self.bridge()), Some(self.mac_address))
        } else {
            (None, None)
        };
        match &self.owner {
            NetworkOwner::Link(link) => Some(TopologyChange::LinkBridge {
                link: link.clone(),
                host_bridge,
                mac_address,
            }),
            NetworkOwner::Network(network) => Some(TopologyChange::NetworkBridge {
                network: network.clone(),
                host_bridge,
                mac_address,
            }),
            NetworkOwner::None => None,
        }
    }
}

/// Networks on a hypervisor's libvirt connection.
pub struct VirtualNetworks;

#[async_trait]
impl NetworkController for VirtualNetworks {
    #[instrument(skip(self, ctx, network, report), fields(network = %network.id, hypervisor = %network.hypervisor, action = %action))]
    async fn apply(
        &self,
        ctx: &RunContext<'_>,
        network: &NetworkSpec,
        action: Action,
        report: &mut ActionReport,
    ) -> Result<()> {
        let connection = ctx.connection(&network.hypervisor, BackendKind::Libvirt).await?;
        let resource = ResourceRef::network(network.name());
        let state = live_state(&connection, &resource).await?;

        match action {
            Action::Define => {
                if state == ResourceState::Absent {
                    connection.driver.define_network(&network.definition()).await?;
                    report.network(&network.hypervisor, network.name());
                    info!(bridge = %network.bridge(), mac = %network.mac_address, "Defined network");
                }
                if let Some(change) = network.write_back(true) {
                    ctx.write(change).await?;
                }
            }
            Action::Update => {
                if action_allowed(state, action) {
                    connection.driver.update_network(&network.definition()).await?;
                    report.network(&network.hypervisor, network.name());
                    info!(delay = ?network.delay, "Updated network");
                }
            }
            // Networks have no guest to shut down
            Action::Shutdown => {}
            Action::Create | Action::Destroy | Action::Undefine => {
                let ran = action_allowed(state, action);
                if ran {
                    if let Some(power) = action.power() {
                        connection.driver.apply(&resource, power).await?;
                    }
                    report.network(&network.hypervisor, network.name());
                    info!("Network {}", action);
                } else {
                    debug!(state = ?state, "Network action not applicable");
                }
                // An active network keeps its bridge record
                if action == Action::Undefine && (ran || state == ResourceState::Absent) {
                    if let Some(change) = network.write_back(false) {
                        ctx.write(change).await?;
                    }
                }
            }
        }
        Ok(())
    }
}
