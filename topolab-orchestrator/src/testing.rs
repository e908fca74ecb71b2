//! Shared fixtures for unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use topolab_virt::{MockDriver, MockPackager};

use crate::allocator::ResourceAllocator;
use crate::cache::{BackendCache, BackendKind, MockConnector};
use crate::lifecycle::RunContext;
use crate::manager::MockDeviceManager;
use crate::model::*;
use crate::placement::Placement;
use crate::profiles::ProfileRegistry;
use crate::resolver::NetworkResolver;
use crate::store::MemoryStore;
use crate::template::MemoryRenderer;

/// A two-hypervisor lab with one topology named `lab` and mock
/// collaborators for every seam.
pub(crate) struct Harness {
    pub lab: Lab,
    pub connector: Arc<MockConnector>,
    pub store: MemoryStore,
    pub renderer: MemoryRenderer,
    pub packager: MockPackager,
    pub manager: MockDeviceManager,
    pub profiles: ProfileRegistry,
}

fn hypervisor(name: &str, mgmt_start: &str) -> Hypervisor {
    Hypervisor {
        name: name.to_string(),
        host: Some(format!("{}.example.net", name)),
        username: Some("lab".to_string()),
        external_bridge: Some(format!("br-{}", name)),
        management_network: ManagementNetwork {
            bridge: "mgmt".to_string(),
            ip_address_start: mgmt_start.parse().ok(),
            ..Default::default()
        },
        images_dir: "/images".to_string(),
        ..Default::default()
    }
}

impl Harness {
    /// Devices as (id, name, hypervisor override), all on definition `vm`.
    pub fn new(devices: &[(u32, &str, Option<&str>)]) -> Self {
        let topology = Topology {
            name: "lab".to_string(),
            devices: devices
                .iter()
                .map(|(id, name, hv)| Device {
                    id: *id,
                    name: name.to_string(),
                    definition: "vm".to_string(),
                    hypervisor: hv.map(str::to_string),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let lab = Lab {
            default_hypervisor: Some("hv1".to_string()),
            hypervisors: vec![hypervisor("hv1", "10.0.0.0"), hypervisor("hv2", "10.0.1.0")],
            device_definitions: vec![DeviceDefinition {
                name: "vm".to_string(),
                template: "generic".to_string(),
                base_image: Some("base.qcow2".to_string()),
                managed: false,
                ..Default::default()
            }],
            authgroups: vec![AuthGroup {
                name: "default".to_string(),
                username: "admin".to_string(),
                password: "admin".to_string(),
            }],
            topologies: vec![topology],
        };

        let connector = Arc::new(MockConnector::new());
        for hv in ["hv1", "hv2"] {
            connector.insert(
                hv,
                BackendKind::Libvirt,
                MockDriver::new(format!("{}-libvirt", hv)).with_volume("default", "base.qcow2"),
            );
        }

        Self {
            store: MemoryStore::new(lab.clone()),
            lab,
            connector,
            renderer: MemoryRenderer::new(),
            packager: MockPackager,
            manager: MockDeviceManager::new(),
            profiles: ProfileRegistry::new(),
        }
    }

    /// Edit the topology; the store is reseeded.
    pub fn with(mut self, edit: impl FnOnce(&mut Topology)) -> Self {
        if let Some(topology) = self.lab.topologies.first_mut() {
            edit(topology);
        }
        self.store = MemoryStore::new(self.lab.clone());
        self
    }

    /// Add or replace a device definition; the store is reseeded.
    pub fn with_definition(mut self, definition: DeviceDefinition) -> Self {
        self.lab.device_definitions.retain(|d| d.name != definition.name);
        self.lab.device_definitions.push(definition);
        self.store = MemoryStore::new(self.lab.clone());
        self
    }

    pub fn with_renderer(mut self, renderer: MemoryRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Resolve the current lab for one run.
    pub fn run(&self) -> Run<'_> {
        let lab = self.store.lab().unwrap();
        let topology = lab.topology("lab").unwrap().clone();
        let placement = Placement::new(&lab, &topology).unwrap();
        let resolver = NetworkResolver::new(&topology, &placement).unwrap();
        let allocators = lab
            .hypervisors
            .iter()
            .map(|h| (h.name.clone(), ResourceAllocator::new(h).unwrap()))
            .collect();
        Run {
            harness: self,
            cache: BackendCache::new(self.connector.clone(), &lab),
            lab,
            topology,
            placement,
            resolver,
            allocators,
        }
    }
}

pub(crate) struct Run<'h> {
    harness: &'h Harness,
    lab: Lab,
    topology: Topology,
    placement: Placement,
    resolver: NetworkResolver,
    allocators: BTreeMap<String, ResourceAllocator>,
    cache: BackendCache,
}

impl Run<'_> {
    pub fn context(&self) -> RunContext<'_> {
        RunContext {
            lab: &self.lab,
            topology: &self.topology,
            placement: &self.placement,
            resolver: &self.resolver,
            allocators: &self.allocators,
            profiles: &self.harness.profiles,
            cache: &self.cache,
            store: &self.harness.store,
            renderer: &self.harness.renderer,
            packager: &self.harness.packager,
            manager: &self.harness.manager,
        }
    }
}
