//! Fixture shared by the integration tests: a two-hypervisor lab backed by
//! mock drivers, an in-memory store and a mock management plane.

#![allow(dead_code)]

use std::sync::Arc;

use topolab_orchestrator::{
    AuthGroup, BackendKind, Device, DeviceDefinition, Hypervisor, Lab, ManagementNetwork, MemoryRenderer,
    MemoryStore, MockConnector, MockDeviceManager, Orchestrator, OrchestratorSettings, Topology,
};
use topolab_virt::{MockDriver, MockPackager};

pub const TOPOLOGY: &str = "lab";

fn hypervisor(name: &str, mgmt_start: &str) -> Hypervisor {
    Hypervisor {
        name: name.to_string(),
        host: Some(format!("{}.example.net", name)),
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

/// Lab with devices given as (id, name, hypervisor), all on definition `vm`.
pub fn lab(devices: &[(u32, &str, &str)], managed: bool) -> Lab {
    Lab {
        default_hypervisor: Some("hv1".to_string()),
        hypervisors: vec![hypervisor("hv1", "10.0.0.0"), hypervisor("hv2", "10.0.1.0")],
        device_definitions: vec![DeviceDefinition {
            name: "vm".to_string(),
            base_image: Some("base.qcow2".to_string()),
            managed,
            authgroup: Some("default".to_string()),
            ..Default::default()
        }],
        authgroups: vec![AuthGroup {
            name: "default".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        }],
        topologies: vec![Topology {
            name: TOPOLOGY.to_string(),
            devices: devices
                .iter()
                .map(|(id, name, hv)| Device {
                    id: *id,
                    name: name.to_string(),
                    definition: "vm".to_string(),
                    hypervisor: Some(hv.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }],
    }
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub connector: Arc<MockConnector>,
    pub manager: Arc<MockDeviceManager>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Fixture {
    pub fn new(lab: Lab) -> Self {
        let store = Arc::new(MemoryStore::new(lab));
        let connector = Arc::new(MockConnector::new());
        for hv in ["hv1", "hv2"] {
            connector.insert(
                hv,
                BackendKind::Libvirt,
                MockDriver::new(format!("{}-libvirt", hv)).with_volume("default", "base.qcow2"),
            );
        }
        let manager = Arc::new(MockDeviceManager::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            connector.clone(),
            Arc::new(MemoryRenderer::new()),
            Arc::new(MockPackager),
            manager.clone(),
        )
        .with_settings(OrchestratorSettings {
            shutdown_poll_secs: 1,
            shutdown_timeout_secs: 3,
            settle_secs: 0,
        });

        Self { store, connector, manager, orchestrator: Arc::new(orchestrator) }
    }

    pub fn driver(&self, hypervisor: &str) -> Arc<MockDriver> {
        self.connector.driver(hypervisor, BackendKind::Libvirt)
    }

    pub fn topology(&self) -> Topology {
        self.store.topology(TOPOLOGY).expect("topology exists")
    }
}
