//! End-to-end lifecycle tests against mock backends.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{lab, Fixture, TOPOLOGY};
use tokio::time::Instant;
use topolab_orchestrator::{
    Action, Actions, BackendKind, Link, LinkId, LinkVerb, MonitorControl, Network, NetworkMember, OrchestratorError,
    ProvisioningStatus, ResourceAllocator, TopologyVerb,
};
use topolab_virt::{InterfaceSource, MockDriver, ResourceRef};

fn pair() -> Fixture {
    let mut lab = lab(&[(1, "A", "hv1"), (2, "Z", "hv1")], false);
    lab.topologies[0].links.push(Link::new("A", "Z"));
    Fixture::new(lab)
}

/// Test that define and start realize one link network and two domains.
#[tokio::test]
async fn test_define_and_start_two_devices() {
    let fixture = pair();
    let actions = Actions::new(fixture.orchestrator.clone());

    let report = actions.topology(TOPOLOGY, TopologyVerb::Define, None, false).await.unwrap();
    assert!(report.is_success(), "{}", report);
    let report = actions.topology(TOPOLOGY, TopologyVerb::Start, None, false).await.unwrap();
    assert!(report.is_success(), "{}", report);

    let driver = fixture.driver("hv1");
    assert_eq!(driver.network_names(), vec!["net-1-2", "net-1-null", "net-2-null"]);
    assert_eq!(driver.domain_names(), vec!["A", "Z"]);
    assert!(driver.is_active(&ResourceRef::network("net-1-2")));
    assert!(driver.is_active(&ResourceRef::domain("A")));

    for name in ["A", "Z"] {
        let domain = driver.domain(name).unwrap();
        assert_eq!(domain.interfaces.len(), 1);
        assert_eq!(domain.interfaces[0].source, InterfaceSource::Network("net-1-2".to_string()));
    }

    let topology = fixture.topology();
    assert_eq!(topology.provisioning_status, ProvisioningStatus::Started);
    assert_eq!(topology.devices[0].management_interface.ip_address.as_deref(), Some("10.0.0.1"));
    assert_eq!(topology.devices[1].management_interface.ip_address.as_deref(), Some("10.0.0.2"));
    assert_eq!(topology.devices[0].provisioning_status, ProvisioningStatus::Unmanaged);
    assert_eq!(topology.links[0].host_bridge.as_deref(), Some("vbr-1-2"));
    assert_eq!(topology.links[0].a_end_interface.host_interface.as_deref(), Some("vtap-1-2"));
}

/// Test that repeating define and start changes nothing.
#[tokio::test]
async fn test_actions_are_idempotent() {
    let fixture = pair();
    let orchestrator = &fixture.orchestrator;

    orchestrator.run(TOPOLOGY, Action::Define, None).await.unwrap();
    let driver = fixture.driver("hv1");
    let defined = driver.calls("define_domain");
    let volumes = driver.calls("create_volume");

    orchestrator.run(TOPOLOGY, Action::Define, None).await.unwrap();
    assert_eq!(driver.calls("define_domain"), defined);
    assert_eq!(driver.calls("create_volume"), volumes);

    orchestrator.run(TOPOLOGY, Action::Create, None).await.unwrap();
    let created = driver.calls("create");
    orchestrator.run(TOPOLOGY, Action::Create, None).await.unwrap();
    assert_eq!(driver.calls("create"), created);
    // Three networks and two domains
    assert_eq!(created, 5);
}

/// Records monitor schedule calls.
#[derive(Default)]
struct RecordingMonitor {
    calls: Mutex<Vec<String>>,
}

impl RecordingMonitor {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MonitorControl for RecordingMonitor {
    async fn schedule(&self, topology: &str) -> topolab_orchestrator::Result<()> {
        self.calls.lock().unwrap().push(format!("schedule {}", topology));
        Ok(())
    }

    async fn unschedule(&self, topology: &str) -> topolab_orchestrator::Result<()> {
        self.calls.lock().unwrap().push(format!("unschedule {}", topology));
        Ok(())
    }
}

/// Test that undefine leaves a running topology and its records alone.
#[tokio::test]
async fn test_undefine_requires_stopped_topology() {
    let fixture = pair();
    let monitor = Arc::new(RecordingMonitor::default());
    let actions = Actions::new(fixture.orchestrator.clone()).with_monitor(monitor.clone());
    actions.topology(TOPOLOGY, TopologyVerb::Define, None, false).await.unwrap();
    actions.topology(TOPOLOGY, TopologyVerb::Start, None, false).await.unwrap();

    let report = actions.topology(TOPOLOGY, TopologyVerb::Undefine, None, false).await.unwrap();
    assert_eq!(report.rejected, vec!["A", "Z"]);
    assert_eq!(monitor.calls(), vec!["schedule lab"]);

    let driver = fixture.driver("hv1");
    assert_eq!(driver.domain_names(), vec!["A", "Z"]);
    assert!(driver.volume("default", "A.qcow2").is_some());

    let topology = fixture.topology();
    assert_eq!(topology.provisioning_status, ProvisioningStatus::Started);
    assert_eq!(topology.devices[0].provisioning_status, ProvisioningStatus::Unmanaged);
    assert_eq!(topology.devices[0].management_interface.ip_address.as_deref(), Some("10.0.0.1"));
    assert_eq!(topology.links[0].host_bridge.as_deref(), Some("vbr-1-2"));

    actions.topology(TOPOLOGY, TopologyVerb::Stop, None, false).await.unwrap();
    let report = actions.topology(TOPOLOGY, TopologyVerb::Undefine, None, false).await.unwrap();
    assert!(report.rejected.is_empty());
    assert_eq!(monitor.calls(), vec!["schedule lab", "unschedule lab", "unschedule lab"]);

    assert!(driver.domain_names().is_empty());
    assert!(driver.network_names().is_empty());
    assert!(driver.volume("default", "A.qcow2").is_none());
    assert!(driver.volume("default", "base.qcow2").is_some());

    let topology = fixture.topology();
    assert_eq!(topology.provisioning_status, ProvisioningStatus::Undefined);
    assert_eq!(topology.devices[0].provisioning_status, ProvisioningStatus::Undefined);
    assert!(topology.devices[0].management_interface.ip_address.is_none());
    assert!(topology.links[0].host_bridge.is_none());
}

/// Test that an unreachable hypervisor only fails its own devices.
#[tokio::test]
async fn test_unreachable_hypervisor_is_isolated() {
    let fixture = Fixture::new(lab(&[(1, "r1", "hv1"), (2, "r2", "hv2"), (3, "r3", "hv1")], false));
    fixture.connector.set_unreachable("hv2");

    let report = fixture.orchestrator.run(TOPOLOGY, Action::Define, None).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failures.keys().collect::<Vec<_>>(), vec!["r2"]);
    assert!(report.failures["r2"].contains("hv2"));
    assert_eq!(fixture.driver("hv1").domain_names(), vec!["r1", "r3"]);
    assert!(fixture.driver("hv2").domain_names().is_empty());
}

/// Test that an interface claimed twice aborts before any backend call.
#[tokio::test]
async fn test_interface_conflict_aborts_run() {
    let mut lab = lab(&[(1, "A", "hv1"), (2, "Z", "hv1"), (3, "B", "hv1")], false);
    let mut first = Link::new("A", "Z");
    first.a_end_interface.id = Some(0);
    let mut second = Link::new("A", "B");
    second.a_end_interface.id = Some(0);
    lab.topologies[0].links = vec![first, second];
    let fixture = Fixture::new(lab);

    let err = fixture.orchestrator.run(TOPOLOGY, Action::Define, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ConfigurationConflict { device: 1, interface: 0 }));
    assert_eq!(fixture.driver("hv1").mutations(), 0);
}

/// Test the start guard and its force override.
#[tokio::test]
async fn test_start_requires_defined_topology() {
    let fixture = pair();
    let actions = Actions::new(fixture.orchestrator.clone());

    let report = actions.topology(TOPOLOGY, TopologyVerb::Start, None, false).await.unwrap();
    assert!(report.backends.is_empty());
    assert_eq!(fixture.driver("hv1").mutations(), 0);
    assert_eq!(fixture.topology().provisioning_status, ProvisioningStatus::Undefined);

    // A single device bypasses the guard
    actions.topology(TOPOLOGY, TopologyVerb::Define, Some("A"), false).await.unwrap();
    assert_eq!(fixture.driver("hv1").domain_names(), vec!["A"]);
    assert_eq!(fixture.topology().provisioning_status, ProvisioningStatus::Undefined);

    actions.topology(TOPOLOGY, TopologyVerb::Define, None, false).await.unwrap();
    actions.topology(TOPOLOGY, TopologyVerb::Start, None, false).await.unwrap();
    let created = fixture.driver("hv1").calls("create");

    actions.topology(TOPOLOGY, TopologyVerb::Start, None, false).await.unwrap();
    assert_eq!(fixture.driver("hv1").calls("create"), created);
    actions.topology(TOPOLOGY, TopologyVerb::Start, None, true).await.unwrap();
    assert_eq!(fixture.driver("hv1").calls("create"), created);
}

/// Test that reboot and hard reset bring the devices back up.
#[tokio::test]
async fn test_reboot_and_hard_reset() {
    let fixture = pair();
    let actions = Actions::new(fixture.orchestrator.clone());
    actions.topology(TOPOLOGY, TopologyVerb::Define, None, false).await.unwrap();
    actions.topology(TOPOLOGY, TopologyVerb::Start, None, false).await.unwrap();
    let driver = fixture.driver("hv1");

    actions.topology(TOPOLOGY, TopologyVerb::Reboot, Some("Z"), false).await.unwrap();
    assert_eq!(driver.calls("shutdown"), 1);
    assert!(driver.is_active(&ResourceRef::domain("Z")));

    actions.topology(TOPOLOGY, TopologyVerb::HardReset, None, false).await.unwrap();
    assert_eq!(driver.calls("undefine"), 5);
    assert!(driver.is_active(&ResourceRef::domain("A")));
    assert!(driver.is_active(&ResourceRef::network("net-1-2")));
    assert_eq!(fixture.topology().provisioning_status, ProvisioningStatus::Started);
}

/// Single started device whose guest keeps running for `reads` state
/// reads after a shutdown.
async fn slow_guest(reads: usize, graceful: bool) -> (Fixture, Arc<MockDriver>) {
    let fixture = Fixture::new(lab(&[(1, "A", "hv1")], false));
    let driver = fixture.connector.insert(
        "hv1",
        BackendKind::Libvirt,
        MockDriver::new("hv1-libvirt")
            .with_volume("default", "base.qcow2")
            .with_shutdown_delay(reads)
            .with_graceful_shutdown(graceful),
    );
    for action in [Action::Define, Action::Create] {
        fixture.orchestrator.run(TOPOLOGY, action, None).await.unwrap();
    }
    (fixture, driver)
}

/// Test that the shutdown wait polls once per interval until the guest is off.
#[tokio::test(start_paused = true)]
async fn test_shutdown_wait_polls_until_inactive() {
    let (fixture, driver) = slow_guest(2, true).await;
    fixture.orchestrator.run(TOPOLOGY, Action::Shutdown, None).await.unwrap();
    assert!(driver.is_active(&ResourceRef::domain("A")));

    let reads = driver.calls("state");
    let start = Instant::now();
    fixture.orchestrator.wait_for_shutdown(TOPOLOGY, None).await.unwrap();

    assert_eq!(driver.calls("state") - reads, 3);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert!(!driver.is_active(&ResourceRef::domain("A")));
}

/// Test that stop gives up waiting at the timeout and forces the guest off.
#[tokio::test(start_paused = true)]
async fn test_stop_destroys_after_timeout() {
    let (fixture, driver) = slow_guest(10, true).await;

    let start = Instant::now();
    let report = fixture.orchestrator.stop(TOPOLOGY, None).await.unwrap();

    assert!(report.is_success(), "{}", report);
    // Polls at 0, 1, 2 and 3 seconds, then the timeout
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(driver.calls("shutdown"), 1);
    assert!(!driver.is_active(&ResourceRef::domain("A")));
    assert_eq!(fixture.topology().devices[0].provisioning_status, ProvisioningStatus::Defined);
}

/// Test that backends without graceful shutdown are not waited for.
#[tokio::test(start_paused = true)]
async fn test_stop_skips_wait_without_graceful_shutdown() {
    let (fixture, driver) = slow_guest(10, false).await;

    let start = Instant::now();
    fixture.orchestrator.stop(TOPOLOGY, None).await.unwrap();

    assert_eq!(start.elapsed(), Duration::ZERO);
    assert!(!driver.is_active(&ResourceRef::domain("A")));
}

/// Test that explicit network MACs count external bridge networks in the list.
#[tokio::test]
async fn test_explicit_network_mac_follows_list_position() {
    let member = |name: &str| NetworkMember { name: name.to_string(), ..Default::default() };
    let mut lab = lab(&[(1, "A", "hv1"), (2, "Z", "hv1")], false);
    lab.topologies[0].networks = vec![
        Network {
            name: "wan".to_string(),
            external_bridge: Some("br-wan".to_string()),
            interface_id: Some(5),
            devices: vec![member("A")],
            ..Default::default()
        },
        Network {
            name: "lan".to_string(),
            interface_id: Some(6),
            devices: vec![member("A"), member("Z")],
            ..Default::default()
        },
    ];
    let fixture = Fixture::new(lab);

    let report = fixture.orchestrator.run(TOPOLOGY, Action::Define, None).await.unwrap();
    assert!(report.is_success(), "{}", report);

    let driver = fixture.driver("hv1");
    assert!(driver.network("net-wan").is_none());
    assert_eq!(driver.network("net-lan").unwrap().mac_address.to_string(), "52:54:00:00:fe:fe");
}

/// Test link verbs against the link network.
#[tokio::test]
async fn test_link_verbs() {
    let fixture = pair();
    let actions = Actions::new(fixture.orchestrator.clone());
    actions.topology(TOPOLOGY, TopologyVerb::Define, None, false).await.unwrap();
    actions.topology(TOPOLOGY, TopologyVerb::Start, None, false).await.unwrap();
    let link = LinkId::new("A", "Z");
    let driver = fixture.driver("hv1");

    actions.link(TOPOLOGY, &link, LinkVerb::Stop).await.unwrap();
    assert!(!driver.is_active(&ResourceRef::network("net-1-2")));
    actions.link(TOPOLOGY, &link, LinkVerb::Start).await.unwrap();
    assert!(driver.is_active(&ResourceRef::network("net-1-2")));

    actions.link(TOPOLOGY, &link, LinkVerb::SetDelay(25)).await.unwrap();
    assert_eq!(driver.network("net-1-2").unwrap().delay_ms, Some(25));
    assert_eq!(fixture.topology().links[0].delay, Some(25));
}

/// Test that derived addresses stay within the management range.
#[test]
fn test_management_addresses_follow_device_ids() {
    let lab = lab(&[], false);
    let allocator = ResourceAllocator::new(&lab.hypervisors[1]).unwrap();
    assert_eq!(allocator.mgmt_ip(7).unwrap().to_string(), "10.0.1.7");
}
