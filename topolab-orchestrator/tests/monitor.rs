//! Monitor tests: probe hysteresis through the supervisor, the status
//! check and the monitor lifecycle driven by operator verbs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{lab, Fixture, TOPOLOGY};
use topolab_orchestrator::{
    Actions, EventKind, MonitorRegistry, MonitorSettings, OperationalStatus, ProvisioningStatus, ScriptedProber,
    TopologyVerb,
};

fn settings() -> MonitorSettings {
    MonitorSettings { interval_secs: 10, threshold: 2, ..Default::default() }
}

/// Fixture with one managed, started device at 10.0.0.1.
fn started() -> Fixture {
    let mut lab = lab(&[(1, "r1", "hv1")], true);
    let topology = &mut lab.topologies[0];
    topology.provisioning_status = ProvisioningStatus::Started;
    topology.devices[0].provisioning_status = ProvisioningStatus::Started;
    topology.devices[0].management_interface.ip_address = Some("10.0.0.1".to_string());
    Fixture::new(lab)
}

/// Test that an outage is recorded as offline then online by the supervisor.
#[tokio::test(start_paused = true)]
async fn test_outage_is_recorded() {
    let fixture = started();
    // Locked devices skip probing in the status check
    fixture.manager.lock("r1");
    let prober = Arc::new(ScriptedProber::new());
    prober.push("10.0.0.1", 3);
    prober.push("10.0.0.1", 2);
    let registry = MonitorRegistry::new(fixture.orchestrator.clone(), prober.clone(), settings());

    let id = registry.start(TOPOLOGY).await.unwrap();
    assert_eq!(registry.start(TOPOLOGY).await.unwrap(), id);
    assert!(registry.status(TOPOLOGY).await.running);

    tokio::time::sleep(Duration::from_secs(25)).await;
    let written = registry.stop(TOPOLOGY).await.unwrap();

    // ready + topology status, then offline and online with their status writes
    assert_eq!(written, Some(6));
    assert_eq!(prober.probes().len(), 3);
    assert!(!registry.status(TOPOLOGY).await.running);
    assert_eq!(registry.stop(TOPOLOGY).await.unwrap(), None);

    let topology = fixture.topology();
    let kinds: Vec<EventKind> = topology.state_events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Offline, EventKind::Online]);
    assert_eq!(topology.state_events[0].detail, vec![3, 2]);
    assert_eq!(topology.devices[0].operational_status, OperationalStatus::Reachable);
    assert_eq!(topology.devices[0].provisioning_status, ProvisioningStatus::Ready);
    assert_eq!(topology.provisioning_status, ProvisioningStatus::Ready);

    registry.clear(TOPOLOGY).await.unwrap();
    assert!(fixture.topology().state_events.is_empty());
}

/// Test that a single pass synchronizes reachable devices.
#[tokio::test]
async fn test_single_pass() {
    let fixture = started();
    let registry = MonitorRegistry::new(fixture.orchestrator.clone(), Arc::new(ScriptedProber::new()), settings());

    let report = registry.once(TOPOLOGY).await.unwrap();
    assert!(report.is_ready());
    assert_eq!(fixture.manager.calls(), vec!["fetch-host-keys r1", "sync-from r1"]);

    let topology = fixture.topology();
    assert_eq!(topology.devices[0].operational_status, OperationalStatus::Reachable);
    assert_eq!(topology.devices[0].provisioning_status, ProvisioningStatus::Ready);
    assert_eq!(topology.provisioning_status, ProvisioningStatus::Ready);
    assert!(topology.state_events.is_empty());
}

/// Test that start schedules the monitor and stop removes it.
#[tokio::test]
async fn test_verbs_schedule_monitor() {
    let fixture = Fixture::new(lab(&[(1, "r1", "hv1")], true));
    let registry = Arc::new(MonitorRegistry::new(
        fixture.orchestrator.clone(),
        Arc::new(ScriptedProber::new()),
        settings(),
    ));
    let actions = Actions::new(fixture.orchestrator.clone()).with_monitor(registry.clone());

    actions.topology(TOPOLOGY, TopologyVerb::Define, None, false).await.unwrap();
    assert_eq!(fixture.manager.devices(), vec!["r1"]);
    assert!(!registry.status(TOPOLOGY).await.running);

    actions.topology(TOPOLOGY, TopologyVerb::Start, None, false).await.unwrap();
    assert!(registry.status(TOPOLOGY).await.running);

    actions.topology(TOPOLOGY, TopologyVerb::Stop, None, false).await.unwrap();
    assert!(!registry.status(TOPOLOGY).await.running);
    assert_eq!(fixture.topology().provisioning_status, ProvisioningStatus::Defined);
}
