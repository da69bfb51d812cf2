//! Dispatcher and sequence executor integration tests

use nodeplane_controller::resources::*;
use nodeplane_core::*;
use nodeplane_machine::*;
use nodeplane_state::State;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Node {
    dispatcher: Arc<Dispatcher>,
    disks: Arc<MemoryDisks>,
    power: Arc<SimulatedPower>,
    events: EventBus,
    state: Arc<State>,
}

fn node_with(mode: Mode, disks: MemoryDisks, cluster: Arc<dyn Cluster>) -> Node {
    let state = Arc::new(State::new());
    let events = EventBus::default();
    events.status(MachineStage::Running, true);
    let disks = Arc::new(disks);
    let power = Arc::new(
        SimulatedPower::new("boot-0", events.clone()).with_reboot_delay(Duration::from_millis(10)),
    );
    let executor = Arc::new(SequenceExecutor::new(
        state.clone(),
        disks.clone(),
        power.clone(),
        cluster,
        BootConfig::booted_from("nodeplane-v1.0.0"),
        events.clone(),
    ));
    Node {
        dispatcher: Arc::new(Dispatcher::new(mode, executor)),
        disks,
        power,
        events,
        state,
    }
}

fn node(mode: Mode) -> Node {
    node_with(
        mode,
        MemoryDisks::installed("/dev/sda").with_user_disk("/dev/sdb"),
        Arc::new(StandaloneCluster),
    )
}

fn upgrade(image: &str) -> UpgradeRequest {
    UpgradeRequest {
        image: image.into(),
        ..Default::default()
    }
}

fn events_for(bus: &EventBus, actor: &ActorId) -> Vec<MachineEvent> {
    bus.subscribe(usize::MAX)
        .0
        .into_iter()
        .filter(|e| e.is_for(actor))
        .collect()
}

fn phases_run(events: &[MachineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::Phase {
                phase,
                action: EventAction::Start,
                ..
            } => Some(phase.clone()),
            _ => None,
        })
        .collect()
}

fn final_outcome(events: &[MachineEvent]) -> Option<Outcome> {
    events.iter().rev().find_map(|e| match &e.payload {
        EventPayload::Sequence {
            action: EventAction::Stop,
            outcome,
            ..
        } => *outcome,
        _ => None,
    })
}

// ===========================================================================
// Upgrade validation
// ===========================================================================

#[tokio::test]
async fn upgrade_on_uninstalled_node_is_precondition_failure() {
    // container mode would also be rejected; the install check comes first
    let node = node_with(
        Mode::Container,
        MemoryDisks::not_installed(),
        Arc::new(StandaloneCluster),
    );
    let before = node.events.subscribe(usize::MAX).0.len();
    let err = node
        .dispatcher
        .upgrade(upgrade("ghcr.io/nodeplane/installer:v1.1.0"))
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)), "{err}");
    assert_eq!(node.dispatcher.in_flight(), 0);
    assert_eq!(node.events.subscribe(usize::MAX).0.len(), before);
}

#[tokio::test]
async fn upgrade_rejected_in_container_mode() {
    let node = node(Mode::Container);
    let err = node
        .dispatcher
        .upgrade(upgrade("ghcr.io/nodeplane/installer:v1.1.0"))
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedInMode { mode: Mode::Container, .. }));
}

#[tokio::test]
async fn maintenance_upgrade_rejects_extra_flags() {
    let node = node(Mode::Maintenance);
    for request in [
        UpgradeRequest {
            preserve: true,
            ..upgrade("ghcr.io/nodeplane/installer:v1.1.0")
        },
        UpgradeRequest {
            stage: true,
            ..upgrade("ghcr.io/nodeplane/installer:v1.1.0")
        },
        UpgradeRequest {
            force: true,
            ..upgrade("ghcr.io/nodeplane/installer:v1.1.0")
        },
    ] {
        let err = node.dispatcher.upgrade(request).unwrap_err();
        assert_eq!(err.rpc_code(), nodeplane_core::error::CODE_UNSUPPORTED);
    }
}

#[tokio::test]
async fn malformed_image_is_validation_error() {
    let node = node(Mode::Metal);
    let err = node.dispatcher.upgrade(upgrade("Not An Image")).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(node.dispatcher.in_flight(), 0);
}

// ===========================================================================
// Upgrade execution
// ===========================================================================

#[tokio::test]
async fn upgrade_runs_all_phases_and_reboots() {
    let node = node(Mode::Metal);
    let ack = node
        .dispatcher
        .upgrade(upgrade("ghcr.io/nodeplane/installer:v1.1.0"))
        .unwrap();
    assert_eq!(ack.ack, "Upgrade request received");
    node.dispatcher.wait_idle().await;

    let events = events_for(&node.events, &ack.actor_id);
    assert_eq!(
        phases_run(&events),
        vec![
            "validate_image",
            "check_cluster_health",
            "wipe_ephemeral",
            "install_boot_entry",
            "reboot"
        ]
    );
    assert_eq!(final_outcome(&events), Some(Outcome::Rebooted));

    let boot = node.dispatcher.executor().boot_config();
    assert_eq!(boot.default_entry(), Some("nodeplane-v1.1.0"));
    assert_eq!(boot.previous_label(), Some("nodeplane-v1.0.0"));
    assert_eq!(node.disks.wiped(), vec!["label:EPHEMERAL"]);
    assert_eq!(node.power.actions(), vec![PowerAction::Reboot]);

    // the simulated node comes back under a new boot id
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_ne!(node.dispatcher.boot_id(), "boot-0");
    assert_eq!(node.events.last_status(), Some((MachineStage::Running, true)));
}

#[tokio::test]
async fn preserve_skips_ephemeral_wipe() {
    let node = node(Mode::Metal);
    let ack = node
        .dispatcher
        .upgrade(UpgradeRequest {
            preserve: true,
            ..upgrade("ghcr.io/nodeplane/installer:v1.1.0")
        })
        .unwrap();
    node.dispatcher.wait_idle().await;
    assert!(node.disks.wiped().is_empty());
    let events = events_for(&node.events, &ack.actor_id);
    assert!(!phases_run(&events).contains(&"wipe_ephemeral".to_string()));
}

#[tokio::test]
async fn staged_upgrade_records_resource_and_leaves_boot_entry() {
    let node = node(Mode::Metal);
    let ack = node
        .dispatcher
        .upgrade(UpgradeRequest {
            stage: true,
            ..upgrade("ghcr.io/nodeplane/installer:v1.1.0")
        })
        .unwrap();
    node.dispatcher.wait_idle().await;

    let staged: StagedUpgradeSpec = node
        .state
        .get_typed(&StagedUpgradeSpec::reference(STAGED_UPGRADE_ID))
        .unwrap();
    assert_eq!(staged.image, "ghcr.io/nodeplane/installer:v1.1.0");
    assert_eq!(staged.actor_id, ack.actor_id.as_str());
    assert_eq!(
        node.dispatcher.executor().boot_config().default_entry(),
        Some("nodeplane-v1.0.0")
    );
    assert_eq!(
        final_outcome(&events_for(&node.events, &ack.actor_id)),
        Some(Outcome::Rebooted)
    );
}

struct Unhealthy;

#[async_trait::async_trait]
impl Cluster for Unhealthy {
    async fn check_health(&self) -> Result<()> {
        Err(Error::ActionFailed("etcd has 1 of 3 members healthy".into()))
    }
    async fn leave(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn unhealthy_cluster_fails_upgrade_unless_forced() {
    let node = node_with(
        Mode::Metal,
        MemoryDisks::installed("/dev/sda"),
        Arc::new(Unhealthy),
    );
    let ack = node
        .dispatcher
        .upgrade(upgrade("ghcr.io/nodeplane/installer:v1.1.0"))
        .unwrap();
    node.dispatcher.wait_idle().await;

    let events = events_for(&node.events, &ack.actor_id);
    let failure = events.iter().find_map(|e| e.sequence_error()).unwrap();
    assert!(failure.contains("check_cluster_health"));
    assert!(node.power.actions().is_empty());
    // status is restored after the failed attempt
    assert_eq!(node.events.last_status(), Some((MachineStage::Running, true)));

    let forced = node
        .dispatcher
        .upgrade(UpgradeRequest {
            force: true,
            ..upgrade("ghcr.io/nodeplane/installer:v1.1.0")
        })
        .unwrap();
    node.dispatcher.wait_idle().await;
    assert_eq!(
        final_outcome(&events_for(&node.events, &forced.actor_id)),
        Some(Outcome::Rebooted)
    );
}

#[tokio::test]
async fn untagged_image_fails_in_validate_phase() {
    let node = node(Mode::Maintenance);
    let ack = node
        .dispatcher
        .upgrade(upgrade("ghcr.io/nodeplane/installer"))
        .unwrap();
    node.dispatcher.wait_idle().await;
    let events = events_for(&node.events, &ack.actor_id);
    assert_eq!(phases_run(&events), vec!["validate_image"]);
    assert!(events.iter().any(|e| e.sequence_error().is_some()));
}

#[tokio::test]
async fn maintenance_upgrade_skips_health_and_wipe() {
    let node = node(Mode::Maintenance);
    let ack = node
        .dispatcher
        .upgrade(upgrade("ghcr.io/nodeplane/installer:v1.1.0"))
        .unwrap();
    node.dispatcher.wait_idle().await;
    let events = events_for(&node.events, &ack.actor_id);
    assert_eq!(
        phases_run(&events),
        vec!["validate_image", "install_boot_entry", "reboot"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upgrades_get_unique_actor_ids_and_run_one_at_a_time() {
    let node = node(Mode::Metal);
    let handles: Vec<_> = (0..32)
        .map(|i| {
            let dispatcher = node.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .upgrade(UpgradeRequest {
                        preserve: true,
                        force: true,
                        ..upgrade(&format!("ghcr.io/nodeplane/installer:v1.{}.0", i))
                    })
                    .unwrap()
                    .actor_id
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for h in handles {
        ids.insert(h.await.unwrap());
    }
    assert_eq!(ids.len(), 32);
    node.dispatcher.wait_idle().await;

    // sequences never interleave: every start is followed by its own stop
    let mut running: Option<ActorId> = None;
    for event in node.events.subscribe(usize::MAX).0 {
        if let EventPayload::Sequence { action, .. } = &event.payload {
            let actor = event.actor_id.clone().unwrap();
            match action {
                EventAction::Start => {
                    assert!(running.is_none(), "sequence started while another was running");
                    running = Some(actor);
                }
                EventAction::Stop => {
                    assert_eq!(running.take(), Some(actor));
                }
            }
        }
    }
    assert_eq!(node.power.actions().len(), 32);
}

// ===========================================================================
// Reset
// ===========================================================================

#[tokio::test]
async fn reset_system_disk_with_user_disks_is_rejected_before_any_wipe() {
    let node = node(Mode::Metal);
    let err = node
        .dispatcher
        .reset(ResetRequest {
            mode: ResetMode::SystemDisk,
            user_disks_to_wipe: vec!["/dev/sdb".into()],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    node.dispatcher.wait_idle().await;
    assert!(node.disks.wiped().is_empty());
    assert!(node.power.actions().is_empty());
}

#[tokio::test]
async fn reset_validation_order() {
    // validation error wins even on an uninstalled node in container mode
    let node = node_with(
        Mode::Container,
        MemoryDisks::not_installed(),
        Arc::new(StandaloneCluster),
    );
    let err = node
        .dispatcher
        .reset(ResetRequest {
            mode: ResetMode::SystemDisk,
            user_disks_to_wipe: vec!["/dev/sdb".into()],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = node.dispatcher.reset(ResetRequest::default()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedInMode { .. }));

    let maintenance = node_with(
        Mode::Maintenance,
        MemoryDisks::not_installed(),
        Arc::new(StandaloneCluster),
    );
    let err = maintenance
        .dispatcher
        .reset(ResetRequest {
            system_partitions_to_wipe: vec!["STATE".into()],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedInMode { .. }));
    let err = maintenance
        .dispatcher
        .reset(ResetRequest::default())
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}

#[tokio::test]
async fn reset_wipes_user_disks_then_system_and_state() {
    let node = node(Mode::Metal);
    for (reference, spec) in [
        (
            MachineConfigSpec::reference(MACHINE_CONFIG_ID),
            serde_json::json!({ "cluster_endpoint": "https://c:6443" }),
        ),
        (
            KubeletSecretsSpec::reference(KUBELET_SECRETS_ID),
            serde_json::json!({ "ca": "pem" }),
        ),
    ] {
        node.state
            .modify(&reference, None, |s| {
                *s = spec.clone();
                Ok(())
            })
            .unwrap();
    }

    let ack = node
        .dispatcher
        .reset(ResetRequest {
            graceful: true,
            user_disks_to_wipe: vec!["/dev/sdb".into()],
            ..Default::default()
        })
        .unwrap();
    node.dispatcher.wait_idle().await;

    assert_eq!(node.disks.wiped(), vec!["/dev/sdb", "/dev/sda"]);
    assert!(node.state.list(&MachineConfigSpec::kind()).is_empty());
    assert!(node.state.list(&KubeletSecretsSpec::kind()).is_empty());
    assert_eq!(node.power.actions(), vec![PowerAction::Shutdown]);

    let events = events_for(&node.events, &ack.actor_id);
    assert_eq!(
        phases_run(&events),
        vec![
            "leave_cluster",
            "wipe_user_disks",
            "wipe_system",
            "wipe_state",
            "shutdown"
        ]
    );
    assert_eq!(final_outcome(&events), Some(Outcome::ShutDown));
}

#[tokio::test]
async fn reset_listed_partitions_only_with_reboot() {
    let node = node(Mode::Metal);
    node.dispatcher
        .reset(ResetRequest {
            reboot: true,
            mode: ResetMode::UserDisks,
            system_partitions_to_wipe: vec!["STATE".into(), "EPHEMERAL".into()],
            ..Default::default()
        })
        .unwrap();
    node.dispatcher.wait_idle().await;
    assert_eq!(node.disks.wiped(), vec!["label:STATE", "label:EPHEMERAL"]);
    assert_eq!(node.power.actions(), vec![PowerAction::Reboot]);
}

#[tokio::test]
async fn failed_reset_does_not_block_later_sequences() {
    let node = node(Mode::Metal);
    let bad = node
        .dispatcher
        .reset(ResetRequest {
            mode: ResetMode::UserDisks,
            user_disks_to_wipe: vec!["/dev/nvme9".into()],
            ..Default::default()
        })
        .unwrap();
    let good = node.dispatcher.reboot().unwrap();
    node.dispatcher.wait_idle().await;

    let bad_events = events_for(&node.events, &bad.actor_id);
    assert!(bad_events
        .iter()
        .any(|e| e.sequence_error().is_some_and(|err| err.contains("nvme9"))));
    assert_eq!(
        final_outcome(&events_for(&node.events, &good)),
        Some(Outcome::Rebooted)
    );
    assert_eq!(node.power.actions(), vec![PowerAction::Reboot]);
}
