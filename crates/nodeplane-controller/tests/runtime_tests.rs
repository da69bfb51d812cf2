//! Integration tests: controllers running inside the runtime against a shared store

use nodeplane_controller::controllers::{ConfigController, KubeletController, NodenameController};
use nodeplane_controller::resources::*;
use nodeplane_controller::*;
use nodeplane_core::{Error, Result};
use nodeplane_state::State;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        base_ms: 5,
        multiplier: 2.0,
        max_ms: 50,
    }
}

fn machine_config() -> MachineConfigSpec {
    MachineConfigSpec {
        machine_type: MachineType::Worker,
        cluster_endpoint: "https://cluster.example:6443".into(),
        cluster_ca: Some("ca-pem".into()),
        bootstrap_token: "abcdef.0123456789abcdef".into(),
        ..Default::default()
    }
}

fn write_config(state: &State, config: MachineConfigSpec) {
    state
        .modify_typed::<MachineConfigSpec, _>(
            &MachineConfigSpec::reference(MACHINE_CONFIG_ID),
            None,
            |spec| {
                *spec = config.clone();
                Ok(())
            },
        )
        .unwrap();
}

fn start(runtime: Runtime) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(runtime.run(cancel.clone()));
    (cancel, handle)
}

// ===========================================================================
// Registration
// ===========================================================================

#[test]
fn duplicate_exclusive_output_is_rejected() {
    let mut runtime = Runtime::new(Arc::new(State::new()));
    runtime.register(KubeletController).unwrap();

    struct Impostor;
    #[async_trait::async_trait]
    impl Controller for Impostor {
        fn name(&self) -> &str {
            "secrets.Impostor"
        }
        fn inputs(&self) -> Vec<Input> {
            vec![]
        }
        fn outputs(&self) -> Vec<Output> {
            vec![Output::shared(KubeletSecretsSpec::NAMESPACE, KubeletSecretsSpec::TYPE)]
        }
        async fn run(&self, _r: &mut ControllerAdapter) -> Result<()> {
            Ok(())
        }
    }

    let err = runtime.register(Impostor).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    assert_eq!(runtime.controller_names(), vec!["secrets.KubeletController"]);
    assert_eq!(
        runtime.exclusive_owner(&KubeletSecretsSpec::kind()),
        Some("secrets.KubeletController")
    );
}

#[test]
fn duplicate_name_is_rejected() {
    let mut runtime = Runtime::new(Arc::new(State::new()));
    runtime.register(NodenameController).unwrap();
    assert!(matches!(
        runtime.register(NodenameController),
        Err(Error::Validation(_))
    ));
}

// ===========================================================================
// Reconciliation
// ===========================================================================

#[tokio::test]
async fn kubelet_secrets_follow_machine_config_and_are_torn_down() {
    let state = Arc::new(State::new());
    let mut runtime = Runtime::new(state.clone()).with_backoff(fast_backoff());
    runtime.register(KubeletController).unwrap();
    let (cancel, handle) = start(runtime);

    let secrets_ref = KubeletSecretsSpec::reference(KUBELET_SECRETS_ID);
    write_config(&state, machine_config());
    wait_until(|| state.get(&secrets_ref).is_ok()).await;

    let secrets = state.get(&secrets_ref).unwrap();
    assert_eq!(secrets.owner(), Some("secrets.KubeletController"));
    let typed: KubeletSecretsSpec = secrets.spec_as().unwrap();
    assert_eq!(typed.endpoint, "https://cluster.example:6443");
    assert_eq!(typed.bootstrap_token_id, "abcdef");

    // unrelated config change: secrets are recomputed identically
    let mut config = machine_config();
    config.siderolink_api_url = Some("https://link:443".into());
    write_config(&state, config);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.get(&secrets_ref).unwrap().version(), 1);

    state
        .destroy(&MachineConfigSpec::reference(MACHINE_CONFIG_ID))
        .unwrap();
    wait_until(|| state.get(&secrets_ref).is_err()).await;
    assert!(state.list(&KubeletSecretsSpec::kind()).is_empty());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn kubelet_controller_endpoint_tracks_machine_type() {
    let state = Arc::new(State::new());
    let mut runtime = Runtime::new(state.clone()).with_backoff(fast_backoff());
    runtime.register(KubeletController).unwrap();
    let (cancel, handle) = start(runtime);

    let mut config = machine_config();
    config.machine_type = MachineType::Controlplane;
    write_config(&state, config);

    let secrets_ref = KubeletSecretsSpec::reference(KUBELET_SECRETS_ID);
    wait_until(|| {
        state
            .get_typed::<KubeletSecretsSpec>(&secrets_ref)
            .map(|s| s.endpoint == "https://localhost:6443")
            .unwrap_or(false)
    })
    .await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_ca_restarts_until_config_is_fixed() {
    let state = Arc::new(State::new());
    let mut runtime = Runtime::new(state.clone()).with_backoff(fast_backoff());
    runtime.register(KubeletController).unwrap();
    runtime.register(NodenameController).unwrap();
    let (cancel, handle) = start(runtime);

    let mut broken = machine_config();
    broken.cluster_ca = None;
    write_config(&state, broken);

    // the failing controller does not hold up its neighbours
    state
        .modify_typed::<HostnameStatusSpec, _>(
            &HostnameStatusSpec::reference(HOSTNAME_STATUS_ID),
            None,
            |spec| {
                spec.hostname = "Node-1".into();
                Ok(())
            },
        )
        .unwrap();
    wait_until(|| {
        state
            .get_typed::<NodenameSpec>(&NodenameSpec::reference(NODENAME_ID))
            .map(|n| n.nodename == "node-1")
            .unwrap_or(false)
    })
    .await;
    assert!(state
        .get(&KubeletSecretsSpec::reference(KUBELET_SECRETS_ID))
        .is_err());

    write_config(&state, machine_config());
    wait_until(|| {
        state
            .get(&KubeletSecretsSpec::reference(KUBELET_SECRETS_ID))
            .is_ok()
    })
    .await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn nodename_waits_for_strong_input() {
    let state = Arc::new(State::new());
    let mut runtime = Runtime::new(state.clone());
    runtime.register(NodenameController).unwrap();
    let (cancel, handle) = start(runtime);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(state.list(&NodenameSpec::kind()).is_empty());

    state
        .modify_typed::<HostnameStatusSpec, _>(
            &HostnameStatusSpec::reference(HOSTNAME_STATUS_ID),
            None,
            |spec| {
                spec.hostname = "worker-7".into();
                spec.domainname = "lab.local".into();
                Ok(())
            },
        )
        .unwrap();

    let nodename_ref = NodenameSpec::reference(NODENAME_ID);
    wait_until(|| state.get(&nodename_ref).is_ok()).await;
    let nodename: NodenameSpec = state.get_typed(&nodename_ref).unwrap();
    assert_eq!(nodename.nodename, "worker-7");
    assert_eq!(nodename.hostname_version, 1);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn nodename_is_torn_down_when_hostname_disappears() {
    let state = Arc::new(State::new());
    let mut runtime = Runtime::new(state.clone());
    runtime.register(NodenameController).unwrap();
    let (cancel, handle) = start(runtime);

    let hostname_ref = HostnameStatusSpec::reference(HOSTNAME_STATUS_ID);
    state
        .modify_typed::<HostnameStatusSpec, _>(&hostname_ref, None, |spec| {
            spec.hostname = "w1".into();
            Ok(())
        })
        .unwrap();
    let nodename_ref = NodenameSpec::reference(NODENAME_ID);
    wait_until(|| state.get(&nodename_ref).is_ok()).await;

    state.destroy(&hostname_ref).unwrap();
    wait_until(|| state.get(&nodename_ref).is_err()).await;
    assert!(state.get(&nodename_ref).unwrap_err().is_not_found());

    // a new hostname brings it back
    state
        .modify_typed::<HostnameStatusSpec, _>(&hostname_ref, None, |spec| {
            spec.hostname = "w2".into();
            Ok(())
        })
        .unwrap();
    wait_until(|| {
        state
            .get_typed::<NodenameSpec>(&nodename_ref)
            .is_ok_and(|n| n.nodename == "w2")
    })
    .await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn siderolink_endpoint_falls_back_to_cmdline_and_is_destroyed_when_empty() {
    let state = Arc::new(State::new());
    let mut runtime = Runtime::new(state.clone());
    runtime
        .register(ConfigController::new(Cmdline::parse(
            "siderolink.api=https://cmdline.example:443",
        )))
        .unwrap();
    let (cancel, handle) = start(runtime);

    let link_ref = SideroLinkConfigSpec::reference(SIDEROLINK_CONFIG_ID);
    wait_until(|| {
        state
            .get_typed::<SideroLinkConfigSpec>(&link_ref)
            .map(|l| l.api_endpoint == "https://cmdline.example:443")
            .unwrap_or(false)
    })
    .await;

    let mut config = machine_config();
    config.siderolink_api_url = Some("https://config.example:443".into());
    write_config(&state, config);
    wait_until(|| {
        state
            .get_typed::<SideroLinkConfigSpec>(&link_ref)
            .map(|l| l.api_endpoint == "https://config.example:443")
            .unwrap_or(false)
    })
    .await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    let state = Arc::new(State::new());
    let mut runtime = Runtime::new(state.clone());
    runtime
        .register(ConfigController::new(Cmdline::default()))
        .unwrap();
    state
        .modify_typed::<SideroLinkConfigSpec, _>(&link_ref, Some("siderolink.ConfigController"), |spec| {
            spec.api_endpoint = "https://stale:443".into();
            Ok(())
        })
        .unwrap();
    let (cancel, handle) = start(runtime);
    wait_until(|| state.get(&link_ref).is_err()).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();
}

// ===========================================================================
// Supervision
// ===========================================================================

struct Flaky {
    runs: Arc<AtomicU32>,
    fail_times: u32,
    panic: bool,
}

#[async_trait::async_trait]
impl Controller for Flaky {
    fn name(&self) -> &str {
        "test.Flaky"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive("test", "Marker")]
    }

    async fn run(&self, r: &mut ControllerAdapter) -> Result<()> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if run <= self.fail_times {
            if self.panic {
                panic!("flaky controller run {run}");
            }
            return Err(Error::Internal(format!("run {run} failed")));
        }
        r.modify(&nodeplane_core::ResourceRef::new("test", "Marker", "ok"), |spec| {
            *spec = serde_json::json!({ "runs": run });
            Ok(())
        })?;
        r.reset_restart_backoff();
        while r.next_event().await.is_some() {}
        Ok(())
    }
}

#[tokio::test]
async fn failing_controller_is_restarted() {
    let state = Arc::new(State::new());
    let runs = Arc::new(AtomicU32::new(0));
    let mut runtime = Runtime::new(state.clone()).with_backoff(fast_backoff());
    runtime
        .register(Flaky {
            runs: runs.clone(),
            fail_times: 3,
            panic: false,
        })
        .unwrap();
    let (cancel, handle) = start(runtime);

    let marker = nodeplane_core::ResourceRef::new("test", "Marker", "ok");
    wait_until(|| state.get(&marker).is_ok()).await;
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(state.get(&marker).unwrap().spec["runs"], 4);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn panicking_controller_is_restarted() {
    let state = Arc::new(State::new());
    let runs = Arc::new(AtomicU32::new(0));
    let mut runtime = Runtime::new(state.clone()).with_backoff(fast_backoff());
    runtime
        .register(Flaky {
            runs: runs.clone(),
            fail_times: 1,
            panic: true,
        })
        .unwrap();
    let (cancel, handle) = start(runtime);

    let marker = nodeplane_core::ResourceRef::new("test", "Marker", "ok");
    wait_until(|| state.get(&marker).is_ok()).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn undeclared_writes_are_denied() {
    struct Rogue {
        result: Arc<std::sync::Mutex<Option<Error>>>,
    }

    #[async_trait::async_trait]
    impl Controller for Rogue {
        fn name(&self) -> &str {
            "test.Rogue"
        }
        fn inputs(&self) -> Vec<Input> {
            vec![]
        }
        fn outputs(&self) -> Vec<Output> {
            vec![]
        }
        async fn run(&self, r: &mut ControllerAdapter) -> Result<()> {
            let err = r
                .modify(&KubeletSecretsSpec::reference(KUBELET_SECRETS_ID), |_| Ok(()))
                .unwrap_err();
            *self.result.lock().unwrap() = Some(err);
            Ok(())
        }
    }

    let state = Arc::new(State::new());
    let result = Arc::new(std::sync::Mutex::new(None));
    let mut runtime = Runtime::new(state.clone());
    runtime
        .register(Rogue {
            result: result.clone(),
        })
        .unwrap();
    let (_cancel, handle) = start(runtime);

    // the rogue controller returns Ok on its own, so the runtime finishes
    handle.await.unwrap().unwrap();
    let err = result.lock().unwrap().take().unwrap();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err}");
    assert!(state.list(&KubeletSecretsSpec::kind()).is_empty());
}
