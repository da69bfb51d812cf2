//! Assembles one node process: store, controllers, dispatcher and the
//! service the gateway exposes.

use nodeplane_controller::controllers::{ConfigController, KubeletController, NodenameController};
use nodeplane_controller::resources::{
    HostnameStatusSpec, MachineConfigSpec, ResourceSpec, HOSTNAME_STATUS_ID, MACHINE_CONFIG_ID,
};
use nodeplane_controller::{Cmdline, Runtime};
use nodeplane_core::{MachineStage, Mode, Result};
use nodeplane_machine::power::host_boot_id;
use nodeplane_machine::{
    BootConfig, Dispatcher, EventBus, MemoryDisks, SequenceExecutor, SimulatedPower,
    StandaloneCluster,
};
use nodeplane_state::State;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::service::MachineService;

const HOST_HOSTNAME: &str = "/proc/sys/kernel/hostname";

pub struct Node {
    pub state: Arc<State>,
    pub events: EventBus,
    pub dispatcher: Arc<Dispatcher>,
    pub service: Arc<MachineService>,
    /// Not yet running; the caller decides where.
    pub runtime: Runtime,
}

impl Node {
    pub fn build(config: &DaemonConfig) -> Result<Self> {
        let state = Arc::new(State::new());
        let events = EventBus::new(config.events.backlog);

        let mut disks = match &config.node.system_disk {
            Some(device) => MemoryDisks::installed(device.clone()),
            None => MemoryDisks::not_installed(),
        };
        for device in &config.node.user_disks {
            disks = disks.with_user_disk(device.clone());
        }

        let power = SimulatedPower::new(host_boot_id(), events.clone())
            .with_reboot_delay(Duration::from_millis(config.node.reboot_delay_ms));
        let executor = Arc::new(SequenceExecutor::new(
            state.clone(),
            Arc::new(disks),
            Arc::new(power),
            Arc::new(StandaloneCluster),
            BootConfig::booted_from(config.node.boot_entry.clone()),
            events.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(config.mode, executor));
        let service = Arc::new(
            MachineService::new(dispatcher.clone(), state.clone(), events.clone())
                .with_policy(config.access.clone()),
        );

        let cmdline = Cmdline::read(&config.node.kernel_cmdline).unwrap_or_else(|e| {
            warn!(path = %config.node.kernel_cmdline.display(), error = %e, "kernel cmdline unavailable");
            Cmdline::default()
        });
        let mut runtime = Runtime::new(state.clone()).with_backoff(config.backoff.clone());
        runtime.register(KubeletController)?;
        runtime.register(ConfigController::new(cmdline))?;
        runtime.register(NodenameController)?;

        let node = Self {
            state,
            events,
            dispatcher,
            service,
            runtime,
        };
        node.seed(config)?;
        Ok(node)
    }

    /// Root objects the node starts with, and its initial status.
    fn seed(&self, config: &DaemonConfig) -> Result<()> {
        if let Some(machine) = &config.machine {
            self.state.modify_typed::<MachineConfigSpec, _>(
                &MachineConfigSpec::reference(MACHINE_CONFIG_ID),
                None,
                |spec| {
                    *spec = machine.clone();
                    Ok(())
                },
            )?;
            info!("machine config applied");
        }

        let hostname = config.node.hostname.clone().or_else(host_hostname);
        if let Some(hostname) = hostname {
            self.state.modify_typed::<HostnameStatusSpec, _>(
                &HostnameStatusSpec::reference(HOSTNAME_STATUS_ID),
                None,
                |spec| {
                    spec.hostname = hostname.clone();
                    spec.domainname = config.node.domainname.clone();
                    Ok(())
                },
            )?;
        }

        let stage = match config.mode {
            Mode::Maintenance => MachineStage::Maintenance,
            _ => MachineStage::Running,
        };
        self.events.status(stage, true);
        Ok(())
    }
}

fn host_hostname() -> Option<String> {
    std::fs::read_to_string(HOST_HOSTNAME)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
