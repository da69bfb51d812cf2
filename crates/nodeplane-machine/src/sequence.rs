//! Sequence executor
//!
//! A sequence is an ordered list of phases bound to one actor. Phases either
//! succeed, fail (aborting the rest of the sequence) or end the sequence with
//! a reboot or shutdown, which is reported as an outcome rather than a
//! failure. Only one sequence runs at a time; callers queue on a mutex.

use nodeplane_controller::resources::{
    KubeletSecretsSpec, MachineConfigSpec, ResourceSpec, SideroLinkConfigSpec, StagedUpgradeSpec,
    STAGED_UPGRADE_ID,
};
use nodeplane_core::{
    ActorId, Error, EventAction, EventPayload, MachineStage, Outcome, ResetMode, ResetRequest, Result,
};
use nodeplane_state::State;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::bootloader::BootConfig;
use crate::disk::{Disks, EPHEMERAL_PARTITION};
use crate::events::EventBus;
use crate::health::Cluster;
use crate::image::ImageRef;
use crate::power::Power;

const OWNER: &str = "machine.SequenceExecutor";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sequence {
    Upgrade {
        image: ImageRef,
        preserve: bool,
        stage: bool,
        force: bool,
    },
    /// Upgrade of a node running in maintenance mode.
    MaintenanceUpgrade { image: ImageRef },
    Reset {
        request: ResetRequest,
        leave_cluster: bool,
    },
    Reboot,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ValidateImage,
    CheckClusterHealth,
    StageUpgrade,
    WipeEphemeral,
    InstallBootEntry,
    LeaveCluster,
    WipeUserDisks,
    WipeSystem,
    WipeState,
    Reboot,
    Shutdown,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::ValidateImage => "validate_image",
            Phase::CheckClusterHealth => "check_cluster_health",
            Phase::StageUpgrade => "stage_upgrade",
            Phase::WipeEphemeral => "wipe_ephemeral",
            Phase::InstallBootEntry => "install_boot_entry",
            Phase::LeaveCluster => "leave_cluster",
            Phase::WipeUserDisks => "wipe_user_disks",
            Phase::WipeSystem => "wipe_system",
            Phase::WipeState => "wipe_state",
            Phase::Reboot => "reboot",
            Phase::Shutdown => "shutdown",
        }
    }
}

impl Sequence {
    pub fn name(&self) -> &'static str {
        match self {
            Sequence::Upgrade { .. } => "upgrade",
            Sequence::MaintenanceUpgrade { .. } => "maintenance_upgrade",
            Sequence::Reset { .. } => "reset",
            Sequence::Reboot => "reboot",
            Sequence::Shutdown => "shutdown",
        }
    }

    pub fn phases(&self) -> Vec<Phase> {
        match self {
            Sequence::Upgrade {
                preserve,
                stage,
                force,
                ..
            } => {
                let mut phases = vec![Phase::ValidateImage];
                if !force {
                    phases.push(Phase::CheckClusterHealth);
                }
                if *stage {
                    // staging ends in a reboot; the install happens on the next boot
                    phases.push(Phase::StageUpgrade);
                    return phases;
                }
                if !preserve {
                    phases.push(Phase::WipeEphemeral);
                }
                phases.extend([Phase::InstallBootEntry, Phase::Reboot]);
                phases
            }
            Sequence::MaintenanceUpgrade { .. } => {
                vec![Phase::ValidateImage, Phase::InstallBootEntry, Phase::Reboot]
            }
            Sequence::Reset {
                request,
                leave_cluster,
            } => {
                let mut phases = Vec::new();
                if *leave_cluster {
                    phases.push(Phase::LeaveCluster);
                }
                if request.mode != ResetMode::SystemDisk && !request.user_disks_to_wipe.is_empty() {
                    phases.push(Phase::WipeUserDisks);
                }
                let wipes_system = !request.system_partitions_to_wipe.is_empty()
                    || matches!(request.mode, ResetMode::All | ResetMode::SystemDisk);
                if wipes_system {
                    phases.extend([Phase::WipeSystem, Phase::WipeState]);
                }
                phases.push(if request.reboot {
                    Phase::Reboot
                } else {
                    Phase::Shutdown
                });
                phases
            }
            Sequence::Reboot => vec![Phase::Reboot],
            Sequence::Shutdown => vec![Phase::Shutdown],
        }
    }

    fn stage(&self) -> Option<MachineStage> {
        match self {
            Sequence::Upgrade { .. } | Sequence::MaintenanceUpgrade { .. } => Some(MachineStage::Upgrading),
            Sequence::Reset { .. } => Some(MachineStage::Resetting),
            Sequence::Reboot | Sequence::Shutdown => None,
        }
    }
}

pub struct SequenceExecutor {
    state: Arc<State>,
    disks: Arc<dyn Disks>,
    power: Arc<dyn Power>,
    cluster: Arc<dyn Cluster>,
    boot: Mutex<BootConfig>,
    events: EventBus,
    running: tokio::sync::Mutex<()>,
}

impl SequenceExecutor {
    pub fn new(
        state: Arc<State>,
        disks: Arc<dyn Disks>,
        power: Arc<dyn Power>,
        cluster: Arc<dyn Cluster>,
        boot: BootConfig,
        events: EventBus,
    ) -> Self {
        Self {
            state,
            disks,
            power,
            cluster,
            boot: Mutex::new(boot),
            events,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn disks(&self) -> &Arc<dyn Disks> {
        &self.disks
    }

    pub fn power(&self) -> &Arc<dyn Power> {
        &self.power
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn boot_config(&self) -> BootConfig {
        self.boot
            .lock()
            .map(|b| b.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Run a sequence to its outcome. Waits for any running sequence first.
    pub async fn run(&self, actor: &ActorId, sequence: Sequence) -> Result<Outcome> {
        let _running = self.running.lock().await;
        let name = sequence.name();
        info!(sequence = name, actor = %actor, "sequence started");

        self.events.publish(
            Some(actor),
            EventPayload::Sequence {
                sequence: name.to_string(),
                action: EventAction::Start,
                outcome: None,
                error: None,
            },
        );
        let previous_status = self.events.last_status();
        if let Some(stage) = sequence.stage() {
            self.events.status(stage, false);
        }

        let mut outcome = Outcome::Completed;
        for phase in sequence.phases() {
            self.phase_event(actor, name, phase, EventAction::Start);
            debug!(sequence = name, phase = phase.name(), "phase started");
            let result = self.execute(actor, &sequence, phase).await;
            self.phase_event(actor, name, phase, EventAction::Stop);

            match result {
                Ok(()) => {}
                Err(Error::TerminalReboot) => {
                    outcome = Outcome::Rebooted;
                    break;
                }
                Err(Error::TerminalShutdown) => {
                    outcome = Outcome::ShutDown;
                    break;
                }
                Err(e) => {
                    warn!(sequence = name, phase = phase.name(), error = %e, "phase failed");
                    self.events.publish(
                        Some(actor),
                        EventPayload::Sequence {
                            sequence: name.to_string(),
                            action: EventAction::Stop,
                            outcome: None,
                            error: Some(format!("{}: {}", phase.name(), e)),
                        },
                    );
                    if let Some((stage, ready)) = previous_status {
                        self.events.status(stage, ready);
                    }
                    return Err(e);
                }
            }
        }

        self.events.publish(
            Some(actor),
            EventPayload::Sequence {
                sequence: name.to_string(),
                action: EventAction::Stop,
                outcome: Some(outcome),
                error: None,
            },
        );
        Ok(outcome)
    }

    fn phase_event(&self, actor: &ActorId, sequence: &str, phase: Phase, action: EventAction) {
        self.events.publish(
            Some(actor),
            EventPayload::Phase {
                sequence: sequence.to_string(),
                phase: phase.name().to_string(),
                action,
            },
        );
    }

    async fn execute(&self, actor: &ActorId, sequence: &Sequence, phase: Phase) -> Result<()> {
        match (phase, sequence) {
            (Phase::ValidateImage, Sequence::Upgrade { image, .. })
            | (Phase::ValidateImage, Sequence::MaintenanceUpgrade { image }) => {
                if image.tag.is_none() && image.digest.is_none() {
                    return Err(Error::validation(format!(
                        "installer image {} must be pinned to a tag or digest",
                        image
                    )));
                }
                debug!(%image, "installer image validated");
                Ok(())
            }
            (Phase::CheckClusterHealth, _) => self.cluster.check_health().await,
            (Phase::StageUpgrade, Sequence::Upgrade { image, preserve, .. }) => {
                let staged = StagedUpgradeSpec {
                    image: image.to_string(),
                    actor_id: actor.to_string(),
                    preserve: *preserve,
                };
                self.state.modify_typed::<StagedUpgradeSpec, _>(
                    &StagedUpgradeSpec::reference(STAGED_UPGRADE_ID),
                    Some(OWNER),
                    |spec| {
                        *spec = staged.clone();
                        Ok(())
                    },
                )?;
                info!(%image, "upgrade staged for next boot");
                self.power.reboot().await?;
                Err(Error::TerminalReboot)
            }
            (Phase::WipeEphemeral, _) => self.disks.wipe_partition(EPHEMERAL_PARTITION).await,
            (Phase::InstallBootEntry, Sequence::Upgrade { image, .. })
            | (Phase::InstallBootEntry, Sequence::MaintenanceUpgrade { image }) => {
                let entry = image.boot_entry();
                let mut boot = self
                    .boot
                    .lock()
                    .map_err(|_| Error::Internal("boot configuration lock poisoned".into()))?;
                boot.install(&entry);
                info!(%entry, previous = ?boot.previous_label(), "boot entry installed");
                Ok(())
            }
            (Phase::LeaveCluster, _) => self.cluster.leave().await,
            (Phase::WipeUserDisks, Sequence::Reset { request, .. }) => {
                for device in &request.user_disks_to_wipe {
                    self.disks.fast_wipe(device).await?;
                }
                Ok(())
            }
            (Phase::WipeSystem, Sequence::Reset { request, .. }) => {
                if request.system_partitions_to_wipe.is_empty() {
                    return self.disks.reset_system_disk().await;
                }
                for label in &request.system_partitions_to_wipe {
                    self.disks.wipe_partition(label).await?;
                }
                Ok(())
            }
            (Phase::WipeState, _) => self.wipe_state(),
            (Phase::Reboot, _) => {
                self.power.reboot().await?;
                Err(Error::TerminalReboot)
            }
            (Phase::Shutdown, _) => {
                self.power.shutdown().await?;
                Err(Error::TerminalShutdown)
            }
            (phase, sequence) => Err(Error::Internal(format!(
                "phase {} does not belong to sequence {}",
                phase.name(),
                sequence.name()
            ))),
        }
    }

    /// Forget configuration and everything derived from it.
    fn wipe_state(&self) -> Result<()> {
        let kinds = [
            KubeletSecretsSpec::kind(),
            SideroLinkConfigSpec::kind(),
            StagedUpgradeSpec::kind(),
            MachineConfigSpec::kind(),
        ];
        for kind in &kinds {
            for resource in self.state.list(kind) {
                match self.state.destroy(resource.reference()) {
                    Ok(()) => debug!(resource = %resource.reference(), "wiped"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
