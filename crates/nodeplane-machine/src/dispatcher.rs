//! Action dispatcher
//!
//! Validates mutating requests synchronously, then launches the matching
//! sequence on a task owned by the dispatcher, never by the request. The
//! caller only gets the actor id back; progress is reported on the event bus.

use nodeplane_controller::resources::{HostnameStatusSpec, ResourceSpec, HOSTNAME_STATUS_ID};
use nodeplane_core::{
    ActorId, Error, Mode, Operation, ResetAck, ResetMode, ResetRequest, Result, UpgradeAck,
    UpgradeRequest,
};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::image::ImageRef;
use crate::sequence::{Sequence, SequenceExecutor};

pub const UPGRADE_ACK: &str = "Upgrade request received";

pub struct Dispatcher {
    mode: Mode,
    executor: Arc<SequenceExecutor>,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(mode: Mode, executor: Arc<SequenceExecutor>) -> Self {
        Self {
            mode,
            executor,
            tasks: TaskTracker::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn executor(&self) -> &Arc<SequenceExecutor> {
        &self.executor
    }

    pub fn boot_id(&self) -> String {
        self.executor.power().boot_id()
    }

    fn ensure_installed(&self) -> Result<()> {
        match self.executor.disks().system_disk() {
            Some(_) => Ok(()),
            None => Err(Error::precondition("not installed")),
        }
    }

    fn ensure_supported(&self, op: Operation, what: &str) -> Result<()> {
        if self.mode.supports(op) {
            Ok(())
        } else {
            Err(Error::unsupported(self.mode, what))
        }
    }

    fn hostname(&self) -> Option<String> {
        self.executor
            .state()
            .get_typed::<HostnameStatusSpec>(&HostnameStatusSpec::reference(HOSTNAME_STATUS_ID))
            .ok()
            .map(|h| h.hostname)
            .filter(|h| !h.is_empty())
    }

    pub fn upgrade(&self, request: UpgradeRequest) -> Result<UpgradeAck> {
        self.ensure_installed()?;
        self.ensure_supported(Operation::Upgrade, "upgrade")?;
        if self.mode.is_reduced() && (request.preserve || request.stage || request.force) {
            return Err(Error::unsupported(
                self.mode,
                "upgrade --preserve, --stage and --force",
            ));
        }
        let image = ImageRef::parse(&request.image)?;

        let sequence = if self.mode.is_reduced() {
            Sequence::MaintenanceUpgrade { image }
        } else {
            Sequence::Upgrade {
                image,
                preserve: request.preserve,
                stage: request.stage,
                force: request.force,
            }
        };
        let actor_id = self.launch(sequence);

        Ok(UpgradeAck {
            ack: UPGRADE_ACK.to_string(),
            actor_id,
            hostname: self.hostname(),
        })
    }

    pub fn reset(&self, request: ResetRequest) -> Result<ResetAck> {
        if request.mode == ResetMode::SystemDisk && !request.user_disks_to_wipe.is_empty() {
            return Err(Error::validation(
                "wipe mode SYSTEM_DISK doesn't support the user_disks_to_wipe parameter",
            ));
        }
        self.ensure_supported(Operation::Reset, "reset")?;
        if self.mode.is_reduced() && !request.system_partitions_to_wipe.is_empty() {
            return Err(Error::unsupported(self.mode, "wiping system partitions"));
        }
        self.ensure_installed()?;

        // a node in maintenance mode has not joined a cluster
        let leave_cluster = request.graceful && !self.mode.is_reduced();
        let actor_id = self.launch(Sequence::Reset {
            request,
            leave_cluster,
        });
        Ok(ResetAck { actor_id })
    }

    pub fn reboot(&self) -> Result<ActorId> {
        self.ensure_supported(Operation::Reboot, "reboot")?;
        Ok(self.launch(Sequence::Reboot))
    }

    pub fn shutdown(&self) -> Result<ActorId> {
        self.ensure_supported(Operation::Shutdown, "shutdown")?;
        Ok(self.launch(Sequence::Shutdown))
    }

    fn launch(&self, sequence: Sequence) -> ActorId {
        let actor_id = ActorId::generate();
        let executor = self.executor.clone();
        let actor = actor_id.clone();
        let name = sequence.name();
        info!(sequence = name, actor = %actor_id, "sequence accepted");

        self.tasks.spawn(async move {
            match executor.run(&actor, sequence).await {
                Ok(outcome) => info!(sequence = name, actor = %actor, ?outcome, "sequence finished"),
                Err(e) => error!(sequence = name, actor = %actor, error = %e, "sequence failed"),
            }
        });
        actor_id
    }

    /// Number of sequences accepted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every accepted sequence to finish.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
