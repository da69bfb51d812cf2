//! Control API messages: upgrade/reset requests and the machine event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ActorId;

/// `machine.upgrade` request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub image: String,
    #[serde(default)]
    pub preserve: bool,
    #[serde(default)]
    pub stage: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeAck {
    pub ack: String,
    pub actor_id: ActorId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeResponse {
    pub messages: Vec<UpgradeAck>,
}

/// What a reset wipes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResetMode {
    #[default]
    All,
    /// Wipe the whole system disk only; user disks are left alone.
    SystemDisk,
    UserDisks,
}

impl std::str::FromStr for ResetMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "all" => Ok(ResetMode::All),
            "system-disk" => Ok(ResetMode::SystemDisk),
            "user-disks" => Ok(ResetMode::UserDisks),
            other => Err(crate::Error::validation(format!(
                "unknown wipe mode: {}",
                other
            ))),
        }
    }
}

/// `machine.reset` request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub graceful: bool,
    #[serde(default)]
    pub reboot: bool,
    #[serde(default)]
    pub mode: ResetMode,
    #[serde(default)]
    pub user_disks_to_wipe: Vec<String>,
    #[serde(default)]
    pub system_partitions_to_wipe: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetAck {
    pub actor_id: ActorId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub messages: Vec<ResetAck>,
}

/// Start/stop marker for sequence and phase events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Start,
    Stop,
}

/// Coarse machine lifecycle stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStage {
    Booting,
    Maintenance,
    Running,
    Upgrading,
    Resetting,
    Rebooting,
    ShuttingDown,
}

/// Terminal result of a sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Rebooted,
    ShutDown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Sequence {
        sequence: String,
        action: EventAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<Outcome>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Phase {
        sequence: String,
        phase: String,
        action: EventAction,
    },
    MachineStatus {
        stage: MachineStage,
        ready: bool,
    },
}

/// One entry of the machine event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineEvent {
    /// Monotonic per-process event number.
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<ActorId>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl MachineEvent {
    pub fn is_for(&self, actor: &ActorId) -> bool {
        self.actor_id.as_ref() == Some(actor)
    }

    /// Error carried by a failed sequence stop event.
    pub fn sequence_error(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Sequence {
                action: EventAction::Stop,
                error: Some(err),
                ..
            } => Some(err),
            _ => None,
        }
    }

    pub fn is_machine_ready(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::MachineStatus {
                stage: MachineStage::Running,
                ready: true,
            }
        )
    }
}
