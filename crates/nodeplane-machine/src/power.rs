//! Power state transitions and the boot identifier they change.

use nodeplane_core::{MachineStage, Result};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::info;

use crate::events::EventBus;

const HOST_BOOT_ID: &str = "/proc/sys/kernel/random/boot_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Reboot,
    Shutdown,
}

#[async_trait::async_trait]
pub trait Power: Send + Sync {
    /// Identifier of the current boot. Changes on every reboot.
    fn boot_id(&self) -> String;

    async fn reboot(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Boot id of the host kernel, or a fresh random one where unavailable.
pub fn host_boot_id() -> String {
    std::fs::read_to_string(HOST_BOOT_ID)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// A node whose power transitions are simulated: a reboot rotates the boot
/// id and replays the boot status events after `reboot_delay`.
pub struct SimulatedPower {
    boot_id: Arc<RwLock<String>>,
    events: EventBus,
    reboot_delay: Duration,
    actions: Mutex<Vec<PowerAction>>,
}

impl SimulatedPower {
    pub fn new(boot_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            boot_id: Arc::new(RwLock::new(boot_id.into())),
            events,
            reboot_delay: Duration::from_millis(500),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reboot_delay(mut self, delay: Duration) -> Self {
        self.reboot_delay = delay;
        self
    }

    pub fn actions(&self) -> Vec<PowerAction> {
        self.actions
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    fn record(&self, action: PowerAction) {
        if let Ok(mut actions) = self.actions.lock() {
            actions.push(action);
        }
    }
}

#[async_trait::async_trait]
impl Power for SimulatedPower {
    fn boot_id(&self) -> String {
        self.boot_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    async fn reboot(&self) -> Result<()> {
        info!("rebooting");
        self.record(PowerAction::Reboot);
        self.events.status(MachineStage::Rebooting, false);

        let boot_id = self.boot_id.clone();
        let events = self.events.clone();
        let delay = self.reboot_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let next = uuid::Uuid::new_v4().to_string();
            match boot_id.write() {
                Ok(mut id) => *id = next,
                Err(poisoned) => *poisoned.into_inner() = next,
            }
            events.status(MachineStage::Booting, false);
            events.status(MachineStage::Running, true);
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("shutting down");
        self.record(PowerAction::Shutdown);
        self.events.status(MachineStage::ShuttingDown, false);
        Ok(())
    }
}
