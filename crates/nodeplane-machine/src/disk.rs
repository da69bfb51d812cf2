//! Block device operations used by upgrade and reset.

use nodeplane_core::{Error, Result};
use std::sync::Mutex;
use tracing::info;

/// Partition labels on an installed system disk.
pub const SYSTEM_PARTITIONS: &[&str] = &["EFI", "BOOT", "META", "STATE", "EPHEMERAL"];
pub const EPHEMERAL_PARTITION: &str = "EPHEMERAL";

#[async_trait::async_trait]
pub trait Disks: Send + Sync {
    /// Device holding the installed system, `None` when the node runs from
    /// install media only.
    fn system_disk(&self) -> Option<String>;

    /// Destroy partition tables and the leading blocks of a user disk.
    async fn fast_wipe(&self, device: &str) -> Result<()>;

    async fn wipe_partition(&self, label: &str) -> Result<()>;

    /// Wipe the whole system disk.
    async fn reset_system_disk(&self) -> Result<()>;
}

/// In-memory disk layout. Records every wipe in order.
pub struct MemoryDisks {
    system_disk: Option<String>,
    user_disks: Vec<String>,
    wiped: Mutex<Vec<String>>,
}

impl MemoryDisks {
    pub fn installed(system_disk: impl Into<String>) -> Self {
        Self {
            system_disk: Some(system_disk.into()),
            user_disks: Vec::new(),
            wiped: Mutex::new(Vec::new()),
        }
    }

    pub fn not_installed() -> Self {
        Self {
            system_disk: None,
            user_disks: Vec::new(),
            wiped: Mutex::new(Vec::new()),
        }
    }

    pub fn with_user_disk(mut self, device: impl Into<String>) -> Self {
        self.user_disks.push(device.into());
        self
    }

    /// Everything wiped so far: device paths and `label:<LABEL>` entries.
    pub fn wiped(&self) -> Vec<String> {
        self.wiped
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    fn record(&self, what: String) {
        if let Ok(mut wiped) = self.wiped.lock() {
            wiped.push(what);
        }
    }
}

#[async_trait::async_trait]
impl Disks for MemoryDisks {
    fn system_disk(&self) -> Option<String> {
        self.system_disk.clone()
    }

    async fn fast_wipe(&self, device: &str) -> Result<()> {
        if !self.user_disks.iter().any(|d| d == device) {
            return Err(Error::NotFound(format!("user disk {}", device)));
        }
        info!(%device, "fast wiping user disk");
        self.record(device.to_string());
        Ok(())
    }

    async fn wipe_partition(&self, label: &str) -> Result<()> {
        if self.system_disk.is_none() || !SYSTEM_PARTITIONS.contains(&label) {
            return Err(Error::NotFound(format!("system partition {}", label)));
        }
        info!(%label, "wiping system partition");
        self.record(format!("label:{}", label));
        Ok(())
    }

    async fn reset_system_disk(&self) -> Result<()> {
        let disk = self
            .system_disk
            .clone()
            .ok_or_else(|| Error::precondition("not installed"))?;
        info!(%disk, "wiping system disk");
        self.record(disk);
        Ok(())
    }
}
