//! Daemon configuration, loaded from TOML.
//!
//! Every section is optional. A missing file means all defaults; CLI flags
//! are applied on top by the binary.

use nodeplane_controller::resources::MachineConfigSpec;
use nodeplane_controller::BackoffConfig;
use nodeplane_core::{Error, GatewayConfig, Mode, Result};
use nodeplane_state::AccessPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodeplane/machined.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub mode: Mode,
    pub gateway: GatewayConfig,
    /// Restart backoff for failed controllers.
    pub backoff: BackoffConfig,
    /// Read policy for authenticated callers.
    pub access: AccessPolicy,
    pub events: EventsConfig,
    pub node: NodeConfig,
    /// Machine configuration applied at startup, if any.
    pub machine: Option<MachineConfigSpec>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events retained for late subscribers.
    pub backlog: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { backlog: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub hostname: Option<String>,
    pub domainname: String,
    /// `None` means the node was never installed.
    pub system_disk: Option<String>,
    pub user_disks: Vec<String>,
    /// Boot entry the node is currently running from.
    pub boot_entry: String,
    pub reboot_delay_ms: u64,
    pub kernel_cmdline: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            domainname: String::new(),
            system_disk: Some("/dev/sda".to_string()),
            user_disks: Vec::new(),
            boot_entry: format!("nodeplane-v{}", env!("CARGO_PKG_VERSION")),
            reboot_delay_ms: 500,
            kernel_cmdline: PathBuf::from(nodeplane_controller::cmdline::PROC_CMDLINE),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write logs to this file.
    pub file: Option<PathBuf>,
    pub json: bool,
}

impl DaemonConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeplane_core::{AuthMode, BindMode};

    #[test]
    fn empty_document_is_all_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config.mode, Mode::Metal);
        assert_eq!(config.gateway.port, 50000);
        assert_eq!(config.gateway.auth.mode, AuthMode::Token);
        assert_eq!(config.events.backlog, 1024);
        assert_eq!(config.backoff.base_ms, 100);
        assert_eq!(config.node.system_disk.as_deref(), Some("/dev/sda"));
        assert!(config.machine.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = DaemonConfig::parse(
            r#"
            mode = "maintenance"

            [gateway]
            port = 50001
            bind = "loopback"

            [gateway.auth]
            mode = "none"

            [access]
            deny_namespaces = ["secrets"]

            [node]
            hostname = "worker-1"
            user_disks = ["/dev/sdb"]

            [machine]
            machine_type = "controlplane"
            cluster_endpoint = "https://10.5.0.1:6443"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Maintenance);
        assert_eq!(config.gateway.port, 50001);
        assert!(matches!(config.gateway.bind, BindMode::Loopback));
        assert_eq!(config.gateway.auth.mode, AuthMode::None);
        assert_eq!(config.access.deny_namespaces, vec!["secrets"]);
        assert_eq!(config.node.hostname.as_deref(), Some("worker-1"));
        assert_eq!(config.node.reboot_delay_ms, 500);

        let machine = config.machine.unwrap();
        assert!(machine.machine_type.is_control_plane());
        assert_eq!(machine.local_api_server_port, 6443);
    }

    #[test]
    fn unknown_mode_is_config_error() {
        let err = DaemonConfig::parse(r#"mode = "mainframe""#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
