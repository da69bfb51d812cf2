//! Resource definitions shared by the sample controllers and the machine layer.

use nodeplane_core::{ResourceKind, ResourceRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod ns {
    pub const CONFIG: &str = "config";
    pub const SECRETS: &str = "secrets";
    pub const SIDEROLINK: &str = "siderolink";
    pub const NETWORK: &str = "network";
    pub const K8S: &str = "k8s";
    pub const RUNTIME: &str = "runtime";
}

/// Id of the active machine configuration document.
pub const MACHINE_CONFIG_ID: &str = "v1alpha1";
pub const KUBELET_SECRETS_ID: &str = "kubelet";
pub const SIDEROLINK_CONFIG_ID: &str = "siderolink";
pub const HOSTNAME_STATUS_ID: &str = "hostname";
pub const NODENAME_ID: &str = "nodename";
pub const STAGED_UPGRADE_ID: &str = "staged";

/// A typed resource spec bound to its (namespace, type).
pub trait ResourceSpec: Serialize + DeserializeOwned + Default {
    const NAMESPACE: &'static str;
    const TYPE: &'static str;

    fn kind() -> ResourceKind {
        ResourceKind::new(Self::NAMESPACE, Self::TYPE)
    }

    fn reference(id: &str) -> ResourceRef {
        Self::kind().resource(id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    #[default]
    Worker,
    Controlplane,
}

impl MachineType {
    pub fn is_control_plane(self) -> bool {
        matches!(self, MachineType::Controlplane)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerBalancer {
    pub enabled: bool,
    pub port: u16,
}

/// Root object written by whoever applies configuration to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfigSpec {
    pub machine_type: MachineType,
    pub cluster_endpoint: String,
    /// PEM encoded cluster CA certificate.
    pub cluster_ca: Option<String>,
    /// Bootstrap token in `<id>.<secret>` form.
    pub bootstrap_token: String,
    pub local_api_server_port: u16,
    pub api_server_balancer: ApiServerBalancer,
    pub siderolink_api_url: Option<String>,
}

impl Default for MachineConfigSpec {
    fn default() -> Self {
        Self {
            machine_type: MachineType::default(),
            cluster_endpoint: String::new(),
            cluster_ca: None,
            bootstrap_token: String::new(),
            local_api_server_port: 6443,
            api_server_balancer: ApiServerBalancer::default(),
            siderolink_api_url: None,
        }
    }
}

impl ResourceSpec for MachineConfigSpec {
    const NAMESPACE: &'static str = ns::CONFIG;
    const TYPE: &'static str = "MachineConfig";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeletSecretsSpec {
    pub endpoint: String,
    pub ca: String,
    pub bootstrap_token_id: String,
    pub bootstrap_token_secret: String,
}

impl ResourceSpec for KubeletSecretsSpec {
    const NAMESPACE: &'static str = ns::SECRETS;
    const TYPE: &'static str = "KubeletSecrets";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideroLinkConfigSpec {
    pub api_endpoint: String,
}

impl ResourceSpec for SideroLinkConfigSpec {
    const NAMESPACE: &'static str = ns::SIDEROLINK;
    const TYPE: &'static str = "SideroLinkConfig";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostnameStatusSpec {
    pub hostname: String,
    pub domainname: String,
}

impl HostnameStatusSpec {
    pub fn fqdn(&self) -> String {
        if self.domainname.is_empty() {
            self.hostname.clone()
        } else {
            format!("{}.{}", self.hostname, self.domainname)
        }
    }
}

impl ResourceSpec for HostnameStatusSpec {
    const NAMESPACE: &'static str = ns::NETWORK;
    const TYPE: &'static str = "HostnameStatus";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodenameSpec {
    pub nodename: String,
    pub hostname_version: u64,
}

impl ResourceSpec for NodenameSpec {
    const NAMESPACE: &'static str = ns::K8S;
    const TYPE: &'static str = "Nodename";
}

/// Upgrade recorded by a staged upgrade, applied on the next boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedUpgradeSpec {
    pub image: String,
    pub actor_id: String,
    pub preserve: bool,
}

impl ResourceSpec for StagedUpgradeSpec {
    const NAMESPACE: &'static str = ns::RUNTIME;
    const TYPE: &'static str = "StagedUpgrade";
}
