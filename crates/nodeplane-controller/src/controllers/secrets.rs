use nodeplane_core::{Error, Result};
use regex::Regex;
use tracing::debug;

use crate::adapter::ControllerAdapter;
use crate::controller::{Controller, Input, Output};
use crate::resources::{
    KubeletSecretsSpec, MachineConfigSpec, ResourceSpec, KUBELET_SECRETS_ID, MACHINE_CONFIG_ID,
};

/// Derives the secrets the kubelet needs to join the cluster from the
/// machine configuration.
pub struct KubeletController;

#[async_trait::async_trait]
impl Controller for KubeletController {
    fn name(&self) -> &str {
        "secrets.KubeletController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(MachineConfigSpec::NAMESPACE, MachineConfigSpec::TYPE).with_id(MACHINE_CONFIG_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(KubeletSecretsSpec::NAMESPACE, KubeletSecretsSpec::TYPE)]
    }

    async fn run(&self, r: &mut ControllerAdapter) -> Result<()> {
        while r.next_event().await.is_some() {
            let config = match r.get_typed::<MachineConfigSpec>(&MachineConfigSpec::reference(MACHINE_CONFIG_ID)) {
                Ok(config) => config,
                Err(e) if e.is_not_found() => {
                    r.teardown(&[KubeletSecretsSpec::kind()])?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let secrets = kubelet_secrets(&config)?;
            r.modify_typed::<KubeletSecretsSpec, _>(&KubeletSecretsSpec::reference(KUBELET_SECRETS_ID), |spec| {
                *spec = secrets.clone();
                Ok(())
            })?;
            debug!(endpoint = %secrets.endpoint, "kubelet secrets reconciled");

            r.reset_restart_backoff();
        }
        Ok(())
    }
}

/// API server endpoint the kubelet talks to.
pub fn kubelet_endpoint(config: &MachineConfigSpec) -> String {
    if config.api_server_balancer.enabled {
        format!("https://localhost:{}", config.api_server_balancer.port)
    } else if config.machine_type.is_control_plane() {
        format!("https://localhost:{}", config.local_api_server_port)
    } else {
        config.cluster_endpoint.clone()
    }
}

pub fn kubelet_secrets(config: &MachineConfigSpec) -> Result<KubeletSecretsSpec> {
    let ca = config
        .cluster_ca
        .clone()
        .filter(|ca| !ca.is_empty())
        .ok_or_else(|| Error::Internal("missing cluster.CA secret".into()))?;
    let (token_id, token_secret) = split_bootstrap_token(&config.bootstrap_token)?;

    Ok(KubeletSecretsSpec {
        endpoint: kubelet_endpoint(config),
        ca,
        bootstrap_token_id: token_id,
        bootstrap_token_secret: token_secret,
    })
}

fn split_bootstrap_token(token: &str) -> Result<(String, String)> {
    let re = Regex::new(r"^([a-z0-9]{6})\.([a-z0-9]{16})$")
        .map_err(|e| Error::Internal(e.to_string()))?;
    let caps = re
        .captures(token)
        .ok_or_else(|| Error::validation("bootstrap token must look like <6 chars>.<16 chars>"))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}
