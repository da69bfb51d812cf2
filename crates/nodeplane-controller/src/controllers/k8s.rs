use nodeplane_core::Result;
use tracing::debug;

use crate::adapter::ControllerAdapter;
use crate::controller::{Controller, Input, Output};
use crate::resources::{HostnameStatusSpec, NodenameSpec, ResourceSpec, HOSTNAME_STATUS_ID, NODENAME_ID};

/// Derives the Kubernetes node name from the node's hostname.
pub struct NodenameController;

#[async_trait::async_trait]
impl Controller for NodenameController {
    fn name(&self) -> &str {
        "k8s.NodenameController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::strong(HostnameStatusSpec::NAMESPACE, HostnameStatusSpec::TYPE).with_id(HOSTNAME_STATUS_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(NodenameSpec::NAMESPACE, NodenameSpec::TYPE)]
    }

    async fn run(&self, r: &mut ControllerAdapter) -> Result<()> {
        while r.next_event().await.is_some() {
            let hostname = match r.get(&HostnameStatusSpec::reference(HOSTNAME_STATUS_ID)) {
                Ok(resource) => resource,
                Err(e) if e.is_not_found() => {
                    // not ready yet, or the hostname went away under an existing node name
                    if r.teardown(&[NodenameSpec::kind()])? > 0 {
                        debug!("hostname gone, nodename removed");
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let status: HostnameStatusSpec = hostname.spec_as()?;
            if status.hostname.is_empty() {
                continue;
            }

            let nodename = status.hostname.to_lowercase();
            r.modify_typed::<NodenameSpec, _>(&NodenameSpec::reference(NODENAME_ID), |spec| {
                spec.nodename = nodename.clone();
                spec.hostname_version = hostname.version();
                Ok(())
            })?;
            debug!(%nodename, "nodename reconciled");

            r.reset_restart_backoff();
        }
        Ok(())
    }
}
