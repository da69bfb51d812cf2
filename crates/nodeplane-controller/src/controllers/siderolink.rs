use nodeplane_core::Result;

use crate::adapter::ControllerAdapter;
use crate::cmdline::{Cmdline, KERNEL_PARAM_SIDEROLINK};
use crate::controller::{Controller, Input, Output};
use crate::resources::{
    MachineConfigSpec, ResourceSpec, SideroLinkConfigSpec, MACHINE_CONFIG_ID, SIDEROLINK_CONFIG_ID,
};

/// Publishes the management-link API endpoint, taken from the machine
/// configuration or, failing that, from the kernel command line.
pub struct ConfigController {
    cmdline: Cmdline,
}

impl ConfigController {
    pub fn new(cmdline: Cmdline) -> Self {
        Self { cmdline }
    }

    pub fn api_endpoint(&self, config: Option<&MachineConfigSpec>) -> Option<String> {
        config
            .and_then(|c| c.siderolink_api_url.clone())
            .filter(|url| !url.is_empty())
            .or_else(|| self.cmdline.get(KERNEL_PARAM_SIDEROLINK).map(String::from))
            .filter(|url| !url.is_empty())
    }
}

#[async_trait::async_trait]
impl Controller for ConfigController {
    fn name(&self) -> &str {
        "siderolink.ConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak(MachineConfigSpec::NAMESPACE, MachineConfigSpec::TYPE).with_id(MACHINE_CONFIG_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive(SideroLinkConfigSpec::NAMESPACE, SideroLinkConfigSpec::TYPE)]
    }

    async fn run(&self, r: &mut ControllerAdapter) -> Result<()> {
        let output = SideroLinkConfigSpec::reference(SIDEROLINK_CONFIG_ID);

        while r.next_event().await.is_some() {
            let config = match r.get_typed::<MachineConfigSpec>(&MachineConfigSpec::reference(MACHINE_CONFIG_ID)) {
                Ok(config) => Some(config),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };

            match self.api_endpoint(config.as_ref()) {
                Some(endpoint) => {
                    r.modify_typed::<SideroLinkConfigSpec, _>(&output, |spec| {
                        spec.api_endpoint = endpoint.clone();
                        Ok(())
                    })?;
                }
                None => match r.destroy(&output) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                },
            }

            r.reset_restart_backoff();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_wins_over_cmdline() {
        let ctrl = ConfigController::new(Cmdline::parse("siderolink.api=https://cmdline:443"));
        let cfg = MachineConfigSpec {
            siderolink_api_url: Some("https://config:443".into()),
            ..Default::default()
        };
        assert_eq!(ctrl.api_endpoint(Some(&cfg)).as_deref(), Some("https://config:443"));
        assert_eq!(ctrl.api_endpoint(None).as_deref(), Some("https://cmdline:443"));
    }

    #[test]
    fn no_source_means_no_endpoint() {
        let ctrl = ConfigController::new(Cmdline::default());
        assert_eq!(ctrl.api_endpoint(Some(&MachineConfigSpec::default())), None);
        let empty = ConfigController::new(Cmdline::parse("siderolink.api="));
        assert_eq!(empty.api_endpoint(None), None);
    }
}
