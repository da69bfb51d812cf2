//! Controller runtime: registration table and supervised execution.

use nodeplane_core::{Error, ResourceKind, Result};
use nodeplane_state::State;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::adapter::ControllerAdapter;
use crate::controller::{Controller, OutputKind};

/// Restart delay for failed controllers: `base_ms * multiplier^attempt`, capped at `max_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            multiplier: 2.0,
            max_ms: 30_000,
        }
    }
}

impl BackoffConfig {
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = self.base_ms as f64 * self.multiplier.powi(attempt.min(64) as i32);
        Duration::from_millis((ms as u64).min(self.max_ms))
    }
}

struct Registration {
    name: String,
    kind: OutputKind,
}

pub struct Runtime {
    state: Arc<State>,
    controllers: Vec<Arc<dyn Controller>>,
    owners: HashMap<ResourceKind, Registration>,
    backoff: BackoffConfig,
}

impl Runtime {
    pub fn new(state: Arc<State>) -> Self {
        Self {
            state,
            controllers: Vec::new(),
            owners: HashMap::new(),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Register a controller. Nothing is recorded if the controller's name
    /// is taken or one of its outputs collides with an existing owner.
    pub fn register(&mut self, controller: impl Controller + 'static) -> Result<()> {
        self.register_arc(Arc::new(controller))
    }

    pub fn register_arc(&mut self, controller: Arc<dyn Controller>) -> Result<()> {
        let name = controller.name().to_string();
        if self.controllers.iter().any(|c| c.name() == name) {
            return Err(Error::validation(format!(
                "controller {} is already registered",
                name
            )));
        }

        let outputs = controller.outputs();
        for output in &outputs {
            let kind = output.resource_kind();
            if let Some(existing) = self.owners.get(&kind) {
                if existing.kind == OutputKind::Exclusive || output.kind == OutputKind::Exclusive {
                    return Err(Error::validation(format!(
                        "{} output {} conflicts with {} ({:?})",
                        name, kind, existing.name, existing.kind
                    )));
                }
            }
        }

        for output in outputs {
            self.owners.insert(
                output.resource_kind(),
                Registration {
                    name: name.clone(),
                    kind: output.kind,
                },
            );
        }
        info!(controller = %name, "registered");
        self.controllers.push(controller);
        Ok(())
    }

    pub fn controller_names(&self) -> Vec<String> {
        self.controllers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Owner of an exclusive output kind, if any.
    pub fn exclusive_owner(&self, kind: &ResourceKind) -> Option<&str> {
        self.owners
            .get(kind)
            .filter(|r| r.kind == OutputKind::Exclusive)
            .map(|r| r.name.as_str())
    }

    /// Run every registered controller until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        for controller in self.controllers {
            tracker.spawn(supervise(
                controller,
                self.state.clone(),
                self.backoff.clone(),
                cancel.clone(),
            ));
        }
        tracker.close();
        tracker.wait().await;
        info!("controller runtime stopped");
        Ok(())
    }
}

async fn supervise(
    controller: Arc<dyn Controller>,
    state: Arc<State>,
    backoff: BackoffConfig,
    cancel: CancellationToken,
) {
    let name = controller.name().to_string();
    let attempts = Arc::new(AtomicU32::new(0));

    loop {
        let mut adapter =
            ControllerAdapter::new(&*controller, state.clone(), cancel.clone(), attempts.clone());
        let task_controller = controller.clone();
        // panics surface as JoinError instead of tearing down the runtime
        let outcome = tokio::spawn(async move { task_controller.run(&mut adapter).await }).await;

        if cancel.is_cancelled() {
            info!(controller = %name, "stopped");
            return;
        }

        let reason = match outcome {
            Ok(Ok(())) => {
                info!(controller = %name, "finished");
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(join) if join.is_panic() => "controller panicked".to_string(),
            Err(join) => join.to_string(),
        };

        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        let delay = backoff.delay(attempt);
        error!(
            controller = %name,
            error = %reason,
            attempt,
            retry_in_ms = delay.as_millis() as u64,
            "controller failed, restarting"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(controller = %name, "cancelled during restart backoff");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
