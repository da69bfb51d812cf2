//! Waits for a node-level action to take effect.
//!
//! The tracker captures the node's boot id, starts the action, then follows
//! the node's event stream until a ready event shows up and the post-check
//! confirms the action actually happened. Dropped connections are expected
//! while a node reboots and only lead to a reconnect.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use nodeplane_core::{ActorId, Error, EventPayload, MachineEvent, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The node as seen by the tracker.
#[async_trait]
pub trait Node: Send + Sync {
    /// Identifier of the node's current boot.
    async fn boot_id(&self) -> Result<String>;

    /// Events for `actor` plus node-wide events, starting with what the node
    /// still has in its backlog.
    async fn watch_events(&self, actor: &ActorId) -> Result<BoxStream<'static, Result<MachineEvent>>>;
}

/// Final confirmation, run each time a ready event is seen.
#[async_trait]
pub trait PostCheck: Send + Sync {
    async fn check(&self, node: &dyn Node, pre_boot_id: &str) -> Result<()>;
}

/// Passes once the node runs under a different boot id than before the action.
pub struct BootIdChanged;

#[async_trait]
impl PostCheck for BootIdChanged {
    async fn check(&self, node: &dyn Node, pre_boot_id: &str) -> Result<()> {
        let current = node.boot_id().await?;
        if current == pre_boot_id {
            return Err(Error::precondition(format!(
                "boot id {} unchanged, node has not rebooted yet",
                current
            )));
        }
        debug!(previous = pre_boot_id, %current, "boot id changed");
        Ok(())
    }
}

pub type ReadyFn = Box<dyn Fn(&ActorId, &MachineEvent) -> bool + Send + Sync>;

/// Ready once the node reports itself running again.
pub fn machine_ready() -> ReadyFn {
    Box::new(|_, event| event.is_machine_ready())
}

/// Ready once the actor's sequence stopped without error.
pub fn sequence_completed() -> ReadyFn {
    Box::new(|actor, event| {
        event.is_for(actor)
            && matches!(
                &event.payload,
                EventPayload::Sequence {
                    action: nodeplane_core::EventAction::Stop,
                    error: None,
                    ..
                }
            )
    })
}

pub struct Tracker {
    node: Arc<dyn Node>,
    ready: ReadyFn,
    post_check: Option<Box<dyn PostCheck>>,
    timeout: Duration,
    debug: bool,
    reconnect_delay: Duration,
}

impl Tracker {
    pub fn new(node: Arc<dyn Node>, ready: ReadyFn) -> Self {
        Self {
            node,
            ready,
            post_check: None,
            timeout: Duration::from_secs(30 * 60),
            debug: false,
            reconnect_delay: Duration::from_secs(1),
        }
    }

    pub fn with_post_check(mut self, check: impl PostCheck + 'static) -> Self {
        self.post_check = Some(Box::new(check));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Log every event received.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Start the action with `start` and wait for it to take effect.
    ///
    /// Fails with [`Error::Timeout`] when the deadline passes, or with
    /// [`Error::ActionFailed`] when the node reports the sequence failed.
    /// Cancelling the returned future only stops the local wait.
    pub async fn run<F, Fut>(&self, start: F) -> Result<ActorId>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ActorId>>,
    {
        let pre_boot_id = self.node.boot_id().await?;
        let actor = start().await?;
        info!(%actor, "waiting for action to complete");

        match tokio::time::timeout(self.timeout, self.follow(&actor, &pre_boot_id)).await {
            Ok(result) => result.map(|()| actor),
            Err(_) => Err(Error::Timeout(format!(
                "action {} did not complete within {:?}",
                actor, self.timeout
            ))),
        }
    }

    async fn follow(&self, actor: &ActorId, pre_boot_id: &str) -> Result<()> {
        // node-wide events from before the action started are replayed too, so
        // they only count once the actor has shown up. That holds across
        // reconnects: a rebooted node has no backlog for the actor.
        let mut started = false;
        loop {
            match self.node.watch_events(actor).await {
                Ok(events) => {
                    if self.consume(actor, pre_boot_id, events, &mut started).await? {
                        return Ok(());
                    }
                }
                Err(e) => warn!("event stream unavailable: {}", e),
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// Ok(true) once done, Ok(false) when the stream ended first.
    async fn consume(
        &self,
        actor: &ActorId,
        pre_boot_id: &str,
        mut events: BoxStream<'static, Result<MachineEvent>>,
        started: &mut bool,
    ) -> Result<bool> {
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!("event stream interrupted: {}", e);
                    return Ok(false);
                }
            };
            if self.debug {
                info!(id = event.id, actor = ?event.actor_id, payload = ?event.payload, "event");
            }

            if event.is_for(actor) {
                *started = true;
                if let Some(err) = event.sequence_error() {
                    return Err(Error::ActionFailed(err.to_string()));
                }
            } else if !*started {
                continue;
            }

            if !(self.ready)(actor, &event) {
                continue;
            }
            match &self.post_check {
                None => return Ok(true),
                Some(check) => match check.check(&*self.node, pre_boot_id).await {
                    Ok(()) => return Ok(true),
                    Err(e) => debug!("post-check not satisfied yet: {}", e),
                },
            }
        }
        Ok(false)
    }
}
