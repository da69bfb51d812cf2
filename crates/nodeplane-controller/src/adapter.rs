//! Per-controller view of the runtime.
//!
//! Each run attempt of a controller gets a fresh adapter. The adapter feeds
//! wake-ups from the controller's input watches into a single-slot channel,
//! so a burst of input changes is seen as one event. Writes are checked
//! against the controller's declared outputs and stamped with its name.

use nodeplane_core::{Error, Resource, ResourceKind, ResourceRef, Result};
use nodeplane_state::State;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use crate::controller::Controller;

/// Why a controller was woken up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// First event of every run attempt.
    Start,
    /// At least one declared input kind changed.
    Changed,
}

pub struct ControllerAdapter {
    name: String,
    state: Arc<State>,
    readable: HashSet<ResourceKind>,
    writable: HashSet<ResourceKind>,
    events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    restart_attempts: Arc<AtomicU32>,
    _watchers: DropGuard,
}

impl ControllerAdapter {
    /// Build the adapter and start watching the controller's inputs.
    ///
    /// Watches are subscribed before the initial `Start` is delivered, so no
    /// change that happens after the controller's first read can be missed.
    pub fn new(
        controller: &dyn Controller,
        state: Arc<State>,
        cancel: CancellationToken,
        restart_attempts: Arc<AtomicU32>,
    ) -> Self {
        let (tx, events) = mpsc::channel(1);
        let _ = tx.try_send(Event::Start);

        let inputs: HashSet<ResourceKind> = controller
            .inputs()
            .iter()
            .map(|i| i.resource_kind())
            .collect();
        let writable: HashSet<ResourceKind> = controller
            .outputs()
            .iter()
            .map(|o| o.resource_kind())
            .collect();

        let watchers = cancel.child_token();
        for kind in &inputs {
            let mut watch = state.watch(kind);
            let tx = tx.clone();
            let stop = watchers.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        changed = watch.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            // a full slot already carries a pending wake-up
                            let _ = tx.try_send(Event::Changed);
                        }
                    }
                }
            });
        }

        let readable = inputs.union(&writable).cloned().collect();

        Self {
            name: controller.name().to_string(),
            state,
            readable,
            writable,
            events,
            cancel,
            restart_attempts,
            _watchers: watchers.drop_guard(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next wake-up. `None` means the controller must stop.
    pub async fn next_event(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    fn check_read(&self, kind: &ResourceKind) -> Result<()> {
        if self.readable.contains(kind) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{} did not declare {} as an input",
                self.name, kind
            )))
        }
    }

    fn check_write(&self, reference: &ResourceRef) -> Result<()> {
        if !self.writable.contains(&reference.kind()) {
            return Err(Error::PermissionDenied(format!(
                "{} did not declare {} as an output",
                self.name,
                reference.kind()
            )));
        }
        match self.state.get(reference) {
            Ok(existing) => match existing.owner() {
                Some(owner) if owner != self.name => Err(Error::PermissionDenied(format!(
                    "{} is owned by {}, not {}",
                    reference, owner, self.name
                ))),
                _ => Ok(()),
            },
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, reference: &ResourceRef) -> Result<Resource> {
        self.check_read(&reference.kind())?;
        self.state.get(reference)
    }

    pub fn get_typed<T: DeserializeOwned>(&self, reference: &ResourceRef) -> Result<T> {
        self.check_read(&reference.kind())?;
        self.state.get_typed(reference)
    }

    pub fn list(&self, kind: &ResourceKind) -> Result<Vec<Resource>> {
        self.check_read(kind)?;
        Ok(self.state.list(kind))
    }

    pub fn modify<F>(&self, reference: &ResourceRef, transform: F) -> Result<Resource>
    where
        F: FnMut(&mut serde_json::Value) -> Result<()>,
    {
        self.check_write(reference)?;
        self.state.modify(reference, Some(&self.name), transform)
    }

    pub fn modify_typed<T, F>(&self, reference: &ResourceRef, transform: F) -> Result<Resource>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnMut(&mut T) -> Result<()>,
    {
        self.check_write(reference)?;
        self.state.modify_typed(reference, Some(&self.name), transform)
    }

    pub fn destroy(&self, reference: &ResourceRef) -> Result<()> {
        self.check_write(reference)?;
        self.state.destroy(reference)
    }

    /// Destroy every resource of the given output kinds written by this
    /// controller. Returns how many were removed.
    pub fn teardown(&self, kinds: &[ResourceKind]) -> Result<usize> {
        let mut removed = 0;
        for kind in kinds {
            if !self.writable.contains(kind) {
                return Err(Error::PermissionDenied(format!(
                    "{} cannot tear down {}",
                    self.name, kind
                )));
            }
            for resource in self.state.list(kind) {
                if resource.owner() != Some(self.name.as_str()) {
                    continue;
                }
                match self.state.destroy(resource.reference()) {
                    Ok(()) => {
                        trace!(controller = %self.name, resource = %resource.reference(), "torn down");
                        removed += 1;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        if removed > 0 {
            debug!(controller = %self.name, removed, "teardown complete");
        }
        Ok(removed)
    }

    /// Signal a healthy reconcile: the next failure restarts after the base delay.
    pub fn reset_restart_backoff(&self) {
        self.restart_attempts.store(0, Ordering::SeqCst);
    }
}
