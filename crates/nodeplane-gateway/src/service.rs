//! Everything a control connection can reach on the node.

use nodeplane_core::Mode;
use nodeplane_machine::{Dispatcher, EventBus};
use nodeplane_state::{AccessPolicy, FilteredState, State};
use std::sync::Arc;

pub struct MachineService {
    dispatcher: Arc<Dispatcher>,
    state: Arc<State>,
    events: EventBus,
    /// Read policy applied to authenticated callers.
    policy: AccessPolicy,
}

impl MachineService {
    pub fn new(dispatcher: Arc<Dispatcher>, state: Arc<State>, events: EventBus) -> Self {
        Self {
            dispatcher,
            state,
            events,
            policy: AccessPolicy::allow_all(),
        }
    }

    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn mode(&self) -> Mode {
        self.dispatcher.mode()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Read surface for a caller. Anonymous callers never see secrets.
    pub fn reads(&self, authenticated: bool) -> FilteredState {
        let policy = if authenticated {
            self.policy.clone()
        } else {
            AccessPolicy::maintenance()
        };
        FilteredState::new(self.state.clone(), policy)
    }
}
