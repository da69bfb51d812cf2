//! Access-filtered read/watch surface over the store.
//!
//! Callers that must not see every namespace (the unauthenticated maintenance
//! service) get a [`FilteredState`] instead of the store itself. It exposes
//! reads and watches only; writes are not part of the surface at all.

use nodeplane_core::{Error, Resource, ResourceKind, ResourceRef, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::{State, Watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Deny-list over namespaces and kinds. Anything not denied is readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub deny_namespaces: Vec<String>,
    #[serde(default)]
    pub deny_kinds: Vec<ResourceKind>,
}

impl AccessPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Policy for the unauthenticated maintenance service.
    pub fn maintenance() -> Self {
        Self::allow_all().deny_namespace("secrets")
    }

    pub fn deny_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.deny_namespaces.push(namespace.into());
        self
    }

    pub fn deny_kind(mut self, kind: ResourceKind) -> Self {
        self.deny_kinds.push(kind);
        self
    }

    pub fn check(&self, kind: &ResourceKind) -> Decision {
        if self.deny_namespaces.iter().any(|ns| *ns == kind.namespace)
            || self.deny_kinds.contains(kind)
        {
            return Decision::Deny;
        }
        Decision::Allow
    }

    fn enforce(&self, kind: &ResourceKind) -> Result<()> {
        match self.check(kind) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(Error::PermissionDenied(format!("access to {} is denied", kind))),
        }
    }
}

#[derive(Clone)]
pub struct FilteredState {
    state: Arc<State>,
    policy: AccessPolicy,
}

impl FilteredState {
    pub fn new(state: Arc<State>, policy: AccessPolicy) -> Self {
        Self { state, policy }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn get(&self, reference: &ResourceRef) -> Result<Resource> {
        self.policy.enforce(&reference.kind())?;
        self.state.get(reference)
    }

    pub fn list(&self, kind: &ResourceKind) -> Result<Vec<Resource>> {
        self.policy.enforce(kind)?;
        Ok(self.state.list(kind))
    }

    pub fn watch(&self, kind: &ResourceKind) -> Result<Watch> {
        self.policy.enforce(kind)?;
        Ok(self.state.watch(kind))
    }
}
