//! Controller contract

use nodeplane_core::{ResourceKind, Result};

use crate::adapter::ControllerAdapter;

/// How a controller depends on an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// The controller cannot make progress until the input exists.
    Strong,
    /// Absence of the input means the controller's outputs must be torn down.
    Weak,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub namespace: String,
    pub resource_type: String,
    /// Narrow the dependency to a single resource.
    pub id: Option<String>,
    pub kind: InputKind,
}

impl Input {
    pub fn strong(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type: resource_type.into(),
            id: None,
            kind: InputKind::Strong,
        }
    }

    pub fn weak(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            kind: InputKind::Weak,
            ..Self::strong(namespace, resource_type)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::new(&self.namespace, &self.resource_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Exactly one controller in the runtime may write this type.
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub namespace: String,
    pub resource_type: String,
    pub kind: OutputKind,
}

impl Output {
    pub fn exclusive(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type: resource_type.into(),
            kind: OutputKind::Exclusive,
        }
    }

    pub fn shared(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Shared,
            ..Self::exclusive(namespace, resource_type)
        }
    }

    pub fn resource_kind(&self) -> ResourceKind {
        ResourceKind::new(&self.namespace, &self.resource_type)
    }
}

/// A reconciliation loop.
///
/// `run` is expected to loop on [`ControllerAdapter::next_event`] and return
/// `Ok(())` once it yields `None`, which happens when the runtime is
/// cancelled. Returning an error, or panicking, makes the runtime restart the
/// controller after a backoff.
///
/// To add a controller: implement this trait and register it with
/// [`crate::Runtime::register`].
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Unique name, also recorded as the owner of everything it writes.
    fn name(&self) -> &str;

    fn inputs(&self) -> Vec<Input>;

    fn outputs(&self) -> Vec<Output>;

    async fn run(&self, r: &mut ControllerAdapter) -> Result<()>;
}
