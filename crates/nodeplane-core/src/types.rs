//! Core types for Nodeplane

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Actor identifier - cheaply cloneable, minted once per accepted mutating request.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ActorId(Arc<str>);

impl ActorId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    /// Mint a fresh id. Ids are random v4 UUIDs and are never reused.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ActorId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for ActorId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ActorId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// A (namespace, type) pair. Watches and lists are keyed by kind.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ResourceKind {
    pub namespace: String,
    #[serde(rename = "type")]
    pub resource_type: String,
}

impl ResourceKind {
    pub fn new(namespace: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type: resource_type.into(),
        }
    }

    pub fn resource(&self, id: impl Into<String>) -> ResourceRef {
        ResourceRef {
            namespace: self.namespace.clone(),
            resource_type: self.resource_type.clone(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.resource_type)
    }
}

/// Full identity of a resource.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ResourceRef {
    pub namespace: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(
        namespace: impl Into<String>,
        resource_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        ResourceKind::new(&self.namespace, &self.resource_type)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.resource_type, self.id)
    }
}

/// Resource metadata. `version` starts at 1 on creation and grows by one on
/// every accepted write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(flatten)]
    pub reference: ResourceRef,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub updated: DateTime<Utc>,
}

/// A versioned object in the resource graph. The spec is opaque JSON; typed
/// access goes through [`Resource::spec_as`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub metadata: Metadata,
    pub spec: serde_json::Value,
}

impl Resource {
    /// Build an unversioned resource, as handed to `create`.
    pub fn new(reference: ResourceRef, spec: serde_json::Value) -> Self {
        Self {
            metadata: Metadata {
                reference,
                version: 0,
                owner: None,
                updated: Utc::now(),
            },
            spec,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.metadata.owner = Some(owner.into());
        self
    }

    pub fn reference(&self) -> &ResourceRef {
        &self.metadata.reference
    }

    pub fn id(&self) -> &str {
        &self.metadata.reference.id
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn owner(&self) -> Option<&str> {
        self.metadata.owner.as_deref()
    }

    pub fn spec_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.spec.clone()).map_err(|e| {
            Error::Internal(format!(
                "resource {} has malformed spec: {}",
                self.metadata.reference, e
            ))
        })
    }
}

/// Platform operating mode of the node.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Metal,
    Cloud,
    Container,
    /// Reduced mode: node booted without a configuration.
    Maintenance,
}

/// Mutating operations gated by [`Mode::supports`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    Upgrade,
    Reset,
    Reboot,
    Shutdown,
}

impl Mode {
    pub fn supports(self, op: Operation) -> bool {
        match self {
            // container nodes share the host kernel and own no disks
            Mode::Container => matches!(op, Operation::Shutdown),
            Mode::Metal | Mode::Cloud | Mode::Maintenance => true,
        }
    }

    /// Reduced modes cannot perform cluster health checks.
    pub fn is_reduced(self) -> bool {
        matches!(self, Mode::Maintenance)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Metal => "metal",
            Mode::Cloud => "cloud",
            Mode::Container => "container",
            Mode::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "metal" => Ok(Mode::Metal),
            "cloud" => Ok(Mode::Cloud),
            "container" => Ok(Mode::Container),
            "maintenance" => Ok(Mode::Maintenance),
            other => Err(Error::Config(format!("unknown platform mode: {}", other))),
        }
    }
}

/// Gateway configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind: BindMode,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_port() -> u16 {
    50000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: BindMode::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// Bind mode for the gateway
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

/// Authentication configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    pub token: Option<String>,
}

/// Authentication mode
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Token,
    None,
}
