//! Error types for Nodeplane

use thiserror::Error;

use crate::types::Mode;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad or contradictory request parameters. No actor id is issued.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("{reason} is not supported in {mode} mode")]
    UnsupportedInMode { mode: Mode, reason: String },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic write collision. `State::modify` retries these internally.
    #[error("version conflict on {resource}: expected {expected}, found {actual}")]
    Conflict {
        resource: String,
        expected: u64,
        actual: u64,
    },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("sequence terminated with reboot")]
    TerminalReboot,

    #[error("sequence terminated with shutdown")]
    TerminalShutdown,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("action failed: {0}")]
    ActionFailed(String),

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Error reported by a remote node over RPC.
    #[error("rpc error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const CODE_AUTH: i32 = -32000;
pub const CODE_NOT_FOUND: i32 = -32001;
pub const CODE_PRECONDITION: i32 = -32010;
pub const CODE_UNSUPPORTED: i32 = -32011;
pub const CODE_CONFLICT: i32 = -32012;
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
pub const CODE_INVALID_PARAMS: i32 = -32602;
pub const CODE_INTERNAL: i32 = -32603;

impl Error {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        Self::PreconditionFailed(reason.into())
    }

    pub fn unsupported(mode: Mode, reason: impl Into<String>) -> Self {
        Self::UnsupportedInMode {
            mode,
            reason: reason.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Reboot and shutdown end a sequence as intended; they are not failures.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TerminalReboot | Self::TerminalShutdown)
    }

    /// JSON-RPC error code used on the wire.
    pub fn rpc_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::InvalidMessage(_) => CODE_INVALID_PARAMS,
            Self::PreconditionFailed(_) => CODE_PRECONDITION,
            Self::UnsupportedInMode { .. } => CODE_UNSUPPORTED,
            Self::NotFound(_) => CODE_NOT_FOUND,
            Self::AlreadyExists(_) | Self::Conflict { .. } => CODE_CONFLICT,
            Self::PermissionDenied(_) | Self::AuthFailed { .. } => CODE_AUTH,
            Self::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
            Self::Remote { code, .. } => *code,
            _ => CODE_INTERNAL,
        }
    }
}
