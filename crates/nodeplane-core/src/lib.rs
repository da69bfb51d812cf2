//! Nodeplane Core - Types, wire protocol, and error handling

pub mod api;
pub mod error;
pub mod protocol;
pub mod types;

pub use api::*;
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
