//! Nodeplane Gateway - control API server and the node daemon around it

pub mod auth;
pub mod config;
pub mod node;
pub mod rpc;
pub mod server;
pub mod service;
pub mod ws;

pub use config::DaemonConfig;
pub use node::Node;
pub use server::{router, serve, start_gateway};
pub use service::MachineService;
