//! Nodeplane - client side of the node control API
//!
//! [`client::NodeClient`] talks to a node's control API; the
//! [`action::Tracker`] follows an action until the node confirms it.

pub mod action;
pub mod client;

pub use action::Tracker;
pub use client::NodeClient;
