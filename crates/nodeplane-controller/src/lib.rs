//! Nodeplane Controller - reconciliation loops over the resource graph
//!
//! A [`Controller`] declares the kinds it reads and writes. The [`Runtime`]
//! checks those declarations at registration time, then runs every
//! controller on its own supervised task, restarting failed ones with
//! exponential backoff.

pub mod adapter;
pub mod cmdline;
pub mod controller;
pub mod controllers;
pub mod resources;
pub mod runtime;

pub use adapter::{ControllerAdapter, Event};
pub use cmdline::Cmdline;
pub use controller::{Controller, Input, InputKind, Output, OutputKind};
pub use runtime::{BackoffConfig, Runtime};
