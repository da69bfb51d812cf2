//! Nodeplane State - the versioned resource graph shared by every controller

pub mod filter;
pub mod state;

pub use filter::{AccessPolicy, Decision, FilteredState};
pub use state::{State, Watch};
