//! Nodeplane Machine - node-level operations and their execution
//!
//! The [`Dispatcher`] validates upgrade and reset requests, mints an actor id
//! and hands the work to the [`SequenceExecutor`] on a detached task. The
//! executor runs one sequence at a time and reports every phase on the
//! [`EventBus`].

pub mod bootloader;
pub mod disk;
pub mod dispatcher;
pub mod events;
pub mod health;
pub mod image;
pub mod power;
pub mod sequence;

pub use bootloader::BootConfig;
pub use disk::{Disks, MemoryDisks};
pub use dispatcher::Dispatcher;
pub use events::EventBus;
pub use health::{Cluster, StandaloneCluster};
pub use image::ImageRef;
pub use power::{Power, PowerAction, SimulatedPower};
pub use sequence::{Phase, Sequence, SequenceExecutor};
