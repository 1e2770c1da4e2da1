pub mod protocol;
pub mod registry;
pub mod sweeper;

pub use registry::{ControllerRegistry, ControllerSnapshot, RegistryError, SweepReport};
pub use sweeper::LivenessSweeper;
