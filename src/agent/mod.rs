//! Cluster-side half of the controller protocol.

pub mod client;
pub mod health;
pub mod heartbeat;

pub use client::{AgentError, BackendClient, ControlPlaneClient, Registration};
pub use heartbeat::HeartbeatLoop;
