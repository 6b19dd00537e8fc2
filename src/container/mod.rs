//! Container supervision
//!
//! Health checks and restart policies for running containers.

pub mod health;
pub mod restart;

pub use health::HealthSupervisor;
pub use restart::{should_restart, Relauncher, RestartManager};
