//! Sockerless - a Docker-compatible container control plane
//!
//! Sockerless keeps Docker's object model (containers, images, networks,
//! volumes, exec instances and pods) in memory and hands the actual work to
//! pluggable drivers:
//!
//! - Host processes in per-container roots (sandbox mode)
//! - In-container agents reached over WebSocket, forward or reverse
//! - A synthetic fallback that simulates everything
//!
//! The backend is served over an internal HTTP API consumed by a
//! Docker-API frontend.

pub mod agent;
pub mod api;
pub mod backend;
pub mod config;
pub mod container;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod image;
pub mod network;
pub mod pod;
pub mod storage;
pub mod store;

pub use error::{Result, SockerlessError};
