//! Sockerless backend daemon
//!
//! Serves the backend over the internal HTTP API at `/internal/v1`. Attach
//! and exec hijack the connection; `/agent/connect` upgrades to WebSocket.

pub mod error;
pub mod extract;
pub mod handlers;
pub mod hijack;
pub mod metrics;
mod router;
mod server;

pub use error::{ApiError, ApiResult};
pub use router::{router, AppState, API_PREFIX};
pub use server::{DaemonConfig, SockerlessDaemon, DEFAULT_ADDR};
