//! Docker-compatible wire types and stream framing

pub mod mux;
pub mod types;

pub use types::*;
