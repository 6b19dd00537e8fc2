//! Container filesystem plumbing
//!
//! Tar archives for copy-in/copy-out and volume bookkeeping.

pub mod archive;
pub mod volume;

pub use volume::VolumeManager;
