//! Container networking
//!
//! Networks are records in the store. The synthetic driver does the
//! bookkeeping; on Linux an overlay driver can additionally create real
//! namespaces and bridges.

pub mod driver;
pub mod ipam;
#[cfg(target_os = "linux")]
pub mod linux;

pub use driver::{is_predefined, NetworkDriver, SyntheticNetworkDriver, PREDEFINED_NETWORKS};
pub use ipam::{IpAllocator, IpAssignment};

use crate::store::Store;
use std::sync::Arc;
use tracing::info;

/// Build the network driver, with the Linux overlay when requested
pub fn platform_driver(store: Arc<Store>, linux_net: bool) -> Arc<dyn NetworkDriver> {
    let synthetic = SyntheticNetworkDriver::new(store);
    #[cfg(target_os = "linux")]
    if linux_net {
        info!("Using Linux namespace networking");
        return Arc::new(linux::LinuxNetworkDriver::new(synthetic));
    }
    if linux_net {
        info!("Linux namespace networking unavailable on this platform");
    }
    Arc::new(synthetic)
}
