//! Backend operations
//!
//! A [`Backend`] owns the store, the driver chains and every supervisor.
//! The operations here are what the HTTP layer calls; they return typed
//! results and never touch request or response types.

pub mod archive;
pub mod containers;
pub mod events;
pub mod exec;
pub mod images;
pub mod launch;
pub mod networks;
pub mod pods;
pub mod resources;
pub mod system;
pub mod volumes;

pub use events::EventBus;
pub use launch::Launcher;
pub use resources::{reconstruct_container_state, ResourceEntry, ResourceRegistry};

use crate::agent::AgentRegistry;
use crate::config::ContextStore;
use crate::container::health::HealthSupervisor;
use crate::container::restart::RestartManager;
use crate::driver::{DriverSet, HostProcessFactory, ProcessFactory};
use crate::image::RegistryClient;
use crate::network::platform_driver;
use crate::storage::volume::VolumeManager;
use crate::store::Store;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Identity reported by `/info` and the management endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDesc {
    /// Backend type, such as `memory` or `ecs-fargate`
    pub name: String,
    /// Storage driver name shown in container inspect
    pub driver: String,
    pub instance_id: String,
}

impl Default for BackendDesc {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            driver: "memory".to_string(),
            instance_id: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }
}

/// Startup switches
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Run container commands as host processes
    pub sandbox: bool,
    /// Create real namespaces for networks (Linux, root only)
    pub linux_net: bool,
    /// Where the resource registry persists
    pub registry_file: Option<PathBuf>,
}

/// Delay before a synthetic container with no stdin stops itself
pub const AUTO_STOP_DELAY: Duration = Duration::from_millis(50);

/// Delay before a synthetic container with open stdin stops itself
pub const AUTO_STOP_INTERACTIVE_DELAY: Duration = Duration::from_millis(200);

/// Delay before an idle interactive container being waited on stops
pub const WAIT_AUTO_STOP_DELAY: Duration = Duration::from_secs(2);

/// Delay after the last exec before a synthetic container stops
pub const EXEC_AUTO_STOP_DELAY: Duration = Duration::from_millis(500);

/// Everything a server needs to answer requests
pub struct Backend {
    pub store: Arc<Store>,
    pub drivers: DriverSet,
    pub agents: Arc<AgentRegistry>,
    pub events: Arc<EventBus>,
    pub registry: RegistryClient,
    pub resources: Arc<ResourceRegistry>,
    pub volumes: VolumeManager,
    pub health: HealthSupervisor,
    pub launcher: Launcher,
    pub restart: Arc<RestartManager>,
    pub contexts: ContextStore,
    pub desc: BackendDesc,
    pub started: Instant,
}

impl Backend {
    /// Build a backend, recovering containers from the resource registry
    pub fn new(desc: BackendDesc, options: BackendOptions) -> Self {
        let store = Arc::new(Store::new());
        store.seed_default_networks();

        let agents = Arc::new(AgentRegistry::new());
        let factory = options.sandbox.then(|| {
            info!("Sandbox process factory enabled");
            Arc::new(HostProcessFactory::default()) as Arc<dyn ProcessFactory>
        });
        let network = platform_driver(store.clone(), options.linux_net);
        let drivers = DriverSet::build(store.clone(), agents.clone(), factory, network);

        let health = HealthSupervisor::new(store.clone(), drivers.exec.clone());
        let launcher = Launcher::new(store.clone(), drivers.clone(), health.clone());
        let restart = RestartManager::install(&store, Arc::new(launcher.clone()));
        let volumes = VolumeManager::new(store.clone(), options.sandbox);

        let resources = Arc::new(ResourceRegistry::new(options.registry_file));
        if let Err(e) = resources.load() {
            warn!("Failed to load resource registry: {}", e);
        }
        reconstruct_container_state(&store, &resources);

        Self {
            store,
            drivers,
            agents,
            events: Arc::new(EventBus::new()),
            registry: RegistryClient::from_env(),
            resources,
            volumes,
            health,
            launcher,
            restart,
            contexts: ContextStore::default(),
            desc,
            started: Instant::now(),
        }
    }

    /// Replace the registry client
    pub fn with_registry(mut self, registry: RegistryClient) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the context store used by `reload` and `status`
    pub fn with_contexts(mut self, contexts: ContextStore) -> Self {
        self.contexts = contexts;
        self
    }

    /// Seconds since the backend was built
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// Run a background task, logging instead of propagating a panic
pub(crate) fn spawn_logged<F>(what: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::spawn(fut).await {
            warn!("Background task {} aborted: {}", what, e);
        }
    });
}
