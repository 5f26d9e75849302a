//! Application state management
//!
//! The composition root: every long-lived component is built here once and
//! shared through `Arc`s.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::info;

use crate::app::options::AppOptions;
use crate::cache::route::RouteCache;
use crate::deploy::fsm::StateMachine;
use crate::deploy::health::HealthChecker;
use crate::deploy::manager::ContainerManager;
use crate::deploy::orchestrator::Orchestrator;
use crate::deploy::ports::PortAllocator;
use crate::deploy::runtime::docker::DockerCli;
use crate::deploy::runtime::ContainerRuntime;
use crate::errors::HangarError;
use crate::proxy::router::ProxyState;
use crate::secrets::codec::SecretsCodec;
use crate::store::local::LocalStore;
use crate::store::DeploymentStore;
use crate::workers::reaper::Reaper;

/// Main application state
pub struct AppState {
    pub store: Arc<dyn DeploymentStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub codec: Arc<SecretsCodec>,
    pub fsm: Arc<StateMachine>,
    pub ports: Arc<PortAllocator>,
    pub health: Arc<HealthChecker>,
    pub manager: Arc<ContainerManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub routes: Arc<RouteCache>,
    pub reaper: Arc<Reaper>,
    pub proxy: Arc<ProxyState>,
}

impl AppState {
    /// Initialize application state against the local docker daemon
    pub async fn init(options: &AppOptions, master_key: &SecretString) -> Result<Self, HangarError> {
        info!("Initializing application state...");

        let codec = SecretsCodec::new(master_key)?;

        let layout = &options.storage.layout;
        layout.setup().await?;

        let store: Arc<dyn DeploymentStore> = if options.storage.persist_store {
            Arc::new(LocalStore::open(layout.store_file()).await?)
        } else {
            Arc::new(LocalStore::in_memory())
        };
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(options.docker_bin.clone()));

        Self::assemble(options, codec, store, runtime)
    }

    /// Wire the components around an existing store and runtime
    pub fn assemble(
        options: &AppOptions,
        codec: SecretsCodec,
        store: Arc<dyn DeploymentStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, HangarError> {
        let codec = Arc::new(codec);
        let fsm = Arc::new(StateMachine::new(store.clone()));
        let ports = Arc::new(PortAllocator::new(
            options.ports.min,
            options.ports.max,
            store.clone(),
        )?);
        let routes = Arc::new(RouteCache::new(
            options.storage.route_cache_ttl,
            options.storage.route_cache_capacity,
        ));
        let health = Arc::new(HealthChecker::new(
            fsm.clone(),
            routes.clone(),
            options.health.clone(),
        ));

        let manager = Arc::new(ContainerManager::new(
            fsm.clone(),
            ports.clone(),
            runtime.clone(),
            health.clone(),
            options.storage.layout.clone(),
            options.manager.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            fsm.clone(),
            codec.clone(),
            manager.clone(),
            routes.clone(),
        ));
        let reaper = Arc::new(Reaper::new(
            fsm.clone(),
            runtime.clone(),
            routes.clone(),
            options.reaper.clone(),
        ));
        let proxy = Arc::new(ProxyState::new(
            store.clone(),
            routes.clone(),
            options.proxy.clone(),
        )?);

        Ok(Self {
            store,
            runtime,
            codec,
            fsm,
            ports,
            health,
            manager,
            orchestrator,
            routes,
            reaper,
            proxy,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), HangarError> {
        info!("Shutting down application state...");
        self.health.shutdown();
        self.routes.clear();
        Ok(())
    }
}
