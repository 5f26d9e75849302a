//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::HangarError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::reaper;

/// Run the Hangar control plane
pub async fn run(
    options: AppOptions,
    master_key: SecretString,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), HangarError> {
    info!("Initializing Hangar...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    // Initialize the app state
    if let Err(e) = init(&options, &master_key, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start Hangar: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }
    drop(master_key);

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    master_key: &SecretString,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, HangarError> {
    let app_state = Arc::new(AppState::init(options, master_key).await?);
    shutdown_manager.with_app_state(app_state.clone())?;

    if options.enable_reaper {
        init_reaper_worker(app_state.clone(), shutdown_manager, shutdown_tx.subscribe())?;
    }

    init_socket_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe())
        .await?;

    Ok(app_state)
}

fn init_reaper_worker(
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), HangarError> {
    info!("Initializing reaper worker...");

    let reaper = app_state.reaper.clone();
    let reaper_handle = tokio::spawn(async move {
        reaper::run(
            reaper,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_reaper_worker_handle(reaper_handle)
}

async fn init_socket_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), HangarError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(app_state.orchestrator.clone());

    let server_handle = serve(
        &options.server,
        Arc::new(server_state),
        app_state.proxy.clone(),
        async move {
            let _ = shutdown_rx.recv().await;
        },
    )
    .await?;

    shutdown_manager.with_socket_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    socket_server_handle: Option<JoinHandle<Result<(), HangarError>>>,
    reaper_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            socket_server_handle: None,
            reaper_worker_handle: None,
        }
    }

    pub fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), HangarError> {
        if self.app_state.is_some() {
            return Err(HangarError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    pub fn with_reaper_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), HangarError> {
        if self.reaper_worker_handle.is_some() {
            return Err(HangarError::ShutdownError("reaper_handle already set".to_string()));
        }
        self.reaper_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_socket_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), HangarError>>,
    ) -> Result<(), HangarError> {
        if self.socket_server_handle.is_some() {
            return Err(HangarError::ShutdownError("server_handle already set".to_string()));
        }
        self.socket_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), HangarError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), HangarError> {
        info!("Shutting down Hangar...");

        // 1. Reaper worker
        if let Some(handle) = self.reaper_worker_handle.take() {
            handle.await.map_err(|e| HangarError::ShutdownError(e.to_string()))?;
        }

        // 2. Socket server
        if let Some(handle) = self.socket_server_handle.take() {
            handle.await.map_err(|e| HangarError::ShutdownError(e.to_string()))??;
        }

        // 3. App state (health pollers)
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
