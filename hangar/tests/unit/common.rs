//! Shared fixtures

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hangar::app::options::{AppOptions, PortRangeOptions};
use hangar::app::state::AppState;
use hangar::deploy::runtime::mock::MockRuntime;
use hangar::models::deployment::{
    Deployment, DeploymentDraft, DeploymentStatus, RuntimeConfig, SecretFields,
};
use hangar::secrets::codec::{SecretsCodec, KEY_SIZE};
use hangar::storage::layout::StorageLayout;
use hangar::store::local::LocalStore;
use hangar::store::{DeploymentStore, DeploymentUpdate, UpdateGuard};
use tempfile::TempDir;

pub const PORT_MIN: u16 = 47100;
pub const PORT_MAX: u16 = 47109;

pub struct Harness {
    pub state: AppState,
    pub runtime: Arc<MockRuntime>,
    pub dir: TempDir,
}

pub fn codec() -> SecretsCodec {
    SecretsCodec::from_bytes(&[9u8; KEY_SIZE]).unwrap()
}

pub fn test_options(base_dir: &Path) -> AppOptions {
    let mut options = AppOptions::default();
    options.storage.layout = StorageLayout::new(base_dir);
    options.storage.persist_store = false;
    options.ports = PortRangeOptions {
        min: PORT_MIN,
        max: PORT_MAX,
    };
    options.health.interval = Duration::from_millis(20);
    options.health.probe_timeout = Duration::from_millis(50);
    options.reaper.batch_pause = Duration::from_millis(1);
    options
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(configure: impl FnOnce(&mut AppOptions)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options(dir.path());
    configure(&mut options);

    let runtime = Arc::new(MockRuntime::new());
    let store: Arc<dyn DeploymentStore> = Arc::new(LocalStore::in_memory());
    let state = AppState::assemble(&options, codec(), store, runtime.clone()).unwrap();
    Harness {
        state,
        runtime,
        dir,
    }
}

pub fn secrets() -> SecretFields {
    SecretFields {
        gateway_token: "gw-secret".to_string(),
        anthropic_api_key: Some("sk-ant-test".to_string()),
        ..Default::default()
    }
}

pub fn draft(subdomain: &str) -> DeploymentDraft {
    DeploymentDraft {
        owner_id: "owner-1".to_string(),
        subdomain: subdomain.to_string(),
        secrets: secrets(),
        runtime_config: RuntimeConfig {
            model: Some("anthropic/claude-sonnet-4".to_string()),
            ..Default::default()
        },
    }
}

/// Insert a record directly, bypassing validation
pub async fn insert_with(
    store: &Arc<dyn DeploymentStore>,
    subdomain: &str,
    status: DeploymentStatus,
    port: Option<u16>,
    container_ref: Option<&str>,
) -> Deployment {
    let deployment = Deployment::new("owner-1", subdomain, secrets(), RuntimeConfig::default());
    let id = deployment.id.clone();
    store.insert(deployment).await.unwrap();

    let update = DeploymentUpdate {
        status: Some(status),
        internal_port: Some(port),
        container_ref: Some(container_ref.map(str::to_string)),
        ..Default::default()
    };
    store
        .update_one(&id, &UpdateGuard::none(), &update)
        .await
        .unwrap()
        .unwrap()
}
