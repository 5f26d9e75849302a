//! Container manager and orchestrator unit tests

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use hangar::app::state::AppState;
use hangar::deploy::runtime::mock::{MockOp, MockRuntime};
use hangar::deploy::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeError,
};
use hangar::errors::HangarError;
use hangar::models::deployment::{DeploymentStatus, ModelSelection};
use hangar::secrets::codec::{is_sealed, SecretsError};
use hangar::store::{DeploymentStore, DeploymentUpdate, UpdateGuard};

use crate::common::{
    codec, draft, harness, harness_with, insert_with, test_options, PORT_MAX, PORT_MIN,
};

fn port_in_use() -> RuntimeError {
    RuntimeError::PortInUse("Bind for 127.0.0.1:47100 failed: port is already allocated".to_string())
}

// ================================= CREATE ===================================== //

#[tokio::test]
async fn test_create_seals_secrets() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("acme")).await.unwrap();

    assert_eq!(created.status, DeploymentStatus::Idle);
    assert!(is_sealed(&created.secrets.gateway_token));

    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_ne!(stored.secrets.gateway_token, "gw-secret");
    assert!(is_sealed(stored.secrets.anthropic_api_key.as_deref().unwrap()));
}

#[tokio::test]
async fn test_token_shaped_secret_reaches_container_unchanged() {
    let h = harness();
    let mut shaped = draft("hexy");
    shaped.secrets.gateway_token = "aa:bb:cc".to_string();
    let created = h.state.orchestrator.create(shaped).await.unwrap();
    assert_ne!(created.secrets.gateway_token, "aa:bb:cc");

    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    let container = h.runtime.container(&container_id).await.unwrap();
    assert_eq!(container.spec.env_value("AGENT_GATEWAY_TOKEN"), Some("aa:bb:cc"));
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_create_rejects_invalid_drafts_without_writing() {
    let h = harness();

    assert!(matches!(
        h.state.orchestrator.create(draft("-acme")).await,
        Err(HangarError::ValidationError(_))
    ));

    assert!(matches!(
        h.state.orchestrator.create(draft("admin")).await,
        Err(HangarError::ValidationError(_))
    ));

    let mut missing_key = draft("nokey");
    missing_key.runtime_config.model = Some("openai/gpt-4o".to_string());
    assert!(matches!(
        h.state.orchestrator.create(missing_key).await,
        Err(HangarError::ValidationError(_))
    ));

    let mut no_token = draft("notoken");
    no_token.secrets.gateway_token = "  ".to_string();
    assert!(matches!(
        h.state.orchestrator.create(no_token).await,
        Err(HangarError::ValidationError(_))
    ));

    for subdomain in ["-acme", "admin", "nokey", "notoken"] {
        assert!(h.state.store.find_by_subdomain(subdomain).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_create_rejects_taken_subdomain() {
    let h = harness();
    h.state.orchestrator.create(draft("acme")).await.unwrap();

    let err = h.state.orchestrator.create(draft("acme")).await.unwrap_err();
    assert!(matches!(err, HangarError::Conflict(_)));
}

// ================================== SPAWN ===================================== //

#[tokio::test]
async fn test_spawn_starts_container() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("acme")).await.unwrap();

    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();

    let stored = h.state.orchestrator.get(&created.id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::Starting);
    assert_eq!(stored.container_ref.as_deref(), Some(container_id.as_str()));
    assert_eq!(stored.internal_port, Some(PORT_MIN));
    assert_eq!(stored.provisioning_step.as_deref(), Some("Waiting for agent"));
    assert!(h.state.health.is_registered(&created.id));

    let container = h.runtime.container(&container_id).await.unwrap();
    assert!(container.running);
    assert_eq!(container.spec.name, format!("hangar-agent-{}", created.id));
    assert_eq!(container.spec.port.host_port, PORT_MIN);
    assert_eq!(container.spec.env_value("AGENT_GATEWAY_TOKEN"), Some("gw-secret"));
    assert_eq!(container.spec.env_value("ANTHROPIC_API_KEY"), Some("sk-ant-test"));
    assert_eq!(h.runtime.pulled_images().await.len(), 1);

    let layout = h.state.manager.layout().deployment(&created.id);
    assert!(layout.agent_config_file().exists().await);
    let config = layout.agent_config_file().read_string().await.unwrap();
    assert!(!config.contains("gw-secret"));
    assert!(!config.contains("sk-ant-test"));

    h.state.health.shutdown();
}

#[tokio::test]
async fn test_spawn_with_explicit_model() {
    let h = harness();
    let mut with_openai = draft("multi");
    with_openai.secrets.openai_api_key = Some("sk-openai".to_string());
    let created = h.state.orchestrator.create(with_openai).await.unwrap();

    let model: ModelSelection = "openai/gpt-4o".parse().unwrap();
    let container_id = h.state.orchestrator.spawn(&created.id, Some(model)).await.unwrap();

    let container = h.runtime.container(&container_id).await.unwrap();
    assert_eq!(container.spec.env_value("AGENT_MODEL"), Some("openai/gpt-4o"));
    assert_eq!(container.spec.env_value("OPENAI_API_KEY"), Some("sk-openai"));
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_concurrent_spawns_get_distinct_ports() {
    let h = harness();
    let mut ids = Vec::new();
    for i in 0..5 {
        let created = h.state.orchestrator.create(draft(&format!("tenant{i}"))).await.unwrap();
        ids.push(created.id);
    }

    let results = join_all(ids.iter().map(|id| h.state.orchestrator.spawn(id, None))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let mut ports = HashSet::new();
    for id in &ids {
        let stored = h.state.store.find_by_id(id).await.unwrap().unwrap();
        let port = stored.internal_port.unwrap();
        assert!((PORT_MIN..=PORT_MAX).contains(&port));
        assert!(ports.insert(port), "port {port} assigned twice");
    }
    assert_eq!(h.state.ports.in_flight_count().await, 0);
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_runtime_port_collision_retries_once() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("retry")).await.unwrap();
    h.runtime.fail_next(MockOp::Start, port_in_use()).await;

    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();

    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Starting);
    assert_eq!(stored.container_ref.as_deref(), Some(container_id.as_str()));
    assert_eq!(h.runtime.containers().await.len(), 1);
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_repeated_port_collision_gives_up() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("stuck")).await.unwrap();
    h.runtime.fail_next(MockOp::Start, port_in_use()).await;
    h.runtime.fail_next(MockOp::Start, port_in_use()).await;

    let err = h.state.orchestrator.spawn(&created.id, None).await.unwrap_err();
    assert!(err.is_port_collision());

    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    assert!(stored
        .error_message
        .unwrap_or_default()
        .starts_with("Port collision"));
    assert!(stored.internal_port.is_none());
    assert!(stored.container_ref.is_none());
    assert!(h.runtime.containers().await.is_empty());
    assert_eq!(h.state.ports.in_flight_count().await, 0);
}

#[tokio::test]
async fn test_start_failure_cleans_up() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("broken")).await.unwrap();
    h.runtime
        .fail_next(
            MockOp::Start,
            RuntimeError::CommandFailed {
                command: "start".to_string(),
                message: "OCI runtime create failed".to_string(),
            },
        )
        .await;

    assert!(h.state.orchestrator.spawn(&created.id, None).await.is_err());

    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    assert!(stored
        .error_message
        .unwrap_or_default()
        .contains("OCI runtime create failed"));
    assert!(stored.container_ref.is_none());
    assert!(h.runtime.containers().await.is_empty());
    assert!(!h.state.health.is_registered(&created.id));
}

#[tokio::test]
async fn test_image_pull_failure_records_error() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("nopull")).await.unwrap();
    h.runtime
        .fail_next(
            MockOp::EnsureImage,
            RuntimeError::CommandFailed {
                command: "pull".to_string(),
                message: "manifest unknown".to_string(),
            },
        )
        .await;

    assert!(h.state.orchestrator.spawn(&created.id, None).await.is_err());
    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    assert!(h.runtime.containers().await.is_empty());

    // a later spawn recovers from error
    h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Starting);
    assert!(stored.error_message.is_none());
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_exhausted_range_surfaces_and_records_error() {
    let h = harness_with(|options| {
        options.ports.max = options.ports.min;
    });
    let first = h.state.orchestrator.create(draft("first")).await.unwrap();
    let second = h.state.orchestrator.create(draft("second")).await.unwrap();
    h.state.orchestrator.spawn(&first.id, None).await.unwrap();

    let err = h.state.orchestrator.spawn(&second.id, None).await.unwrap_err();
    assert!(matches!(err, HangarError::PortsExhausted { .. }));
    let stored = h.state.store.find_by_id(&second.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_leftover_container_is_replaced() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("leftover")).await.unwrap();
    let first = h.state.orchestrator.spawn(&created.id, None).await.unwrap();

    // spawn again while the first container still exists
    let second = h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    assert_ne!(first, second);
    assert!(h.runtime.container(&first).await.is_none());
    assert_eq!(h.runtime.containers().await.len(), 1);
    h.state.health.shutdown();
}

// ================================= SECRETS ==================================== //

#[tokio::test]
async fn test_legacy_plaintext_is_resealed_on_spawn() {
    let h = harness();
    let legacy = insert_with(&h.state.store, "legacy", DeploymentStatus::Idle, None, None).await;
    assert!(!is_sealed(&legacy.secrets.gateway_token));

    let model: ModelSelection = "anthropic/claude-sonnet-4".parse().unwrap();
    h.state.orchestrator.spawn(&legacy.id, Some(model)).await.unwrap();

    let stored = h.state.store.find_by_id(&legacy.id).await.unwrap().unwrap();
    assert!(is_sealed(&stored.secrets.gateway_token));
    assert!(is_sealed(stored.secrets.anthropic_api_key.as_deref().unwrap()));
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_tampered_secret_aborts_spawn() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("tampered")).await.unwrap();

    let mut secrets = created.secrets.clone();
    let token = secrets.gateway_token.clone();
    let flipped = if token.ends_with('0') { '1' } else { '0' };
    secrets.gateway_token = format!("{}{}", &token[..token.len() - 1], flipped);
    h.state
        .store
        .update_one(
            &created.id,
            &UpdateGuard::none(),
            &DeploymentUpdate {
                secrets: Some(secrets),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = h.state.orchestrator.spawn(&created.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        HangarError::SecretsError(SecretsError::Integrity)
    ));
    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    assert!(h.runtime.containers().await.is_empty());
}

// ============================ STOP / RESTART / REMOVE ========================== //

#[tokio::test]
async fn test_stop_running_deployment() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("stopme")).await.unwrap();
    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();

    let stopped = h.state.orchestrator.stop(&created.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert!(stopped.error_message.is_none());
    assert!(!h.state.health.is_registered(&created.id));
    assert!(!h.runtime.container(&container_id).await.unwrap().running);
}

#[tokio::test]
async fn test_stop_idle_is_noop() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("idle")).await.unwrap();

    let stopped = h.state.orchestrator.stop(&created.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Idle);
}

#[tokio::test]
async fn test_stop_tolerates_vanished_container() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("gone")).await.unwrap();
    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    h.runtime.vanish(&container_id).await;

    let stopped = h.state.orchestrator.stop(&created.id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
}

#[tokio::test]
async fn test_restart_existing_container() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("restart")).await.unwrap();
    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    h.state.health.deregister(&created.id);
    h.state
        .fsm
        .transition_to(&created.id, DeploymentStatus::Healthy, Default::default())
        .await
        .unwrap();

    let restarted = h.state.orchestrator.restart(&created.id, None).await.unwrap();
    assert_eq!(restarted, container_id);

    let container = h.runtime.container(&container_id).await.unwrap();
    assert_eq!(container.restarts, 1);
    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Starting);
    assert!(h.state.health.is_registered(&created.id));
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_restart_missing_container_respawns() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("respawn")).await.unwrap();
    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    h.runtime.vanish(&container_id).await;

    let respawned = h.state.orchestrator.restart(&created.id, None).await.unwrap();
    assert_ne!(respawned, container_id);

    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Starting);
    assert_eq!(stored.container_ref.as_deref(), Some(respawned.as_str()));
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_restart_without_container_spawns() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("fresh")).await.unwrap();

    let container_id = h.state.orchestrator.restart(&created.id, None).await.unwrap();
    assert!(h.runtime.container(&container_id).await.is_some());
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_restart_stopped_respawns_when_port_was_taken() {
    let h = harness();
    let a = h.state.orchestrator.create(draft("stale")).await.unwrap();
    let old_container = h.state.orchestrator.spawn(&a.id, None).await.unwrap();
    h.state.orchestrator.stop(&a.id).await.unwrap();
    let old_port = h
        .state
        .store
        .find_by_id(&a.id)
        .await
        .unwrap()
        .unwrap()
        .internal_port
        .unwrap();

    // a stopped deployment no longer holds its port
    let b = insert_with(
        &h.state.store,
        "taker",
        DeploymentStatus::Configuring,
        Some(old_port),
        None,
    )
    .await;

    let container_id = h.state.orchestrator.restart(&a.id, None).await.unwrap();
    assert_ne!(container_id, old_container);
    assert!(h.runtime.container(&old_container).await.is_none());

    let stored = h.state.store.find_by_id(&a.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Starting);
    assert_eq!(stored.container_ref.as_deref(), Some(container_id.as_str()));
    assert_ne!(stored.internal_port, Some(old_port));

    let taker = h.state.store.find_by_id(&b.id).await.unwrap().unwrap();
    assert_eq!(taker.internal_port, Some(old_port));

    let name = h.state.manager.container_name(&a.id);
    let running: Vec<_> = h
        .runtime
        .containers()
        .await
        .into_iter()
        .filter(|c| c.spec.name == name && c.running)
        .collect();
    assert_eq!(running.len(), 1);
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_restart_stops_container_when_record_cannot_follow() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("dropped")).await.unwrap();
    let container_id = h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    h.state.health.deregister(&created.id);
    h.state
        .fsm
        .transition_to(&created.id, DeploymentStatus::Healthy, Default::default())
        .await
        .unwrap();

    // the record vanishes while the runtime restarts the container
    let runtime = Arc::new(DroppingRuntime {
        inner: h.runtime.clone(),
        store: h.state.store.clone(),
        deployment_id: created.id.clone(),
    });
    let state = AppState::assemble(
        &test_options(h.dir.path()),
        codec(),
        h.state.store.clone(),
        runtime,
    )
    .unwrap();

    let result = state.orchestrator.restart(&created.id, None).await;
    assert!(matches!(result, Err(HangarError::NotFound(_))));

    let container = h.runtime.container(&container_id).await.unwrap();
    assert_eq!(container.restarts, 1);
    assert!(!container.running);
    assert!(!state.health.is_registered(&created.id));
}

#[tokio::test]
async fn test_stop_failure_records_error() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("stuck")).await.unwrap();
    h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    h.runtime
        .fail_next(
            MockOp::Stop,
            RuntimeError::CommandFailed {
                command: "stop".to_string(),
                message: "cannot kill container".to_string(),
            },
        )
        .await;

    assert!(h.state.orchestrator.stop(&created.id).await.is_err());

    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    let message = stored.error_message.unwrap_or_default();
    assert!(message.contains("Failed to stop container"));
    assert!(message.contains("cannot kill container"));
}

#[tokio::test]
async fn test_restart_failure_records_error() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("flaky")).await.unwrap();
    h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    h.state.health.deregister(&created.id);
    h.state
        .fsm
        .transition_to(&created.id, DeploymentStatus::Healthy, Default::default())
        .await
        .unwrap();
    h.runtime
        .fail_next(
            MockOp::Restart,
            RuntimeError::CommandFailed {
                command: "restart".to_string(),
                message: "device or resource busy".to_string(),
            },
        )
        .await;

    assert!(h.state.orchestrator.restart(&created.id, None).await.is_err());

    let stored = h.state.store.find_by_id(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeploymentStatus::Error);
    assert!(stored
        .error_message
        .unwrap_or_default()
        .contains("Failed to restart container"));
    assert!(!h.state.health.is_registered(&created.id));
}

#[tokio::test]
async fn test_remove_frees_port_for_reuse() {
    let h = harness_with(|options| {
        options.ports.max = options.ports.min;
    });
    let first = h.state.orchestrator.create(draft("first")).await.unwrap();
    h.state.orchestrator.spawn(&first.id, None).await.unwrap();
    let data_dir = h.state.manager.layout().deployment(&first.id);
    assert!(data_dir.root().exists().await);

    h.state.orchestrator.remove(&first.id).await.unwrap();

    assert!(matches!(
        h.state.orchestrator.get(&first.id).await,
        Err(HangarError::NotFound(_))
    ));
    assert!(h.runtime.containers().await.is_empty());
    assert!(!data_dir.root().exists().await);
    assert!(!h.state.health.is_registered(&first.id));

    let second = h.state.orchestrator.create(draft("second")).await.unwrap();
    h.state.orchestrator.spawn(&second.id, None).await.unwrap();
    let stored = h.state.store.find_by_id(&second.id).await.unwrap().unwrap();
    assert_eq!(stored.internal_port, Some(PORT_MIN));
    h.state.health.shutdown();
}

#[tokio::test]
async fn test_remove_invalidates_route() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("cached")).await.unwrap();
    h.state.proxy.lookup("cached").await.unwrap().unwrap();
    assert!(h.state.routes.get("cached").is_some());

    h.state.orchestrator.remove(&created.id).await.unwrap();
    assert!(h.state.routes.get("cached").is_none());
}

#[tokio::test]
async fn test_logs_require_container() {
    let h = harness();
    let created = h.state.orchestrator.create(draft("logs")).await.unwrap();
    assert!(matches!(
        h.state.orchestrator.logs(&created.id, 10).await,
        Err(HangarError::NotFound(_))
    ));

    h.state.orchestrator.spawn(&created.id, None).await.unwrap();
    let output = h.state.orchestrator.logs(&created.id, 2).await.unwrap();
    assert_eq!(output.lines().count(), 2);
    h.state.health.shutdown();
}

/// Deletes one deployment record whenever a restart goes through.
struct DroppingRuntime {
    inner: Arc<MockRuntime>,
    store: Arc<dyn DeploymentStore>,
    deployment_id: String,
}

#[async_trait]
impl ContainerRuntime for DroppingRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.inner.create(spec).await
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.inner.start(id).await
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        self.inner.stop(id, timeout).await
    }

    async fn restart(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        self.inner.restart(id, timeout).await?;
        self.store.delete_one(&self.deployment_id).await.unwrap();
        Ok(())
    }

    async fn remove(&self, id_or_name: &str, force: bool) -> Result<(), RuntimeError> {
        self.inner.remove(id_or_name, force).await
    }

    async fn inspect(&self, id: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        self.inner.inspect(id).await
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.inner.list(name_prefix).await
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.inner.ensure_image(image).await
    }

    async fn logs(&self, id: &str, tail: usize, timestamps: bool) -> Result<String, RuntimeError> {
        self.inner.logs(id, tail, timestamps).await
    }
}
