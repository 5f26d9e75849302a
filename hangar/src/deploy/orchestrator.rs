//! Deployment orchestrator
//!
//! Entry point for the API layer. Validates and creates records, opens
//! secrets for the operations that need them, and delegates container work
//! to the [`ContainerManager`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::route::RouteCache;
use crate::deploy::fsm::{StateMachine, TransitionOptions};
use crate::deploy::manager::ContainerManager;
use crate::errors::HangarError;
use crate::models::deployment::{
    Deployment, DeploymentDraft, DeploymentStatus, ModelSelection, SecretFields,
};
use crate::proxy::host::validate_subdomain;
use crate::secrets::codec::SecretsCodec;
use crate::secrets::fields::{open_fields, seal_fields};
use crate::store::{DeploymentStore, DeploymentUpdate, StoreError, UpdateGuard};

pub struct Orchestrator {
    fsm: Arc<StateMachine>,
    codec: Arc<SecretsCodec>,
    manager: Arc<ContainerManager>,
    routes: Arc<RouteCache>,
}

impl Orchestrator {
    pub fn new(
        fsm: Arc<StateMachine>,
        codec: Arc<SecretsCodec>,
        manager: Arc<ContainerManager>,
        routes: Arc<RouteCache>,
    ) -> Self {
        Self {
            fsm,
            codec,
            manager,
            routes,
        }
    }

    fn store(&self) -> &Arc<dyn DeploymentStore> {
        self.fsm.store()
    }

    pub fn manager(&self) -> &Arc<ContainerManager> {
        &self.manager
    }

    /// Validate a draft and persist it as an `idle` deployment with sealed
    /// secrets. Nothing is written when validation fails.
    pub async fn create(&self, draft: DeploymentDraft) -> Result<Deployment, HangarError> {
        validate_subdomain(&draft.subdomain)?;

        if draft.secrets.gateway_token.trim().is_empty() {
            return Err(HangarError::ValidationError(
                "A gateway token is required".to_string(),
            ));
        }
        let model: ModelSelection = draft
            .runtime_config
            .model
            .as_deref()
            .ok_or_else(|| HangarError::ValidationError("A model is required".to_string()))?
            .parse()?;
        model.validate_against(&draft.secrets)?;

        if self.store().find_by_subdomain(&draft.subdomain).await?.is_some() {
            return Err(HangarError::Conflict(format!(
                "Subdomain '{}' is already taken",
                draft.subdomain
            )));
        }

        let sealed = seal_fields(&self.codec, &draft.secrets)?;
        let deployment = Deployment::new(draft.owner_id, draft.subdomain, sealed, draft.runtime_config);
        match self.store().insert(deployment.clone()).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                return Err(HangarError::Conflict(format!(
                    "Subdomain '{}' is already taken",
                    deployment.subdomain
                )))
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            deployment_id = %deployment.id,
            subdomain = %deployment.subdomain,
            "Deployment created"
        );
        Ok(deployment)
    }

    /// Open a deployment's secrets and resolve its model.
    ///
    /// Legacy plaintext fields are re-sealed and written back. Any failure
    /// is recorded on the deployment as `error`.
    async fn prepare(
        &self,
        deployment_id: &str,
        model: Option<ModelSelection>,
    ) -> Result<(SecretFields, ModelSelection), HangarError> {
        let deployment = self.fsm.load(deployment_id).await?;
        match self.open_and_resolve(&deployment, model).await {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                if let Err(record) = self
                    .fsm
                    .transition_to(
                        deployment_id,
                        DeploymentStatus::Error,
                        TransitionOptions::error(e.to_string()),
                    )
                    .await
                {
                    warn!(deployment_id = %deployment_id, error = %record, "Failed to record error");
                }
                Err(e)
            }
        }
    }

    async fn open_and_resolve(
        &self,
        deployment: &Deployment,
        model: Option<ModelSelection>,
    ) -> Result<(SecretFields, ModelSelection), HangarError> {
        let opened = open_fields(&self.codec, &deployment.secrets)?;

        if opened.needs_reseal() {
            let sealed = seal_fields(&self.codec, &opened.fields)?;
            let update = DeploymentUpdate {
                secrets: Some(sealed),
                ..Default::default()
            };
            self.store()
                .update_one(&deployment.id, &UpdateGuard::none(), &update)
                .await?;
            info!(
                deployment_id = %deployment.id,
                fields = ?opened.legacy_fields,
                "Re-sealed legacy plaintext secrets"
            );
        }

        let model = match model {
            Some(model) => model,
            None => deployment
                .runtime_config
                .model
                .as_deref()
                .ok_or_else(|| {
                    HangarError::ValidationError(format!(
                        "deployment {} has no model configured",
                        deployment.id
                    ))
                })?
                .parse()?,
        };
        model.validate_against(&opened.fields)?;

        Ok((opened.fields, model))
    }

    /// Bring a deployment up. Returns the container id.
    pub async fn spawn(
        &self,
        deployment_id: &str,
        model: Option<ModelSelection>,
    ) -> Result<String, HangarError> {
        let (secrets, model) = self.prepare(deployment_id, model).await?;
        let container_id = self
            .manager
            .create_and_start(deployment_id, &secrets, &model)
            .await?;
        self.invalidate_route(deployment_id).await;
        Ok(container_id)
    }

    /// Run [`Orchestrator::spawn`] in the background. Failures are already
    /// recorded on the deployment and only logged here.
    pub fn spawn_detached(
        self: &Arc<Self>,
        deployment_id: &str,
        model: Option<ModelSelection>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let deployment_id = deployment_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.spawn(&deployment_id, model).await {
                error!(deployment_id = %deployment_id, error = %e, "Background spawn failed");
            }
        })
    }

    pub async fn stop(&self, deployment_id: &str) -> Result<Deployment, HangarError> {
        let stopped = self.manager.stop(deployment_id).await?;
        self.routes.invalidate(&stopped.subdomain);
        Ok(stopped)
    }

    pub async fn restart(
        &self,
        deployment_id: &str,
        model: Option<ModelSelection>,
    ) -> Result<String, HangarError> {
        let (secrets, model) = self.prepare(deployment_id, model).await?;
        let container_id = self.manager.restart(deployment_id, &secrets, &model).await?;
        self.invalidate_route(deployment_id).await;
        Ok(container_id)
    }

    /// Tear down the container and data, delete the record and drop its route.
    pub async fn remove(&self, deployment_id: &str) -> Result<(), HangarError> {
        let deployment = self.fsm.load(deployment_id).await?;
        self.manager.remove(deployment_id).await?;
        self.store().delete_one(deployment_id).await?;
        self.routes.invalidate(&deployment.subdomain);
        info!(
            deployment_id = %deployment_id,
            subdomain = %deployment.subdomain,
            "Deployment removed"
        );
        Ok(())
    }

    pub async fn logs(&self, deployment_id: &str, tail: usize) -> Result<String, HangarError> {
        self.manager.logs(deployment_id, tail).await
    }

    pub async fn get(&self, deployment_id: &str) -> Result<Deployment, HangarError> {
        self.fsm.load(deployment_id).await
    }

    async fn invalidate_route(&self, deployment_id: &str) {
        if let Ok(Some(deployment)) = self.store().find_by_id(deployment_id).await {
            self.routes.invalidate(&deployment.subdomain);
        }
    }
}
